pub mod buffer;
pub mod collector;
pub mod runner;
pub mod shipper;
pub mod tailer;

pub use runner::AgentRunner;
