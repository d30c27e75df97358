pub mod batch;
pub mod entry;
pub mod query;

pub use batch::Batch;
pub use entry::{LogEntry, LogLevel};
pub use query::{SearchQuery, SearchResult, SortOrder, TimeRange};
