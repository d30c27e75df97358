//! Distributed log aggregation pipeline.
//!
//! Two deployables share this crate: the *agent* (`logpipe-agent`)
//! collects, buffers, batches and ships log records from hosts; the
//! *server* (`logpipe-server`) authenticates, rate-limits, parses,
//! transforms and stores them in a time-partitioned, queryable archive.

pub mod agent;
pub mod config;
pub mod model;
pub mod parser;
pub mod server;
