//! Core pipeline logic for MCP Insider.
//!
//! - [`merge`]: retention, sequential enrichment, and reconciliation
//! - [`enrichment`]: the text-generation capability and sticky model fallback
//! - [`pipeline`]: the analysis pass and the scheduled collect-then-analyze flow
//! - [`scheduler`]: the interval-adaptive timer and config change watcher
//! - [`news`]: the summarized news digest built from configured feeds
//! - [`gateway`]: stage subprocesses streamed as events
//! - [`admin`]: operator edits to catalog, settings, and collector config

pub mod admin;
pub mod enrichment;
pub mod gateway;
pub mod merge;
pub mod news;
pub mod pipeline;
pub mod scheduler;
