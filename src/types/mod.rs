//! Request and report types for snippet execution.

mod report;
mod request;

pub use report::{timeout_description, ExecutionReport, ExecutionStats, Outcome, ReportBuilder};
pub use request::{CodeDigest, ExecutionRequest, DEFAULT_TIMEOUT_SECS};
