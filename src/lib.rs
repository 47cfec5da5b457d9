/*!
 * ERP Gateway - multi-instance gateway to session-authenticated ERP endpoints
 *
 * - Named instances with lazily established, self-healing sessions
 * - TTL cache of read results with per-model invalidation on writes
 * - Classified retries with exponential backoff and transparent re-login
 * - Chunked parallel batches with partial-failure reporting
 * - Paged CSV and JSON export of search results
 */

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod gateway;
pub mod invoker;
pub mod logging;
pub mod metrics;
pub mod outcome;
pub mod protocol;
pub mod registry;
pub mod session;

// Re-export commonly used types
pub use batch::{
    BatchExecutor, BatchJob, BatchOptions, BatchProgress, ChunkOperation, ChunkPayload,
    ChunkReport, ChunkSink, ChunkStatus, CollectSink, ItemFailure, JobStatus,
};
pub use cache::{CacheEpoch, CachePolicy, CacheStats, Fingerprint, ResultCache};
pub use config::{EnvSource, GatewayConfig, InstanceConfig};
pub use error::{ErrorKind, GatewayError, RemoteDiagnostic, Result};
pub use export::{ExportFormat, ExportRequest, ExportSummary, ExportWriter};
pub use gateway::{BatchOperation, BatchRequest, Gateway, PagedRead, SearchQuery};
pub use invoker::RemoteInvoker;
pub use outcome::{Outcome, OutcomeStatus};
pub use protocol::{RemoteCall, RpcArgs, RpcTransport};
pub use registry::{InstanceInfo, InstanceRegistry};
pub use session::{SessionHandle, SessionLimits};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
