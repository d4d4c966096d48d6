pub mod backoff;
pub mod callback;
pub mod chunk;
pub mod collector;
pub mod context;
pub mod dedup;
pub mod error;
pub mod filter;
pub mod loop_detector;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod profile;
pub mod rate_limit;
pub mod session;
pub mod task;
pub mod traits;
pub mod util;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use callback::{CallbackChannel, CallbackConfig, CallbackEvent};
pub use chunk::{ChunkConfig, ChunkSender, UrlChunk};
pub use collector::{CollectLimits, CollectOutcome, Collector, StopReason, TracingCollectReporter};
pub use context::{ContextPool, ExecutionMode, RunContext};
pub use error::{AppError, ErrorCode, ExtractError};
pub use metrics::{RunStatus, RunSummary};
pub use models::{CandidateUrl, ProductRecord, compute_hash};
pub use profile::{AdapterKind, SupplierProfile};
pub use rate_limit::RateLimitConfig;
pub use session::{PhaseDecision, SessionState};
pub use task::{UrlResult, UrlTask, WorkerConfig};
pub use traits::{CallbackTransport, Extractor, SessionApi, TaskStore, UrlSink};
pub use worker::{QueueWorker, TracingWorkerReporter};
