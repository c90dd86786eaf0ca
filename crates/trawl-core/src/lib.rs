pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod pagination;
pub mod proxy;
pub mod proxy_router;
pub mod retry;
pub mod storage;
pub mod testutil;
pub mod traits;
pub mod util;

pub use checkpoint::{CheckpointStore, CollectionCheckpoint};
pub use config::TrawlConfig;
pub use dataset::{DataPage, Dataset, DatasetInfo, DatasetStore, ExportFormat, PushResult};
pub use error::{AppError, ErrorKind};
pub use pagination::{
    CollectionResult, CollectionStats, EngineEvent, EngineReporter, PaginationConfig,
    PaginationEngine, ProgressReporter, RunOptions, StopReason, TracingEngineReporter,
};
pub use proxy::{ProxyEndpoint, ProxyProtocol, ProxySource};
pub use proxy_router::{ProbeOutcome, ProbeStatus, ProxyRouter, ProxyRouterConfig, ProxyStats};
pub use retry::{RetryConfig, RetryPolicy};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use traits::{ItemSink, NoopDriver, NullSink, PageDriver, ProxyProbe};
