//! Shared-buffer live-stream relay engine.
//!
//! One upstream connection per channel feeds a bounded in-memory ring; any
//! number of HTTP clients drain that ring at their own pace. When an
//! upstream fails, the handler re-balances onto another source without
//! tearing down client connections.

mod backoff;
mod balancer;
mod concurrency;
mod config;
mod error;
mod handler;
mod reader;
mod registry;
mod ring;
mod source;
mod throughput;
mod writer;

pub use backoff::BackoffStrategy;
pub use balancer::{BalancedSource, LoadBalancer, create_client};
pub use concurrency::ConcurrencyManager;
pub use config::{DEFAULT_USER_AGENT, RelayConfig};
pub use error::{RelayError, is_retryable_reqwest_error};
pub use handler::{IncompatibleHook, StreamHandler, StreamResponse, stream_id_from_path};
pub use reader::{ReaderExit, run_reader};
pub use registry::StreamRegistry;
pub use ring::{
    BufferPool, BufferPoolStats, Chunk, CoordinatorState, ReadOutcome, StreamCoordinator,
    StreamStatus, WriterSourceInfo,
};
pub use source::{Session, SourceCatalog, StaticCatalog, StreamSource};
pub use throughput::ThroughputMeter;
pub use writer::{HlsWriter, MediaWriter, is_hls_playlist, spawn_writer};
