// Shared-buffer ring: pooled chunks, the fan-out coordinator, and its
// lifecycle state machine.

mod chunk;
mod coordinator;
mod pool;

pub use chunk::{Chunk, StreamStatus};
pub use coordinator::{CoordinatorState, ReadOutcome, StreamCoordinator, WriterSourceInfo};
pub use pool::{BufferPool, BufferPoolStats};
