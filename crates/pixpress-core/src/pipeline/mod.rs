//! Image transcode pipeline components.
//!
//! - **codec**: decode, downsample, and encode (CPU-bound, synchronous)
//! - **stages**: read / transcode / write operations over a storage backend
//! - **channel**: bounded channels and worker pools for backpressure
//! - **concurrent**: the three-pool pipeline
//! - **sequential**: one-task-at-a-time fallback

pub mod channel;
pub mod codec;
pub mod concurrent;
pub mod sequential;
pub mod stages;

// Re-exports for convenient access
pub use codec::{compute_scale, output_file_name, transcode_bytes, EncodedImage};
pub use concurrent::ConcurrentPipeline;
pub use sequential::SequentialRunner;
pub use stages::{TaskResult, TranscodedFile, Transcoder};
