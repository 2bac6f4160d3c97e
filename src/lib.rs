//! paraget - parallel, resumable, chunked HTTP(S) download engine
//!
//! Given a set of mirror URLs for one logical file, the manager reserves a
//! unique output name, probes the server with a single ranged request,
//! grows the download into parallel range chunks when the server proves it
//! can serve them, assembles everything into one file, and survives
//! redirects, stalls, pauses and process restarts via chunk checkpoints.
//!
//! Key features:
//! - Multi-connection range downloads against a global worker limit
//! - Durable pause/resume through confirmed chunk checkpoints
//! - Shared token-bucket bandwidth ceiling across all connections
//! - Starving-worker detection with automatic restart
//! - Server-filename discovery with atomic rename while downloading

mod assembler;
mod error;
mod job;
mod manager;
mod naming;
mod resolver;
mod speed;
mod throttle;
mod worker;

pub use assembler::{FileAssembler, WriteAck};
pub use error::{DownloadError, DownloadResult};
pub use job::{ChunkCheckpoint, Chunkable, DownloadFinished, DownloadProgress, JobState};
pub use manager::{
    CookieFn, DownloadManager, DownloadTicket, ManagerConfig, ManagerStatus, ProgressFn, SpeedFn,
    MIN_CHUNK_SIZE,
};
pub use naming::{reserve_unique_name, sanitize_filename, FileExistsFn, RedownloadMode};
pub use resolver::{split_referer, HandlerFuture, ProtocolHandler, UrlResolver};
pub use speed::{format_speed, SpeedMeter, WorkerPace};
pub use throttle::{BandwidthFn, Throttle, ThrottleGroup};
pub use worker::{WorkerHandle, BUFFER_SIZE, BUFFER_SIZE_CAP, MAX_REDIRECT_FOLLOW};
