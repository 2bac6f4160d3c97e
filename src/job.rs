//! Chunk jobs and progress data
//!
//! A chunk job is one ranged request's worth of work inside a download.
//! Each job keeps two counter sets: the in-flight values advance the moment
//! bytes are handed to the assembler, the confirmed values only once the
//! assembler acknowledged the write. Only confirmed values are safe to
//! persist as checkpoints.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Whether the server honors `Range:` requests for this download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chunkable {
    /// No response seen yet.
    Unknown,
    /// Server answered with `Content-Range`.
    Yes,
    /// Server ignored the range request.
    No,
}

/// Chunk lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Init,
    Running,
    Paused,
    Finished,
}

/// Persisted chunk state, returned from `pause` and accepted by `resume`.
///
/// `offset` is the next absolute write position, `size` the residual byte
/// count still to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub url: String,
    pub offset: u64,
    pub size: u64,
    pub received: u64,
}

/// One ranged request's worth of work.
#[derive(Debug, Clone)]
pub struct ChunkJob {
    /// Chunk index within the download; chunk 0 owns the full first
    /// response handling (size discovery, rename, chunk growth).
    pub id: u32,
    /// Current URL; rewritten when the worker follows a redirect.
    pub url: String,
    /// Next absolute byte offset to write.
    pub offset: u64,
    /// Remaining bytes expected.
    pub size: u64,
    /// Bytes observed so far, durable or not.
    pub received: u64,
    pub confirmed_offset: u64,
    pub confirmed_size: u64,
    pub confirmed_received: u64,
    pub state: JobState,
    /// Worker slot this job is scheduled under, while running.
    pub worker_id: Option<u64>,
}

impl ChunkJob {
    pub fn new(id: u32, url: String, offset: u64, size: u64) -> Self {
        Self {
            id,
            url,
            offset,
            size,
            received: 0,
            confirmed_offset: offset,
            confirmed_size: size,
            confirmed_received: 0,
            state: JobState::Init,
            worker_id: None,
        }
    }

    pub fn from_checkpoint(id: u32, checkpoint: &ChunkCheckpoint) -> Self {
        Self {
            id,
            url: checkpoint.url.clone(),
            offset: checkpoint.offset,
            size: checkpoint.size,
            received: checkpoint.received,
            confirmed_offset: checkpoint.offset,
            confirmed_size: checkpoint.size,
            confirmed_received: checkpoint.received,
            state: JobState::Init,
            worker_id: None,
        }
    }

    pub fn is_first(&self) -> bool {
        self.id == 0
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Paused | JobState::Finished)
    }

    /// Advance the in-flight counters for bytes handed to the assembler.
    /// The final chunk of a range may deliver one byte past the nominal
    /// size (inclusive range end), so `size` saturates.
    pub fn advance(&mut self, bytes: u64) {
        self.offset += bytes;
        self.received += bytes;
        self.size = self.size.saturating_sub(bytes);
    }

    /// Advance the confirmed counters after an assembler ack.
    pub fn confirm(&mut self, bytes: u64) {
        self.confirmed_offset += bytes;
        self.confirmed_received += bytes;
        self.confirmed_size = self.confirmed_size.saturating_sub(bytes);
    }

    /// Durable state snapshot for persistence.
    pub fn checkpoint(&self) -> ChunkCheckpoint {
        ChunkCheckpoint {
            url: self.url.clone(),
            offset: self.confirmed_offset,
            size: self.confirmed_size,
            received: self.confirmed_received,
        }
    }
}

/// Progress snapshot delivered to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub id: String,
    /// Bytes durably accepted by the assembler.
    pub received: u64,
    pub total_size: Option<u64>,
    /// Present only on synced acks; safe to persist.
    pub chunks: Option<Vec<ChunkCheckpoint>>,
    pub chunkable: Chunkable,
    pub urls: Option<Vec<String>>,
    pub file_path: PathBuf,
}

/// Terminal download report.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadFinished {
    pub file_path: PathBuf,
    /// Headers of the first response, lowercase keys.
    pub headers: HashMap<String, String>,
    /// Checkpoints of chunks that did not finish.
    pub unfinished_chunks: Vec<ChunkCheckpoint>,
    pub had_errors: bool,
    pub size: u64,
}
