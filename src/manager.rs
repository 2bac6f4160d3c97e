//! Download manager
//!
//! Public surface of the engine. Enqueues jobs, resolves URLs through the
//! protocol handlers, reserves output filenames, plans the chunk layout
//! once the first response reveals size and range support, schedules
//! workers against the global slot limit, restarts starving workers, and
//! drives every download to exactly one terminal outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::assembler::FileAssembler;
use crate::error::{DownloadError, DownloadResult};
use crate::job::{
    Chunkable, ChunkCheckpoint, ChunkJob, DownloadFinished, DownloadProgress, JobState,
};
use crate::naming::{reserve_unique_name, sanitize_filename, FileExistsFn, RedownloadMode};
use crate::resolver::{split_referer, ProtocolHandler, UrlResolver};
use crate::speed::{SpeedMeter, WorkerPace};
use crate::throttle::{BandwidthFn, ThrottleGroup};
use crate::worker::{DownloadWorker, ResponseInfo, WorkerHandle};

/// A download starts as a single probe chunk of this size; only servers
/// that prove range support get more.
pub const MIN_CHUNK_SIZE: u64 = 20 * 1024 * 1024;

/// Starving strikes a worker accumulates before it gets restarted.
const SLOW_WORKER_THRESHOLD: u32 = 15;

/// Restarts only happen this close to download start; later on the URLs
/// have likely expired and a re-issue cannot help.
const SLOW_RESTART_WINDOW_SECS: i64 = 15 * 60;

/// Cadence of the aggregate speed callback.
const SPEED_TICK: Duration = Duration::from_secs(1);

/// Aggregate speed sink, bytes per second.
pub type SpeedFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Cookie store lookup by URL; best effort.
pub type CookieFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Per-download progress sink.
pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Manager configuration.
pub struct ManagerConfig {
    /// Default destination directory.
    pub download_path: PathBuf,
    /// Worker slots shared by all downloads.
    pub max_workers: usize,
    /// Upper bound on chunks per download (additionally capped by
    /// `max_workers`).
    pub max_chunks: u32,
    /// Probe chunk size and lower bound for chunk growth.
    pub min_chunk_size: u64,
    pub user_agent: String,
    /// Scheme (without the trailing colon) to handler.
    pub protocol_handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
    /// Polled bandwidth ceiling; absent or non-positive means unlimited.
    pub max_bandwidth: Option<BandwidthFn>,
    pub speed_cb: Option<SpeedFn>,
    /// Collision prompt for `RedownloadMode::Ask`.
    pub file_exists_cb: Option<FileExistsFn>,
    pub cookie_cb: Option<CookieFn>,
}

impl ManagerConfig {
    pub fn new(download_path: impl Into<PathBuf>) -> Self {
        Self {
            download_path: download_path.into(),
            max_workers: 4,
            max_chunks: 4,
            min_chunk_size: MIN_CHUNK_SIZE,
            user_agent: concat!("paraget/", env!("CARGO_PKG_VERSION")).to_string(),
            protocol_handlers: HashMap::new(),
            max_bandwidth: None,
            speed_cb: None,
            file_exists_cb: None,
            cookie_cb: None,
        }
    }
}

/// Queue and download counts at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStatus {
    pub queued_downloads: usize,
    pub active_workers: usize,
    pub total_downloads: usize,
}

/// Completion future of one download.
pub struct DownloadTicket {
    rx: oneshot::Receiver<Result<DownloadFinished, DownloadError>>,
}

impl DownloadTicket {
    /// Resolve once the download reached its terminal state.
    pub async fn wait(self) -> DownloadResult<DownloadFinished> {
        self.rx
            .await
            .map_err(|_| DownloadError::ProcessCanceled("manager shut down".to_string()))?
    }
}

struct RunningDownload {
    id: String,
    input_urls: Vec<String>,
    resolved_urls: Option<Vec<String>>,
    temp_name: PathBuf,
    final_name: Option<PathBuf>,
    orig_name: String,
    size: Option<u64>,
    received: u64,
    chunks: Vec<ChunkJob>,
    chunkable: Chunkable,
    started_ts: i64,
    headers: HashMap<String, String>,
    assembler: Option<Arc<FileAssembler>>,
    progress_cb: Option<ProgressFn>,
    completion_tx: Option<oneshot::Sender<Result<DownloadFinished, DownloadError>>>,
    /// Sticky: some chunk ended prematurely.
    error: bool,
    /// Fatal first-chunk error; resolves the ticket with Err.
    failure: Option<DownloadError>,
    canceling: bool,
}

impl RunningDownload {
    fn job_mut(&mut self, chunk_id: u32) -> Option<&mut ChunkJob> {
        self.chunks.iter_mut().find(|c| c.id == chunk_id)
    }

    fn all_terminal(&self) -> bool {
        self.chunks.iter().all(|c| c.is_terminal())
    }

    fn has_running(&self) -> bool {
        self.chunks.iter().any(|c| c.state == JobState::Running)
    }
}

#[derive(Default)]
struct ManagerState {
    /// Download ids in scheduling order.
    queue: Vec<String>,
    downloads: HashMap<String, RunningDownload>,
    busy_workers: HashMap<u64, WorkerHandle>,
    slow_workers: HashMap<u64, u32>,
}

/// Snapshot a worker needs to issue its next request.
pub(crate) struct JobRequest {
    pub url: String,
    pub offset: u64,
    pub size: u64,
}

/// Shared state and internal API called by workers.
pub(crate) struct ManagerCore {
    /// Self-reference handed to spawned workers.
    me: std::sync::Weak<ManagerCore>,
    download_path: PathBuf,
    max_workers: usize,
    max_chunks: u32,
    min_chunk_size: u64,
    user_agent: String,
    file_exists_cb: Option<FileExistsFn>,
    cookie_cb: Option<CookieFn>,
    speed_cb: Option<SpeedFn>,
    client: reqwest::Client,
    resolver: UrlResolver,
    speed: SpeedMeter,
    throttle: Arc<ThrottleGroup>,
    next_worker_id: AtomicU64,
    state: Mutex<ManagerState>,
}

/// Parallel, resumable, chunked download engine.
pub struct DownloadManager {
    core: Arc<ManagerCore>,
    speed_task: JoinHandle<()>,
}

impl DownloadManager {
    pub fn new(config: ManagerConfig) -> DownloadResult<Self> {
        // Redirects are a worker state, not a client concern, and agent
        // reuse is disabled so every ranged request gets its own
        // connection.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        let bandwidth: BandwidthFn = config.max_bandwidth.unwrap_or_else(|| Arc::new(|| 0));

        let core = Arc::new_cyclic(|me| ManagerCore {
            me: me.clone(),
            download_path: config.download_path,
            max_workers: config.max_workers,
            max_chunks: config.max_chunks,
            min_chunk_size: config.min_chunk_size,
            user_agent: config.user_agent,
            file_exists_cb: config.file_exists_cb,
            cookie_cb: config.cookie_cb,
            speed_cb: config.speed_cb,
            client,
            resolver: UrlResolver::new(config.protocol_handlers),
            speed: SpeedMeter::new(),
            throttle: ThrottleGroup::new(bandwidth),
            next_worker_id: AtomicU64::new(1),
            state: Mutex::new(ManagerState::default()),
        });

        let tick_core = Arc::clone(&core);
        let speed_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SPEED_TICK);
            loop {
                interval.tick().await;
                if let Some(cb) = tick_core.speed_cb.as_ref() {
                    cb(tick_core.speed.total_rate());
                }
            }
        });

        Ok(Self { core, speed_task })
    }

    /// Queue a new download and reserve its output name.
    ///
    /// `urls` is a non-empty mirror list; each entry may carry a
    /// `<referer` suffix. The returned ticket resolves when the download
    /// reaches its terminal state.
    pub async fn enqueue(
        &self,
        id: impl Into<String>,
        urls: Vec<String>,
        filename: Option<String>,
        progress_cb: Option<ProgressFn>,
        dest_path: Option<PathBuf>,
        redownload: RedownloadMode,
    ) -> DownloadResult<DownloadTicket> {
        let id = id.into();
        let first = urls
            .first()
            .ok_or_else(|| DownloadError::DataInvalid("empty url list".to_string()))?;

        let (bare, _referer) = split_referer(first);
        let base_url = url::Url::parse(bare)
            .map_err(|err| DownloadError::DataInvalid(format!("unparseable url {}: {}", bare, err)))?;

        let name = filename.unwrap_or_else(|| name_from_url(&base_url));
        let dest = dest_path.unwrap_or_else(|| self.core.download_path.clone());
        tokio::fs::create_dir_all(&dest).await?;

        let temp_name = reserve_unique_name(
            &dest,
            &name,
            redownload,
            self.core.file_exists_cb.as_ref(),
        )
        .await?;

        let orig_name = temp_name
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());

        info!("[Manager] enqueue {} -> {}", id, temp_name.display());

        let probe = ChunkJob::new(0, String::new(), 0, self.core.min_chunk_size);
        let (completion_tx, rx) = oneshot::channel();
        let download = RunningDownload {
            id: id.clone(),
            input_urls: urls,
            resolved_urls: None,
            temp_name,
            final_name: None,
            orig_name,
            size: None,
            received: 0,
            chunks: vec![probe],
            chunkable: Chunkable::Unknown,
            started_ts: Utc::now().timestamp(),
            headers: HashMap::new(),
            assembler: None,
            progress_cb,
            completion_tx: Some(completion_tx),
            error: false,
            failure: None,
            canceling: false,
        };

        {
            let mut state = self.core.state.lock().await;
            state.queue.push(id.clone());
            state.downloads.insert(id.clone(), download);
            if let Some(download) = state.downloads.get(&id) {
                self.core.emit_progress(download, false);
            }
        }

        self.core.tick().await;
        Ok(DownloadTicket { rx })
    }

    /// Rebuild a download from persisted chunk checkpoints.
    #[allow(clippy::too_many_arguments)]
    pub async fn resume(
        &self,
        id: impl Into<String>,
        file_path: PathBuf,
        urls: Vec<String>,
        received: u64,
        size: u64,
        started_ts: i64,
        chunks: Vec<ChunkCheckpoint>,
        progress_cb: Option<ProgressFn>,
    ) -> DownloadResult<DownloadTicket> {
        let id = id.into();
        let unfinished: Vec<&ChunkCheckpoint> = chunks.iter().filter(|c| c.size > 0).collect();
        if unfinished.is_empty() {
            return Err(DownloadError::ProcessCanceled(
                "no unfinished chunks".to_string(),
            ));
        }

        let jobs: Vec<ChunkJob> = unfinished
            .iter()
            .enumerate()
            .map(|(idx, checkpoint)| ChunkJob::from_checkpoint(idx as u32, checkpoint))
            .collect();

        let orig_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        info!(
            "[Manager] resume {} with {} chunk(s) -> {}",
            id,
            jobs.len(),
            file_path.display()
        );

        let chunkable = if jobs.len() > 1 {
            Chunkable::Yes
        } else {
            Chunkable::Unknown
        };

        let (completion_tx, rx) = oneshot::channel();
        let download = RunningDownload {
            id: id.clone(),
            input_urls: urls,
            resolved_urls: None,
            temp_name: file_path,
            final_name: None,
            orig_name,
            size: Some(size),
            received,
            chunks: jobs,
            chunkable,
            started_ts,
            headers: HashMap::new(),
            assembler: None,
            progress_cb,
            completion_tx: Some(completion_tx),
            error: false,
            failure: None,
            canceling: false,
        };

        {
            let mut state = self.core.state.lock().await;
            state.queue.push(id.clone());
            state.downloads.insert(id, download);
        }

        self.core.tick().await;
        Ok(DownloadTicket { rx })
    }

    /// Cancel a download. Running workers are aborted; a download that
    /// never started resolves its ticket with `UserCanceled`.
    pub async fn stop(&self, id: &str) -> DownloadResult<()> {
        let finalize = {
            let mut state = self.core.state.lock().await;
            let download = state
                .downloads
                .get_mut(id)
                .ok_or_else(|| DownloadError::ProcessCanceled("unknown download".to_string()))?;

            for job in &mut download.chunks {
                if job.state == JobState::Init {
                    job.state = JobState::Finished;
                }
            }
            download.canceling = true;

            let never_started = download.assembler.is_none() && download.received == 0;
            let worker_ids: Vec<u64> = download
                .chunks
                .iter()
                .filter(|c| c.state == JobState::Running)
                .filter_map(|c| c.worker_id)
                .collect();

            state.queue.retain(|queued| queued != id);

            if worker_ids.is_empty() {
                if never_started {
                    if let Some(download) = state.downloads.get_mut(id) {
                        download.failure = Some(DownloadError::UserCanceled);
                    }
                }
                true
            } else {
                for worker_id in worker_ids {
                    if let Some(handle) = state.busy_workers.get(&worker_id) {
                        handle.cancel();
                    }
                }
                false
            }
        };

        if finalize {
            self.core.finalize(id).await;
        }
        info!("[Manager] stop {}", id);
        Ok(())
    }

    /// Pause a download, returning checkpoints for every running chunk
    /// with work left. The ticket still resolves (with the unfinished
    /// chunk list) once the workers wound down.
    pub async fn pause(&self, id: &str) -> DownloadResult<Vec<ChunkCheckpoint>> {
        let (checkpoints, finalize) = {
            let mut state = self.core.state.lock().await;
            let download = state
                .downloads
                .get_mut(id)
                .ok_or_else(|| DownloadError::ProcessCanceled("unknown download".to_string()))?;

            let mut checkpoints = Vec::new();
            let mut pause_workers = Vec::new();
            for job in &mut download.chunks {
                match job.state {
                    JobState::Init => job.state = JobState::Paused,
                    JobState::Running => {
                        if job.size > 0 {
                            checkpoints.push(job.checkpoint());
                        }
                        if let Some(worker_id) = job.worker_id {
                            pause_workers.push(worker_id);
                        }
                    }
                    _ => {}
                }
            }

            let all_terminal = download.all_terminal();
            state.queue.retain(|queued| queued != id);
            for worker_id in &pause_workers {
                if let Some(handle) = state.busy_workers.get(worker_id) {
                    handle.pause();
                }
            }
            (checkpoints, all_terminal)
        };

        if finalize {
            self.core.finalize(id).await;
        }
        info!("[Manager] pause {} ({} checkpoints)", id, checkpoints.len());
        Ok(checkpoints)
    }

    /// Queue and worker counts.
    pub async fn status(&self) -> ManagerStatus {
        let state = self.core.state.lock().await;
        ManagerStatus {
            queued_downloads: state.queue.len(),
            active_workers: state.busy_workers.len(),
            total_downloads: state.downloads.len(),
        }
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.speed_task.abort();
    }
}

/// Chunk layout once the first response reveals the file size: the probe
/// chunk keeps its span, the rest of the file is split into at most
/// `max_chunks - 1` further ranges starting one past the probe chunk.
fn plan_chunks(total: u64, min_chunk_size: u64, max_chunks: u32) -> Vec<(u64, u64)> {
    let remaining = total - min_chunk_size;
    let per_chunk = remaining.div_ceil(max_chunks as u64);
    let chunk_size = remaining.min(per_chunk.max(min_chunk_size));

    let mut layout = Vec::new();
    let mut offset = min_chunk_size + 1;
    while offset < total {
        let len = chunk_size.min(total - offset);
        layout.push((offset, len));
        offset += len;
    }
    layout
}

impl ManagerCore {
    /// Fill free worker slots from the queue, in order.
    pub(crate) async fn tick(&self) {
        let mut failed = Vec::new();
        {
            let mut state = self.state.lock().await;
            loop {
                if state.busy_workers.len() >= self.max_workers {
                    break;
                }
                let next = state.queue.iter().find_map(|id| {
                    state.downloads.get(id).and_then(|download| {
                        if download.canceling || download.failure.is_some() {
                            return None;
                        }
                        download
                            .chunks
                            .iter()
                            .find(|c| c.state == JobState::Init)
                            .map(|c| (id.clone(), c.id))
                    })
                });
                let (download_id, chunk_id) = match next {
                    Some(next) => next,
                    None => break,
                };

                if let Err(err) = self.start_worker(&mut state, &download_id, chunk_id).await {
                    warn!("[Manager] failed to start {}: {}", download_id, err);
                    if let Some(download) = state.downloads.get_mut(&download_id) {
                        download.failure = Some(err);
                        for job in &mut download.chunks {
                            if job.state == JobState::Init {
                                job.state = JobState::Finished;
                            }
                        }
                        if !download.has_running() {
                            failed.push(download_id.clone());
                        }
                    }
                    state.queue.retain(|queued| queued != &download_id);
                }
            }
        }

        for id in failed {
            self.finalize(&id).await;
        }
    }

    async fn start_worker(
        &self,
        state: &mut ManagerState,
        download_id: &str,
        chunk_id: u32,
    ) -> DownloadResult<()> {
        let download = state
            .downloads
            .get_mut(download_id)
            .ok_or_else(|| DownloadError::ProcessCanceled("unknown download".to_string()))?;

        if download.resolved_urls.is_none() {
            let resolved = self.resolver.resolve_all(&download.input_urls).await;
            download.resolved_urls = Some(resolved);
        }
        let url = download
            .resolved_urls
            .as_ref()
            .and_then(|urls| urls.first().cloned())
            .ok_or_else(|| DownloadError::DataInvalid("no usable download urls".to_string()))?;

        if download.assembler.is_none() {
            let assembler = FileAssembler::create(&download.temp_name).await?;
            if let Some(size) = download.size {
                assembler.set_total_size(size).await?;
            }
            download.assembler = Some(Arc::new(assembler));
        }

        let job = download
            .job_mut(chunk_id)
            .ok_or_else(|| DownloadError::ProcessCanceled("unknown chunk".to_string()))?;
        if job.url.is_empty() {
            job.url = url;
        }

        let core = self
            .me
            .upgrade()
            .ok_or_else(|| DownloadError::ProcessCanceled("manager shut down".to_string()))?;

        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        job.state = JobState::Running;
        job.worker_id = Some(worker_id);
        self.speed.init(worker_id);

        debug!(
            "[Manager] worker {} starts {} chunk {} at offset {}",
            worker_id, download_id, chunk_id, job.offset
        );

        let handle = DownloadWorker::spawn(
            core,
            worker_id,
            download_id.to_string(),
            chunk_id,
            self.client.clone(),
            self.throttle.stream(),
            self.user_agent.clone(),
        );
        state.busy_workers.insert(worker_id, handle);
        Ok(())
    }

    /// Snapshot for the worker's next request; `None` tells the worker to
    /// wind down.
    pub(crate) async fn job_request_state(
        &self,
        download_id: &str,
        chunk_id: u32,
        refresh_url: bool,
    ) -> Option<JobRequest> {
        let mut state = self.state.lock().await;
        let download = state.downloads.get_mut(download_id)?;
        if download.canceling {
            return None;
        }

        if refresh_url {
            let resolved = self.resolver.resolve_all(&download.input_urls).await;
            if let Some(fresh) = resolved.first() {
                if let Some(job) = download.job_mut(chunk_id) {
                    job.url = fresh.clone();
                }
            }
            download.resolved_urls = Some(resolved);
        }

        let job = download.job_mut(chunk_id)?;
        if job.state != JobState::Running {
            return None;
        }
        Some(JobRequest {
            url: job.url.clone(),
            offset: job.offset,
            size: job.size,
        })
    }

    /// Redirect rebinding of a chunk's URL.
    pub(crate) async fn set_job_url(&self, download_id: &str, chunk_id: u32, url: String) {
        let mut state = self.state.lock().await;
        if let Some(job) = state
            .downloads
            .get_mut(download_id)
            .and_then(|d| d.job_mut(chunk_id))
        {
            job.url = url;
        }
    }

    /// Best-effort cookie header for a request URL.
    pub(crate) fn cookies_for(&self, url: &str) -> Option<String> {
        self.cookie_cb.as_ref().and_then(|cb| cb(url))
    }

    /// First response of a chunk. Chunk 0 owns the heavy lifting: size
    /// discovery, pre-allocation, server-filename rename and the one and
    /// only growth from a single probe chunk into the full layout. Other
    /// chunks merely track size corrections.
    pub(crate) async fn job_response(
        &self,
        download_id: &str,
        chunk_id: u32,
        info: ResponseInfo,
    ) {
        {
            let mut state = self.state.lock().await;
            let download = match state.downloads.get_mut(download_id) {
                Some(download) => download,
                None => return,
            };

            if download.headers.is_empty() {
                download.headers = info.headers;
            }
            download.chunkable = if info.chunkable {
                Chunkable::Yes
            } else {
                Chunkable::No
            };

            if chunk_id == 0 {
                if let Some(total) = info.total_size {
                    self.apply_total_size(download, total).await;
                }
                if let Some(server_name) = info.server_filename {
                    self.apply_server_filename(download, &server_name).await;
                }
            } else if let Some(total) = info.total_size {
                if download.size != Some(total) {
                    download.size = Some(total);
                }
            }

            self.emit_progress(download, false);
        }

        self.tick().await;
    }

    /// Size discovery on the first response.
    async fn apply_total_size(&self, download: &mut RunningDownload, total: u64) {
        let size_changed = download.size != Some(total);
        download.size = Some(total);

        if size_changed {
            if let Some(assembler) = download.assembler.as_ref() {
                if let Err(err) = assembler.set_total_size(total).await {
                    warn!("[Manager] pre-allocation failed for {}: {}", download.id, err);
                }
            }
        }

        // Growth happens exactly once, from the pristine probe chunk; a
        // resumed chunk keeps filling its own range linearly.
        let pristine = download.chunks.len() == 1
            && download.chunks[0].offset == 0
            && download.chunks[0].received == 0;
        if !pristine {
            return;
        }

        let max_chunks = (self.max_chunks).min(self.max_workers as u32).max(1);
        if total > self.min_chunk_size && download.chunkable == Chunkable::Yes {
            for (idx, (offset, len)) in plan_chunks(total, self.min_chunk_size, max_chunks)
                .into_iter()
                .enumerate()
            {
                download
                    .chunks
                    .push(ChunkJob::new(idx as u32 + 1, String::new(), offset, len));
            }
            info!(
                "[Manager] {} grows to {} chunks of {} bytes total",
                download.id,
                download.chunks.len(),
                total
            );
        } else {
            // Single-chunk download; the probe chunk covers the file.
            let first = &mut download.chunks[0];
            first.size = total;
            first.confirmed_size = total;
        }
    }

    /// Rename-on-name-discovery. Never fatal.
    async fn apply_server_filename(&self, download: &mut RunningDownload, server_name: &str) {
        let sanitized = sanitize_filename(server_name);
        if download.final_name.is_some() || sanitized == download.orig_name {
            return;
        }
        let assembler = match download.assembler.as_ref() {
            Some(assembler) => Arc::clone(assembler),
            None => return,
        };
        let dir = match download.temp_name.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return,
        };

        let reserved =
            match reserve_unique_name(&dir, &sanitized, RedownloadMode::Always, None).await {
                Ok(path) => path,
                Err(err) => {
                    warn!(
                        "[Manager] could not reserve server name {} for {}: {}",
                        sanitized, download.id, err
                    );
                    return;
                }
            };

        match assembler.rename(&reserved).await {
            Ok(()) => {
                info!(
                    "[Manager] {} renamed to server name {}",
                    download.id,
                    reserved.display()
                );
                download.temp_name = reserved.clone();
                download.final_name = Some(reserved);
            }
            Err(err) => {
                warn!("[Manager] rename failed for {}: {}", download.id, err);
                let _ = tokio::fs::remove_file(&reserved).await;
            }
        }
    }

    /// data_cb: write at the chunk's current offset, advancing in-flight
    /// counters immediately and confirmed counters on the ack. Returns
    /// whether the ack crossed an fsync checkpoint.
    pub(crate) async fn deliver(
        &self,
        download_id: &str,
        chunk_id: u32,
        data: Bytes,
    ) -> DownloadResult<bool> {
        let len = data.len() as u64;
        let (assembler, offset) = {
            let mut state = self.state.lock().await;
            let download = state
                .downloads
                .get_mut(download_id)
                .ok_or_else(|| DownloadError::ProcessCanceled("download gone".to_string()))?;
            let assembler = download
                .assembler
                .clone()
                .ok_or_else(|| DownloadError::ProcessCanceled("assembler closed".to_string()))?;
            let job = download
                .job_mut(chunk_id)
                .ok_or_else(|| DownloadError::ProcessCanceled("unknown chunk".to_string()))?;
            let offset = job.offset;
            job.advance(len);
            (assembler, offset)
        };

        let ack = assembler.add_chunk(offset, &data).await?;

        {
            let mut state = self.state.lock().await;
            if let Some(download) = state.downloads.get_mut(download_id) {
                if let Some(job) = download.job_mut(chunk_id) {
                    job.confirm(len);
                }
                download.received += len;
                self.emit_progress(download, ack.synced);
            }
        }

        Ok(ack.synced)
    }

    /// Stall accounting per progress tick.
    pub(crate) async fn report_progress(&self, worker_id: u64, download_id: &str, bytes: u64) {
        match self.speed.add(worker_id, bytes) {
            Some(WorkerPace::Starving) => {
                let mut state = self.state.lock().await;
                let strikes = state.slow_workers.entry(worker_id).or_insert(0);
                *strikes += 1;
                if *strikes > SLOW_WORKER_THRESHOLD {
                    let recent = state
                        .downloads
                        .get(download_id)
                        .map(|d| Utc::now().timestamp() - d.started_ts < SLOW_RESTART_WINDOW_SECS)
                        .unwrap_or(false);
                    if recent {
                        if let Some(handle) = state.busy_workers.get(&worker_id) {
                            info!("[Manager] restarting starving worker {}", worker_id);
                            handle.restart();
                        }
                        state.slow_workers.remove(&worker_id);
                    }
                }
            }
            Some(WorkerPace::Healthy) => {
                let mut state = self.state.lock().await;
                state.slow_workers.remove(&worker_id);
            }
            None => {}
        }
    }

    /// error_cb: a first-chunk failure cancels the whole download; other
    /// chunks just end short and leave their bytes unfulfilled.
    pub(crate) async fn job_error(&self, download_id: &str, chunk_id: u32, err: DownloadError) {
        warn!(
            "[Manager] chunk {} of {} failed: {}",
            chunk_id, download_id, err
        );
        if chunk_id != 0 {
            return;
        }

        let mut state = self.state.lock().await;
        let ManagerState {
            downloads,
            busy_workers,
            queue,
            ..
        } = &mut *state;
        if let Some(download) = downloads.get_mut(download_id) {
            download.failure = Some(err);
            download.canceling = true;
            for job in &mut download.chunks {
                match job.state {
                    JobState::Init => job.state = JobState::Finished,
                    JobState::Running => {
                        if job.id != chunk_id {
                            if let Some(handle) =
                                job.worker_id.and_then(|id| busy_workers.get(&id))
                            {
                                handle.cancel();
                            }
                        }
                    }
                    _ => {}
                }
            }
            queue.retain(|queued| queued != download_id);
        }
    }

    /// finish_cb: exactly one per worker. Frees the slot, settles the
    /// chunk state and completes the download when nothing is left
    /// running.
    pub(crate) async fn finish_chunk(
        &self,
        download_id: &str,
        chunk_id: u32,
        worker_id: u64,
        paused: bool,
    ) {
        let finalize = {
            let mut state = self.state.lock().await;
            state.busy_workers.remove(&worker_id);
            state.slow_workers.remove(&worker_id);
            self.speed.stop(worker_id);

            match state.downloads.get_mut(download_id) {
                Some(download) => {
                    let mut set_error = false;
                    if let Some(job) = download.job_mut(chunk_id) {
                        if !job.is_terminal() {
                            if paused || job.size > 0 {
                                job.state = JobState::Paused;
                            } else {
                                job.state = JobState::Finished;
                            }
                            if !paused && job.size > 0 {
                                set_error = true;
                            }
                        }
                        job.worker_id = None;
                    }
                    if set_error {
                        download.error = true;
                    }
                    download.all_terminal()
                }
                None => false,
            }
        };

        if finalize {
            self.finalize(download_id).await;
        }
        self.tick().await;
    }

    /// Terminal transition: close the file, settle names, resolve the
    /// ticket.
    pub(crate) async fn finalize(&self, download_id: &str) {
        let download = {
            let mut state = self.state.lock().await;
            state.queue.retain(|queued| queued != download_id);
            state.downloads.remove(download_id)
        };
        let mut download = match download {
            Some(download) => download,
            None => return,
        };

        if let Some(assembler) = download.assembler.take() {
            if let Err(err) = assembler.close().await {
                warn!("[Manager] close failed for {}: {}", download.id, err);
                download.error = true;
            }
        }

        if let Some(failure) = download.failure.take() {
            if matches!(failure, DownloadError::DownloadIsHtml(_)) {
                let _ = tokio::fs::remove_file(&download.temp_name).await;
            }
            info!("[Manager] {} failed: {}", download.id, failure);
            if let Some(tx) = download.completion_tx.take() {
                let _ = tx.send(Err(failure));
            }
            return;
        }

        if let Some(final_name) = download.final_name.clone() {
            if final_name != download.temp_name {
                match tokio::fs::rename(&download.temp_name, &final_name).await {
                    Ok(()) => download.temp_name = final_name,
                    Err(err) => warn!("[Manager] final rename failed for {}: {}", download.id, err),
                }
            }
        } else if response_is_html(&download.headers) && !looks_like_html(&download.temp_name) {
            // A html body that slipped through without its own error still
            // must not masquerade as the requested file.
            let _ = tokio::fs::remove_file(&download.temp_name).await;
        }

        let unfinished_chunks: Vec<ChunkCheckpoint> = download
            .chunks
            .iter()
            .filter(|c| c.state == JobState::Paused)
            .map(|c| c.checkpoint())
            .collect();

        let finished = DownloadFinished {
            file_path: download.temp_name.clone(),
            headers: download.headers.clone(),
            unfinished_chunks,
            had_errors: download.error,
            size: download.size.unwrap_or(0).max(download.received),
        };

        info!(
            "[Manager] {} finished: {} bytes, errors={}",
            download.id, finished.size, finished.had_errors
        );

        if let Some(tx) = download.completion_tx.take() {
            let _ = tx.send(Ok(finished));
        }
    }

    /// Push a progress snapshot to the caller. Runs inside the manager's
    /// critical section so snapshots stay ordered per download; callbacks
    /// must return quickly and must not call back into the manager. Chunk
    /// checkpoints ride along only on synced acks.
    fn emit_progress(&self, download: &RunningDownload, synced: bool) {
        let cb = match download.progress_cb.as_ref() {
            Some(cb) => cb,
            None => return,
        };
        let chunks = synced.then(|| download.chunks.iter().map(|c| c.checkpoint()).collect());
        cb(DownloadProgress {
            id: download.id.clone(),
            received: download.received,
            total_size: download.size,
            chunks,
            chunkable: download.chunkable,
            urls: download.resolved_urls.clone(),
            file_path: download.temp_name.clone(),
        });
    }
}

fn response_is_html(headers: &HashMap<String, String>) -> bool {
    headers
        .get("content-type")
        .map(|t| t.starts_with("text/html"))
        .unwrap_or(false)
}

fn looks_like_html(path: &std::path::Path) -> bool {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime == mime_guess::mime::TEXT_HTML)
        .unwrap_or(false)
}

fn name_from_url(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .unwrap_or_else(|| "unnamed".to_string())
}
