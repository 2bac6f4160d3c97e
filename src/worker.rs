//! Download worker
//!
//! One worker drives one ranged GET for one chunk job: request, redirect
//! following, body streaming through the shared throttle and an optional
//! gzip/deflate decoder, buffered hand-off to the assembler, and a single
//! mid-flight retry once progress was observed. Control (cancel, pause,
//! restart) arrives over a command channel; the attempt loop is an explicit
//! state machine rather than recursive callbacks.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::{GzDecoder, ZlibDecoder};
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT_ENCODING, COOKIE, RANGE, REFERER, USER_AGENT};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{DownloadError, DownloadResult};
use crate::manager::ManagerCore;
use crate::resolver::split_referer;
use crate::throttle::Throttle;

/// Merge buffered body frames into one assembler write at this size.
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Stop pulling the response once this much is buffered while a write is
/// still in flight.
pub const BUFFER_SIZE_CAP: usize = 4 * 1024 * 1024;

/// Redirects followed per worker attempt.
pub const MAX_REDIRECT_FOLLOW: u8 = 2;

/// Settle delay before re-issuing against a redirect target.
const REDIRECT_SETTLE: Duration = Duration::from_millis(100);

/// Control messages for a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Abort; the chunk ends non-paused.
    Cancel,
    /// Abort but mark the chunk paused for later resume.
    Pause,
    /// Abort the request and immediately re-issue against a fresh URL.
    Restart,
}

/// Handle the manager keeps per busy worker slot.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: u64,
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(WorkerCommand::Cancel);
    }

    pub fn pause(&self) {
        let _ = self.cmd_tx.send(WorkerCommand::Pause);
    }

    pub fn restart(&self) {
        let _ = self.cmd_tx.send(WorkerCommand::Restart);
    }
}

/// What the first 2xx response told us about the file.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub total_size: Option<u64>,
    pub server_filename: Option<String>,
    pub chunkable: bool,
    pub headers: HashMap<String, String>,
}

/// Outcome of one request attempt.
enum Attempt {
    /// Stream drained; the chunk's range is on disk.
    Complete,
    /// Pause command; chunk stays resumable.
    Paused,
    /// Cancel command or the download disappeared underneath us.
    Canceled,
    /// Redirect, retry or restart: run another attempt.
    Reissue,
    Failed(DownloadError),
}

/// Streaming decoder for `Content-Encoding: gzip | deflate` bodies.
enum BodyDecoder {
    Plain,
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl BodyDecoder {
    fn for_encoding(encoding: Option<&str>) -> Self {
        match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
            Some("gzip") => BodyDecoder::Gzip(GzDecoder::new(Vec::new())),
            Some("deflate") => BodyDecoder::Deflate(ZlibDecoder::new(Vec::new())),
            _ => BodyDecoder::Plain,
        }
    }

    fn push(&mut self, data: &Bytes) -> std::io::Result<Bytes> {
        match self {
            BodyDecoder::Plain => Ok(data.clone()),
            BodyDecoder::Gzip(decoder) => {
                decoder.write_all(data)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            BodyDecoder::Deflate(decoder) => {
                decoder.write_all(data)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }

    fn finish(&mut self) -> std::io::Result<Bytes> {
        match self {
            BodyDecoder::Plain => Ok(Bytes::new()),
            BodyDecoder::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            BodyDecoder::Deflate(decoder) => {
                decoder.try_finish()?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }
}

/// Extract the attachment filename from a Content-Disposition value,
/// handling both `filename="..."` and RFC 5987 `filename*=UTF-8''...`.
/// Path components are stripped so a hostile header cannot escape the
/// download directory.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let extracted = if let Some(pos) = value.find("filename*=") {
        let rest = &value[pos + 10..];
        rest.split("''")
            .nth(1)
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .map(|s| {
                urlencoding::decode(s)
                    .map(|d| d.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            })
    } else if let Some(pos) = value.find("filename=") {
        let rest = &value[pos + 9..];
        let name = if rest.starts_with('"') {
            rest.trim_start_matches('"').split('"').next()
        } else {
            rest.split(';').next()
        };
        name.map(|s| s.trim().to_string())
    } else {
        None
    };

    extracted
        .filter(|name| !name.is_empty())
        .and_then(|name| {
            std::path::Path::new(&name)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
        })
}

/// Total file size as reported by `Content-Range: bytes a-b/total`.
fn total_from_content_range(value: &str) -> Option<u64> {
    value
        .rfind('/')
        .and_then(|pos| value[pos + 1..].trim().parse::<u64>().ok())
}

fn header_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// One HTTP worker bound to a single chunk job.
pub(crate) struct DownloadWorker {
    worker_id: u64,
    download_id: String,
    chunk_id: u32,
    core: Arc<ManagerCore>,
    client: reqwest::Client,
    throttle: Throttle,
    user_agent: String,
    cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    redirects: u8,
    retried: bool,
    needs_refresh: bool,
}

impl DownloadWorker {
    /// Spawn the worker task; the returned handle controls it.
    pub(crate) fn spawn(
        core: Arc<ManagerCore>,
        worker_id: u64,
        download_id: String,
        chunk_id: u32,
        client: reqwest::Client,
        throttle: Throttle,
        user_agent: String,
    ) -> WorkerHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = DownloadWorker {
            worker_id,
            download_id,
            chunk_id,
            core,
            client,
            throttle,
            user_agent,
            cmd_rx,
            redirects: 0,
            retried: false,
            needs_refresh: false,
        };
        tokio::spawn(worker.run());
        WorkerHandle { worker_id, cmd_tx }
    }

    async fn run(mut self) {
        loop {
            match self.attempt().await {
                Attempt::Complete => return self.finish(false).await,
                Attempt::Paused => return self.finish(true).await,
                Attempt::Canceled => return self.finish(false).await,
                Attempt::Reissue => continue,
                Attempt::Failed(err) => {
                    self.core
                        .job_error(&self.download_id, self.chunk_id, err)
                        .await;
                    return self.finish(false).await;
                }
            }
        }
    }

    /// Exactly-once termination; everything after the first call is noise.
    async fn finish(&self, paused: bool) {
        self.core
            .finish_chunk(&self.download_id, self.chunk_id, self.worker_id, paused)
            .await;
    }

    /// One request attempt against the job's current URL.
    async fn attempt(&mut self) -> Attempt {
        let refresh = std::mem::take(&mut self.needs_refresh);
        let job = match self
            .core
            .job_request_state(&self.download_id, self.chunk_id, refresh)
            .await
        {
            Some(job) => job,
            None => return Attempt::Canceled,
        };

        if job.size == 0 {
            return Attempt::Complete;
        }

        let (bare_url, referer) = split_referer(&job.url);
        let bare_url = bare_url.to_string();
        let referer = referer.map(|r| r.to_string());

        debug!(
            "[Worker {}] requesting bytes {}-{} of {}",
            self.worker_id,
            job.offset,
            job.offset + job.size,
            bare_url
        );

        let mut request = self
            .client
            .get(&bare_url)
            .header(RANGE, format!("bytes={}-{}", job.offset, job.offset + job.size))
            .header(USER_AGENT, self.user_agent.clone())
            .header(ACCEPT_ENCODING, "gzip, deflate");
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        // Cookie lookup is best effort; a missing store never fails the
        // download.
        if let Some(cookies) = self.core.cookies_for(&bare_url) {
            request = request.header(COOKIE, cookies);
        }

        let send = request.send();
        tokio::pin!(send);

        let response = loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(WorkerCommand::Pause) => return Attempt::Paused,
                    Some(WorkerCommand::Restart) => {
                        self.needs_refresh = true;
                        return Attempt::Reissue;
                    }
                    Some(WorkerCommand::Cancel) | None => return Attempt::Canceled,
                },
                sent = &mut send => match sent {
                    Ok(response) => break response,
                    Err(err) => return Attempt::Failed(err.into()),
                },
            }
        };

        let status = response.status();

        if status.is_redirection() {
            return self.handle_redirect(&bare_url, &response).await;
        }

        if !status.is_success() {
            return Attempt::Failed(DownloadError::HttpError {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("unknown").to_string(),
                url: bare_url,
            });
        }

        let headers = header_map(response.headers());
        if headers
            .get("content-type")
            .map(|t| t.starts_with("text/html"))
            .unwrap_or(false)
        {
            return Attempt::Failed(DownloadError::DownloadIsHtml(bare_url));
        }

        let chunkable = headers.contains_key("content-range");
        let total_size = headers
            .get("content-range")
            .and_then(|v| total_from_content_range(v))
            .or_else(|| {
                headers
                    .get("content-length")
                    .and_then(|v| v.parse::<u64>().ok())
            });
        let server_filename = headers
            .get("content-disposition")
            .and_then(|v| filename_from_disposition(v));
        let content_encoding = headers.get("content-encoding").cloned();

        self.core
            .job_response(
                &self.download_id,
                self.chunk_id,
                ResponseInfo {
                    total_size,
                    server_filename,
                    chunkable,
                    headers,
                },
            )
            .await;

        self.stream_body(response, content_encoding.as_deref()).await
    }

    async fn handle_redirect(&mut self, current_url: &str, response: &reqwest::Response) -> Attempt {
        let status = response.status();
        let followable = matches!(
            status,
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        );

        if !followable || self.redirects >= MAX_REDIRECT_FOLLOW {
            return Attempt::Failed(DownloadError::HttpError {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("unknown").to_string(),
                url: current_url.to_string(),
            });
        }

        let location = match response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
        {
            Some(location) => location.to_string(),
            None => {
                return Attempt::Failed(DownloadError::DataInvalid(format!(
                    "redirect without location from {}",
                    current_url
                )))
            }
        };

        let target = match url::Url::parse(current_url).and_then(|base| base.join(&location)) {
            Ok(target) => target.to_string(),
            Err(err) => {
                return Attempt::Failed(DownloadError::DataInvalid(format!(
                    "unresolvable redirect {}: {}",
                    location, err
                )))
            }
        };

        info!(
            "[Worker {}] redirect {} -> {}",
            self.worker_id, current_url, target
        );

        self.core
            .set_job_url(&self.download_id, self.chunk_id, target)
            .await;
        self.redirects += 1;

        // Give flaky mirrors a moment to settle before re-issuing.
        tokio::time::sleep(REDIRECT_SETTLE).await;
        Attempt::Reissue
    }

    async fn stream_body(
        &mut self,
        response: reqwest::Response,
        content_encoding: Option<&str>,
    ) -> Attempt {
        let mut decoder = BodyDecoder::for_encoding(content_encoding);
        let mut stream = response.bytes_stream();
        let mut buffers: Vec<Bytes> = Vec::new();
        let mut buffered: usize = 0;
        let mut pending: Option<JoinHandle<DownloadResult<bool>>> = None;
        let mut attempt_received: u64 = 0;

        loop {
            // Backpressure: past the cap with a write still in flight, the
            // response is not pulled again until the ack arrives.
            if buffered >= BUFFER_SIZE_CAP {
                if let Err(attempt) = Self::await_pending(&mut pending).await {
                    return attempt;
                }
            }

            if pending
                .as_ref()
                .map(|handle| handle.is_finished())
                .unwrap_or(false)
            {
                if let Err(attempt) = Self::await_pending(&mut pending).await {
                    return attempt;
                }
            }

            if buffered >= BUFFER_SIZE && pending.is_none() {
                match self.begin_write(&mut buffers, &mut buffered).await {
                    Ok(handle) => pending = handle,
                    Err(err) => return Attempt::Failed(err),
                }
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(WorkerCommand::Pause) => return Attempt::Paused,
                    Some(WorkerCommand::Restart) => {
                        // The in-flight write still moves the chunk's
                        // offset; it must land before the next attempt
                        // reads its request state.
                        if let Err(attempt) = Self::await_pending(&mut pending).await {
                            return attempt;
                        }
                        self.needs_refresh = true;
                        return Attempt::Reissue;
                    }
                    Some(WorkerCommand::Cancel) | None => return Attempt::Canceled,
                },
                frame = stream.next() => match frame {
                    Some(Ok(data)) => {
                        self.throttle.acquire(data.len()).await;
                        self.core
                            .report_progress(self.worker_id, &self.download_id, data.len() as u64)
                            .await;
                        attempt_received += data.len() as u64;
                        match decoder.push(&data) {
                            Ok(out) if out.is_empty() => {}
                            Ok(out) => {
                                buffered += out.len();
                                buffers.push(out);
                            }
                            Err(err) => return Attempt::Failed(err.into()),
                        }
                    }
                    Some(Err(err)) => {
                        if let Err(attempt) = Self::await_pending(&mut pending).await {
                            return attempt;
                        }
                        let transient = DownloadError::from(err);
                        if transient.is_transient() && attempt_received > 0 && !self.retried {
                            warn!(
                                "[Worker {}] transient failure after {} bytes, retrying: {}",
                                self.worker_id, attempt_received, transient
                            );
                            self.retried = true;
                            self.needs_refresh = true;
                            return Attempt::Reissue;
                        }
                        return Attempt::Failed(transient);
                    }
                    None => {
                        match decoder.finish() {
                            Ok(tail) if tail.is_empty() => {}
                            Ok(tail) => {
                                buffered += tail.len();
                                buffers.push(tail);
                            }
                            Err(err) => return Attempt::Failed(err.into()),
                        }
                        if let Err(attempt) = Self::await_pending(&mut pending).await {
                            return attempt;
                        }
                        if let Err(err) = self.write_serialized(&mut buffers, &mut buffered).await {
                            return Attempt::Failed(err);
                        }
                        return Attempt::Complete;
                    }
                },
            }
        }
    }

    async fn await_pending(
        pending: &mut Option<JoinHandle<DownloadResult<bool>>>,
    ) -> Result<(), Attempt> {
        if let Some(handle) = pending.take() {
            match handle.await {
                Ok(Ok(_synced)) => Ok(()),
                Ok(Err(err)) => Err(Attempt::Failed(err)),
                Err(_) => Err(Attempt::Failed(DownloadError::ProcessCanceled(
                    "write task aborted".to_string(),
                ))),
            }
        } else {
            Ok(())
        }
    }

    /// Merge the buffer list and hand it to the assembler as one write.
    /// If the merge allocation fails the buffers are written one by one
    /// with the response held back.
    async fn begin_write(
        &self,
        buffers: &mut Vec<Bytes>,
        buffered: &mut usize,
    ) -> DownloadResult<Option<JoinHandle<DownloadResult<bool>>>> {
        let mut merged: Vec<u8> = Vec::new();
        if merged.try_reserve_exact(*buffered).is_err() {
            warn!(
                "[Worker {}] buffer merge failed at {} bytes, writing serialized",
                self.worker_id, *buffered
            );
            self.write_serialized(buffers, buffered).await?;
            return Ok(None);
        }

        for buffer in buffers.drain(..) {
            merged.extend_from_slice(&buffer);
        }
        *buffered = 0;

        let core = Arc::clone(&self.core);
        let download_id = self.download_id.clone();
        let chunk_id = self.chunk_id;
        Ok(Some(tokio::spawn(async move {
            core.deliver(&download_id, chunk_id, Bytes::from(merged)).await
        })))
    }

    async fn write_serialized(
        &self,
        buffers: &mut Vec<Bytes>,
        buffered: &mut usize,
    ) -> DownloadResult<()> {
        for buffer in buffers.drain(..) {
            self.core.deliver(&self.download_id, self.chunk_id, buffer).await?;
        }
        *buffered = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_plain_disposition() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"mod pack.zip\""),
            Some("mod pack.zip".to_string())
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=plain.bin"),
            Some("plain.bin".to_string())
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn test_filename_from_extended_disposition() {
        assert_eq!(
            filename_from_disposition("attachment; filename*=UTF-8''na%C3%AFve%20mod.7z"),
            Some("naïve mod.7z".to_string())
        );
    }

    #[test]
    fn test_filename_disposition_strips_paths() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"../../etc/passwd\""),
            Some("passwd".to_string())
        );
    }

    #[test]
    fn test_total_from_content_range() {
        assert_eq!(total_from_content_range("bytes 0-499/1234"), Some(1234));
        assert_eq!(total_from_content_range("bytes 0-499/*"), None);
        assert_eq!(total_from_content_range("garbage"), None);
    }

    #[test]
    fn test_gzip_decoder_round_trip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello chunked world").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut decoder = BodyDecoder::for_encoding(Some("gzip"));
        let mut out = Vec::new();
        // Feed in two frames like a network stream would.
        let (a, b) = compressed.split_at(compressed.len() / 2);
        out.extend_from_slice(&decoder.push(&Bytes::copy_from_slice(a)).unwrap());
        out.extend_from_slice(&decoder.push(&Bytes::copy_from_slice(b)).unwrap());
        out.extend_from_slice(&decoder.finish().unwrap());

        assert_eq!(out, b"hello chunked world");
    }

    #[test]
    fn test_plain_decoder_is_passthrough() {
        let mut decoder = BodyDecoder::for_encoding(None);
        let data = Bytes::from_static(b"raw bytes");
        assert_eq!(decoder.push(&data).unwrap(), data);
        assert!(decoder.finish().unwrap().is_empty());
    }
}
