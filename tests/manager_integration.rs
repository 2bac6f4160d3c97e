//! End-to-end tests for the download manager against a local HTTP server
//! with CDN-style range handling.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use paraget::{
    DownloadError, DownloadManager, DownloadProgress, HandlerFuture, ManagerConfig, ProgressFn,
    ProtocolHandler, RedownloadMode,
};
use rand::RngCore;
use tokio::sync::oneshot;
use warp::filters::BoxedFilter;
use warp::http::Response;
use warp::hyper::Body;
use warp::Filter;

/// Small probe chunk so tests stay in the kilobyte range.
const TEST_MIN_CHUNK: u64 = 512 * 1024;

const WAIT: Duration = Duration::from_secs(30);

fn random_body(len: usize) -> Arc<Vec<u8>> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Arc::new(data)
}

/// Parse `bytes=a-b`, clamping the end like nginx does.
fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (a, b) = spec.split_once('-')?;
    let start: u64 = a.parse().ok()?;
    if start >= len {
        return None;
    }
    let end: u64 = b.parse().map(|e: u64| e.min(len - 1)).unwrap_or(len - 1);
    if end < start {
        return None;
    }
    Some((start, end))
}

fn range_reply(body: &Arc<Vec<u8>>, range: Option<&str>) -> Response<Body> {
    let len = body.len() as u64;
    match range.and_then(|r| parse_range(r, len)) {
        Some((start, end)) => Response::builder()
            .status(206)
            .header("content-range", format!("bytes {}-{}/{}", start, end, len))
            .header("content-type", "application/octet-stream")
            .body(Body::from(body[start as usize..=end as usize].to_vec()))
            .unwrap(),
        None => Response::builder()
            .status(200)
            .header("content-length", len)
            .header("content-type", "application/octet-stream")
            .body(Body::from(body.as_ref().clone()))
            .unwrap(),
    }
}

/// Ranged file route at /file/data.bin, recording every Range header.
fn data_route(body: Arc<Vec<u8>>, ranges: Arc<Mutex<Vec<String>>>) -> BoxedFilter<(Response<Body>,)> {
    warp::path!("file" / "data.bin")
        .and(warp::header::optional::<String>("range"))
        .map(move |range: Option<String>| {
            if let Some(ref r) = range {
                ranges.lock().unwrap().push(r.clone());
            }
            range_reply(&body, range.as_deref())
        })
        .boxed()
}

/// Same data, trickled out slowly so tests can pause mid-flight.
fn slow_data_route(body: Arc<Vec<u8>>) -> BoxedFilter<(Response<Body>,)> {
    warp::path!("file" / "data.bin")
        .and(warp::header::optional::<String>("range"))
        .map(move |range: Option<String>| {
            let len = body.len() as u64;
            let (start, end, status, content_range) =
                match range.as_deref().and_then(|r| parse_range(r, len)) {
                    Some((start, end)) => (
                        start,
                        end,
                        206,
                        Some(format!("bytes {}-{}/{}", start, end, len)),
                    ),
                    None => (0, len - 1, 200, None),
                };

            let body = Arc::clone(&body);
            let stream = futures_util::stream::unfold(start, move |pos| {
                let body = Arc::clone(&body);
                async move {
                    if pos > end {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    let next = (pos + 16 * 1024).min(end + 1);
                    let frame = body[pos as usize..next as usize].to_vec();
                    Some((Ok::<_, Infallible>(bytes::Bytes::from(frame)), next))
                }
            });

            let mut builder = Response::builder().status(status);
            if let Some(content_range) = content_range {
                builder = builder.header("content-range", content_range);
            }
            builder
                .header("content-type", "application/octet-stream")
                .body(Body::wrap_stream(stream))
                .unwrap()
        })
        .boxed()
}

async fn spawn_server(filter: BoxedFilter<(Response<Body>,)>) -> (String, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel();
    let (addr, server) = warp::serve(filter).bind_with_graceful_shutdown(([127, 0, 0, 1], 0), async {
        rx.await.ok();
    });
    tokio::spawn(server);
    (format!("http://{}", addr), tx)
}

fn test_manager(dest: &std::path::Path) -> DownloadManager {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = ManagerConfig::new(dest);
    config.min_chunk_size = TEST_MIN_CHUNK;
    config.max_workers = 4;
    config.max_chunks = 4;
    DownloadManager::new(config).unwrap()
}

fn progress_recorder() -> (ProgressFn, Arc<Mutex<Vec<DownloadProgress>>>) {
    let seen: Arc<Mutex<Vec<DownloadProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let cb: ProgressFn = Arc::new(move |progress| {
        sink.lock().unwrap().push(progress);
    });
    (cb, seen)
}

#[tokio::test]
async fn test_small_file_single_chunk() {
    let body = random_body(100 * 1024);
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let (base, _shutdown) = spawn_server(data_route(Arc::clone(&body), Arc::clone(&ranges))).await;
    let dest = tempfile::tempdir().unwrap();
    let manager = test_manager(dest.path());

    let ticket = manager
        .enqueue(
            uuid::Uuid::new_v4().to_string(),
            vec![format!("{}/file/data.bin", base)],
            None,
            None,
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    let finished = tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    assert!(!finished.had_errors);
    assert_eq!(finished.size, body.len() as u64);
    assert_eq!(std::fs::read(&finished.file_path).unwrap(), *body);
    // One probe request, no further chunks below the minimum chunk size.
    assert_eq!(ranges.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_large_file_grows_to_four_chunks() {
    let body = random_body(2 * 1024 * 1024);
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let (base, _shutdown) = spawn_server(data_route(Arc::clone(&body), Arc::clone(&ranges))).await;
    let dest = tempfile::tempdir().unwrap();
    let manager = test_manager(dest.path());

    let ticket = manager
        .enqueue(
            "grow-test",
            vec![format!("{}/file/data.bin", base)],
            None,
            None,
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    let finished = tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    assert!(!finished.had_errors);
    assert_eq!(std::fs::read(&finished.file_path).unwrap(), *body);

    // Probe plus three grown chunks, starting one past each boundary.
    let mut starts: Vec<String> = ranges
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.split('-').next().unwrap().to_string())
        .collect();
    starts.sort();
    assert_eq!(
        starts,
        vec![
            "bytes=0".to_string(),
            "bytes=1048577".to_string(),
            "bytes=1572865".to_string(),
            "bytes=524289".to_string(),
        ]
    );

    let status = manager.status().await;
    assert_eq!(status.active_workers, 0);
    assert_eq!(status.total_downloads, 0);
}

#[tokio::test]
async fn test_redirect_then_success() {
    let body = random_body(64 * 1024);
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let redirect = warp::path!("moved")
        .map(|| {
            Response::builder()
                .status(302)
                .header("location", "/file/data.bin")
                .body(Body::empty())
                .unwrap()
        })
        .boxed();
    let route = redirect
        .or(data_route(Arc::clone(&body), Arc::clone(&ranges)))
        .unify()
        .boxed();
    let (base, _shutdown) = spawn_server(route).await;
    let dest = tempfile::tempdir().unwrap();
    let manager = test_manager(dest.path());

    let ticket = manager
        .enqueue(
            "redirect-test",
            vec![format!("{}/moved", base)],
            Some("moved.bin".to_string()),
            None,
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    let finished = tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    assert!(!finished.had_errors);
    assert_eq!(std::fs::read(&finished.file_path).unwrap(), *body);
}

#[tokio::test]
async fn test_html_response_fails_and_removes_file() {
    let route = warp::path!("file" / "mod.zip")
        .map(|| {
            Response::builder()
                .status(200)
                .header("content-type", "text/html; charset=utf-8")
                .body(Body::from("<html><body>please log in</body></html>"))
                .unwrap()
        })
        .boxed();
    let (base, _shutdown) = spawn_server(route).await;
    let dest = tempfile::tempdir().unwrap();
    let manager = test_manager(dest.path());

    let ticket = manager
        .enqueue(
            "html-test",
            vec![format!("{}/file/mod.zip", base)],
            None,
            None,
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    let result = tokio::time::timeout(WAIT, ticket.wait()).await.unwrap();
    assert!(matches!(result, Err(DownloadError::DownloadIsHtml(_))));
    // The partial file is cleaned up, not left masquerading as the mod.
    assert!(!dest.path().join("mod.zip").exists());
}

#[tokio::test]
async fn test_pause_then_resume_is_byte_exact() {
    let body = random_body(2 * 1024 * 1024);
    let (base, _shutdown) = spawn_server(slow_data_route(Arc::clone(&body))).await;
    let dest = tempfile::tempdir().unwrap();
    let manager = test_manager(dest.path());
    let url = format!("{}/file/data.bin", base);

    let ticket = manager
        .enqueue(
            "pause-test",
            vec![url.clone()],
            None,
            None,
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let checkpoints = manager.pause("pause-test").await.unwrap();
    assert!(!checkpoints.is_empty());

    let finished = tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    assert!(!finished.had_errors);
    assert!(!finished.unfinished_chunks.is_empty());

    let resumed_received: u64 = finished.unfinished_chunks.iter().map(|c| c.received).sum();
    let ticket = manager
        .resume(
            "pause-test-resumed",
            finished.file_path.clone(),
            vec![url],
            resumed_received,
            body.len() as u64,
            chrono::Utc::now().timestamp(),
            finished.unfinished_chunks,
            None,
        )
        .await
        .unwrap();

    let finished = tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    assert!(!finished.had_errors);
    assert!(finished.unfinished_chunks.is_empty());
    assert_eq!(std::fs::read(&finished.file_path).unwrap(), *body);
}

#[tokio::test]
async fn test_stop_mid_flight_reports_errors() {
    let body = random_body(2 * 1024 * 1024);
    let (base, _shutdown) = spawn_server(slow_data_route(Arc::clone(&body))).await;
    let dest = tempfile::tempdir().unwrap();
    let manager = test_manager(dest.path());

    let ticket = manager
        .enqueue(
            "stop-test",
            vec![format!("{}/file/data.bin", base)],
            None,
            None,
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.stop("stop-test").await.unwrap();

    let finished = tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    assert!(finished.had_errors);
    assert!(!finished.unfinished_chunks.is_empty());
}

#[tokio::test]
async fn test_collision_with_declined_prompt_is_user_canceled() {
    let dest = tempfile::tempdir().unwrap();
    std::fs::write(dest.path().join("mod.zip"), b"keep me").unwrap();

    let mut config = ManagerConfig::new(dest.path());
    config.min_chunk_size = TEST_MIN_CHUNK;
    config.file_exists_cb = Some(Arc::new(|_| false));
    let manager = DownloadManager::new(config).unwrap();

    let result = manager
        .enqueue(
            "collision-test",
            vec!["http://127.0.0.1:9/file/mod.zip".to_string()],
            Some("mod.zip".to_string()),
            None,
            None,
            RedownloadMode::Ask,
        )
        .await;

    assert!(matches!(result, Err(DownloadError::UserCanceled)));
    assert_eq!(
        std::fs::read(dest.path().join("mod.zip")).unwrap(),
        b"keep me"
    );
}

#[tokio::test]
async fn test_empty_url_list_is_rejected() {
    let dest = tempfile::tempdir().unwrap();
    let manager = test_manager(dest.path());
    let result = manager
        .enqueue("empty-test", Vec::new(), None, None, None, RedownloadMode::Ask)
        .await;
    assert!(matches!(result, Err(DownloadError::DataInvalid(_))));
}

#[tokio::test]
async fn test_server_filename_renames_output() {
    let body = random_body(64 * 1024);
    let route = warp::path!("file" / "data.bin")
        .and(warp::header::optional::<String>("range"))
        .map(move |range: Option<String>| {
            let mut reply = range_reply(&body, range.as_deref());
            reply.headers_mut().insert(
                "content-disposition",
                "attachment; filename=\"Actual Mod Name.zip\"".parse().unwrap(),
            );
            reply
        })
        .boxed();
    let (base, _shutdown) = spawn_server(route).await;
    let dest = tempfile::tempdir().unwrap();
    let manager = test_manager(dest.path());

    let ticket = manager
        .enqueue(
            "rename-test",
            vec![format!("{}/file/data.bin", base)],
            None,
            None,
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    let finished = tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    assert!(!finished.had_errors);
    assert_eq!(
        finished.file_path,
        dest.path().join("Actual Mod Name.zip")
    );
    assert!(finished.file_path.exists());
    assert!(!dest.path().join("data.bin").exists());
}

#[tokio::test]
async fn test_referer_suffix_and_cookies_reach_the_server() {
    let body = random_body(32 * 1024);
    let seen: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&seen);
    let route = warp::path!("file" / "data.bin")
        .and(warp::header::optional::<String>("range"))
        .and(warp::header::optional::<String>("referer"))
        .and(warp::header::optional::<String>("cookie"))
        .map(move |range: Option<String>, referer: Option<String>, cookie: Option<String>| {
            let mut seen = sink.lock().unwrap();
            if let Some(referer) = referer {
                seen.insert("referer".to_string(), referer);
            }
            if let Some(cookie) = cookie {
                seen.insert("cookie".to_string(), cookie);
            }
            range_reply(&body, range.as_deref())
        })
        .boxed();
    let (base, _shutdown) = spawn_server(route).await;
    let dest = tempfile::tempdir().unwrap();

    let mut config = ManagerConfig::new(dest.path());
    config.min_chunk_size = TEST_MIN_CHUNK;
    config.cookie_cb = Some(Arc::new(|_| Some("session=abc123".to_string())));
    let manager = DownloadManager::new(config).unwrap();

    let ticket = manager
        .enqueue(
            "referer-test",
            vec![format!(
                "{}/file/data.bin<https://portal.example.com/mods/42",
                base
            )],
            None,
            None,
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.get("referer").map(String::as_str),
        Some("https://portal.example.com/mods/42")
    );
    assert_eq!(seen.get("cookie").map(String::as_str), Some("session=abc123"));
}

#[tokio::test]
async fn test_protocol_handler_expands_scheme() {
    let body = random_body(48 * 1024);
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let (base, _shutdown) = spawn_server(data_route(Arc::clone(&body), ranges)).await;
    let dest = tempfile::tempdir().unwrap();

    let target = format!("{}/file/data.bin", base);
    let handler: Arc<dyn ProtocolHandler> = Arc::new(move |_url: &str| -> HandlerFuture {
        let target = target.clone();
        Box::pin(async move { Ok(vec![target]) })
    });

    let mut config = ManagerConfig::new(dest.path());
    config.min_chunk_size = TEST_MIN_CHUNK;
    config.protocol_handlers.insert("stash".to_string(), handler);
    let manager = DownloadManager::new(config).unwrap();

    let ticket = manager
        .enqueue(
            "handler-test",
            vec!["stash://mods/42/files/7".to_string()],
            Some("from-handler.bin".to_string()),
            None,
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    let finished = tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();
    assert!(!finished.had_errors);
    assert_eq!(std::fs::read(&finished.file_path).unwrap(), *body);
}

#[tokio::test]
async fn test_progress_snapshots_are_monotonic() {
    let body = random_body(768 * 1024);
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let (base, _shutdown) = spawn_server(data_route(Arc::clone(&body), ranges)).await;
    let dest = tempfile::tempdir().unwrap();
    let manager = test_manager(dest.path());
    let (progress_cb, seen) = progress_recorder();

    let ticket = manager
        .enqueue(
            "progress-test",
            vec![format!("{}/file/data.bin", base)],
            None,
            Some(progress_cb),
            None,
            RedownloadMode::Ask,
        )
        .await
        .unwrap();

    tokio::time::timeout(WAIT, ticket.wait()).await.unwrap().unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    // First snapshot fires before any byte moved.
    assert_eq!(seen.first().unwrap().received, 0);
    let received: Vec<u64> = seen.iter().map(|p| p.received).collect();
    let mut sorted = received.clone();
    sorted.sort();
    assert_eq!(received, sorted);
    assert!(received.last().copied().unwrap() >= body.len() as u64);
}
