#![forbid(unsafe_code)]

//! Per-request orchestration of the worker, the artifact and the response.
//!
//! Every request runs the same state machine:
//! `Validating -> Spawned -> {Streaming | Failed} -> Done`. While the worker
//! runs, its exit and the client-disconnect token race in a biased
//! `select!`; the first one observed becomes the request's single
//! [`TerminationEvent`] and decides what happens next.

use std::{future::Future, path::PathBuf, sync::Arc};

use axum::response::Response;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::artifact::ArtifactPath;
use crate::cleanup::ArtifactCleanup;
use crate::error::{ApiError, ErrorKind};
use crate::metadata::{VideoInfo, parse_video_info};
use crate::relay::relay_artifact;
use crate::request::{DownloadQuery, DownloadRequest, InfoQuery, parse_source_url};
use crate::supervisor::{ExitReason, OutputCapture, SupervisedProcess};
use crate::worker::{WorkerBinary, download_args, info_args};

/// Immutable state shared by every request handler.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub worker: WorkerBinary,
    /// Passed to every worker when present.
    pub cookies: Option<PathBuf>,
    pub artifact_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Validating,
    Spawned,
    Streaming,
    Failed,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationEvent {
    NormalExit(ExitReason),
    SpawnFailure,
    ClientDisconnected,
    StreamFailure,
}

/// How a request ended.
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    Failed(ApiError),
    /// The client disconnected; nothing is written back.
    Cancelled,
}

/// Tracks the state machine of one request.
#[derive(Debug)]
struct Lifecycle {
    request: &'static str,
    state: LifecycleState,
}

impl Lifecycle {
    fn new(request: &'static str) -> Self {
        Self {
            request,
            state: LifecycleState::Validating,
        }
    }

    fn enter(&mut self, state: LifecycleState) {
        debug!(request = self.request, from = ?self.state, to = ?state, "lifecycle transition");
        self.state = state;
    }

    /// Records the event that ends the request. Each branch of a request
    /// reaches this exactly once; [`race_exit`] already picked the winner.
    fn settle(&mut self, event: TerminationEvent) {
        debug!(request = self.request, state = ?self.state, ?event, "terminal event");
    }

    fn fail<T>(&mut self, err: ApiError) -> Outcome<T> {
        self.enter(LifecycleState::Failed);
        if err.kind == ErrorKind::Validation {
            info!(request = self.request, message = %err.message, "rejected request");
        } else {
            error!(
                request = self.request,
                kind = err.kind.as_str(),
                status = err.status.as_u16(),
                "{}",
                err.message
            );
        }
        self.enter(LifecycleState::Done);
        Outcome::Failed(err)
    }

    fn cancelled<T>(&mut self) -> Outcome<T> {
        info!(request = self.request, "client disconnected, worker stopped");
        self.enter(LifecycleState::Done);
        Outcome::Cancelled
    }
}

/// Races the worker's exit against the disconnect token. Disconnect is
/// polled first, so it wins whenever both are ready.
async fn race_exit(
    process: &mut SupervisedProcess,
    disconnect: &CancellationToken,
) -> TerminationEvent {
    let event = tokio::select! {
        biased;
        _ = disconnect.cancelled() => TerminationEvent::ClientDisconnected,
        exit = process.wait() => match exit {
            Ok(exit) => TerminationEvent::NormalExit(exit),
            Err(err) => {
                warn!(error = %err, "waiting for worker failed");
                TerminationEvent::SpawnFailure
            }
        },
    };
    if disconnect.is_cancelled() {
        TerminationEvent::ClientDisconnected
    } else {
        event
    }
}

/// `GET /video/download`: runs the worker into a temporary artifact and
/// relays it as an attachment.
pub async fn run_download(
    ctx: Arc<ServiceContext>,
    query: DownloadQuery,
    disconnect: CancellationToken,
) -> Outcome<Response> {
    let mut lifecycle = Lifecycle::new("download");
    let request = match DownloadRequest::from_query(query) {
        Ok(request) => request,
        Err(err) => return lifecycle.fail(err),
    };

    let artifact = ArtifactPath::allocate(&ctx.artifact_dir, &request);
    let cleanup = ArtifactCleanup::new(artifact.path.clone());
    let args = download_args(&request, &artifact, ctx.cookies.as_deref());

    let mut process = match SupervisedProcess::start(&ctx.worker, args, OutputCapture::Discard) {
        Ok(process) => process,
        Err(err) => {
            lifecycle.settle(TerminationEvent::SpawnFailure);
            warn!(error = %err, url = %request.url, "could not spawn worker");
            cleanup.run();
            return lifecycle.fail(ApiError::internal(ErrorKind::Spawn, "yt-dlp execution failed"));
        }
    };
    lifecycle.enter(LifecycleState::Spawned);
    debug!(url = %request.url, path = %artifact.path.display(), "download started");

    let event = race_exit(&mut process, &disconnect).await;
    match event {
        TerminationEvent::ClientDisconnected => {
            lifecycle.settle(event);
            process.kill_and_reap().await;
            cleanup.run();
            lifecycle.cancelled()
        }
        TerminationEvent::NormalExit(exit) if exit.success() => {
            lifecycle.enter(LifecycleState::Streaming);
            match relay_artifact(&artifact, cleanup).await {
                Ok(response) => {
                    lifecycle.settle(event);
                    // The body stream owns cleanup from here on.
                    info!(url = %request.url, file = %artifact.download_name, "download ready");
                    lifecycle.enter(LifecycleState::Done);
                    Outcome::Completed(response)
                }
                Err(err) => {
                    lifecycle.settle(TerminationEvent::StreamFailure);
                    lifecycle.fail(err)
                }
            }
        }
        TerminationEvent::NormalExit(exit) => {
            lifecycle.settle(event);
            let stderr = process.take_stderr().await;
            error!(url = %request.url, ?exit, stderr = %stderr.trim(), "worker failed");
            cleanup.run();
            lifecycle.fail(ApiError::internal(ErrorKind::ProcessFailure, "Download failed"))
        }
        TerminationEvent::SpawnFailure | TerminationEvent::StreamFailure => {
            lifecycle.settle(event);
            process.kill_and_reap().await;
            cleanup.run();
            lifecycle.fail(ApiError::internal(ErrorKind::Spawn, "yt-dlp execution failed"))
        }
    }
}

/// `GET /video/info`: runs the worker in JSON metadata mode and projects its
/// output.
pub async fn run_info(
    ctx: Arc<ServiceContext>,
    query: InfoQuery,
    disconnect: CancellationToken,
) -> Outcome<VideoInfo> {
    let mut lifecycle = Lifecycle::new("info");
    let url: Url = match parse_source_url(query.url.as_deref()) {
        Ok(url) => url,
        Err(err) => return lifecycle.fail(err),
    };

    let args = info_args(url.as_str(), ctx.cookies.as_deref());
    let mut process = match SupervisedProcess::start(&ctx.worker, args, OutputCapture::Stdout) {
        Ok(process) => process,
        Err(err) => {
            lifecycle.settle(TerminationEvent::SpawnFailure);
            warn!(error = %err, %url, "could not spawn worker");
            return lifecycle.fail(ApiError::internal(
                ErrorKind::Spawn,
                "Failed to fetch video info",
            ));
        }
    };
    lifecycle.enter(LifecycleState::Spawned);

    let event = race_exit(&mut process, &disconnect).await;
    match event {
        TerminationEvent::ClientDisconnected => {
            lifecycle.settle(event);
            process.kill_and_reap().await;
            lifecycle.cancelled()
        }
        TerminationEvent::NormalExit(exit) if exit.success() => {
            lifecycle.settle(event);
            let stdout = process.take_stdout().await;
            match parse_video_info(&stdout) {
                Ok(info) => {
                    info!(%url, formats = info.formats.len(), "video info fetched");
                    lifecycle.enter(LifecycleState::Done);
                    Outcome::Completed(info)
                }
                Err(err) => {
                    error!(
                        %url,
                        error = %err,
                        output = %String::from_utf8_lossy(&stdout[..stdout.len().min(2048)]),
                        "could not parse worker output"
                    );
                    lifecycle.fail(ApiError::internal(ErrorKind::Parse, "Failed to parse video info"))
                }
            }
        }
        TerminationEvent::NormalExit(exit) => {
            lifecycle.settle(event);
            let stderr = process.take_stderr().await;
            error!(%url, ?exit, stderr = %stderr.trim(), "worker failed");
            lifecycle.fail(ApiError::internal(
                ErrorKind::ProcessFailure,
                "Failed to fetch video info",
            ))
        }
        TerminationEvent::SpawnFailure | TerminationEvent::StreamFailure => {
            lifecycle.settle(event);
            process.kill_and_reap().await;
            lifecycle.fail(ApiError::internal(
                ErrorKind::Spawn,
                "Failed to fetch video info",
            ))
        }
    }
}

/// Runs `work` on its own task and cancels `disconnect` if the caller is
/// dropped first. Hyper drops a handler future when its connection closes;
/// the token is how that reaches the still-running task.
pub async fn detached<T, F>(disconnect: CancellationToken, work: F) -> Outcome<T>
where
    T: Send + 'static,
    F: Future<Output = Outcome<T>> + Send + 'static,
{
    let guard = disconnect.drop_guard();
    let outcome = match tokio::spawn(work).await {
        Ok(outcome) => outcome,
        Err(err) => Outcome::Failed(ApiError::internal(
            ErrorKind::Internal,
            format!("request task failed: {err}"),
        )),
    };
    guard.disarm();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        PARSE_OUTPUT_ARG, fork_helper, install_download_stub, install_worker_stub, pid_alive,
        record_pid, wait_for_file, wait_until_dead,
    };
    use axum::{body::to_bytes, http::StatusCode};
    use std::{
        fs,
        time::{Duration, Instant},
    };
    use tempfile::{TempDir, tempdir};

    fn context(dir: &TempDir, worker: WorkerBinary) -> Arc<ServiceContext> {
        let artifact_dir = dir.path().join("artifacts");
        fs::create_dir_all(&artifact_dir).unwrap();
        Arc::new(ServiceContext {
            worker,
            cookies: None,
            artifact_dir,
        })
    }

    fn download_query(url: &str) -> DownloadQuery {
        DownloadQuery {
            url: Some(url.to_string()),
            title: Some("Clip".into()),
            ..DownloadQuery::default()
        }
    }

    fn artifacts(ctx: &ServiceContext) -> usize {
        fs::read_dir(&ctx.artifact_dir).unwrap().count()
    }

    fn completed<T: std::fmt::Debug>(outcome: Outcome<T>) -> T {
        match outcome {
            Outcome::Completed(value) => value,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    fn failed<T: std::fmt::Debug>(outcome: Outcome<T>) -> ApiError {
        match outcome {
            Outcome::Failed(err) => err,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_download_streams_then_removes_artifact() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, install_download_stub(dir.path(), "media-bytes"));

        let outcome = run_download(
            ctx.clone(),
            download_query("https://youtu.be/abc123"),
            CancellationToken::new(),
        )
        .await;
        let response = completed(outcome);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(artifacts(&ctx), 1);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"media-bytes");
        assert_eq!(artifacts(&ctx), 0);
    }

    #[tokio::test]
    async fn failed_worker_yields_error_and_no_artifact() {
        let dir = tempdir().unwrap();
        let worker = install_worker_stub(
            dir.path(),
            &format!("{PARSE_OUTPUT_ARG}echo partial > \"$out\"\necho 'ERROR: unavailable' >&2\nexit 1"),
        );
        let ctx = context(&dir, worker);

        let outcome = run_download(
            ctx.clone(),
            download_query("https://youtu.be/abc123"),
            CancellationToken::new(),
        )
        .await;
        let err = failed(outcome);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind, ErrorKind::ProcessFailure);
        assert_eq!(err.message, "Download failed");
        assert_eq!(artifacts(&ctx), 0);
    }

    #[tokio::test]
    async fn disconnect_kills_worker_and_removes_artifact() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("worker.pid");
        let worker = install_worker_stub(
            dir.path(),
            &format!(
                "{PARSE_OUTPUT_ARG}echo partial > \"$out\"\n{}\nexec sleep 30",
                record_pid(&pid_file)
            ),
        );
        let ctx = context(&dir, worker);
        let disconnect = CancellationToken::new();

        let started = Instant::now();
        let task = tokio::spawn(run_download(
            ctx.clone(),
            download_query("https://youtu.be/abc123"),
            disconnect.clone(),
        ));
        wait_for_file(&pid_file).await;
        disconnect.cancel();

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, Outcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!pid_alive(&pid_file));
        assert_eq!(artifacts(&ctx), 0);
    }

    #[tokio::test]
    async fn disconnect_kills_forked_helpers_before_cleanup() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("worker.pid");
        let helper_pid = dir.path().join("helper.pid");
        let worker = install_worker_stub(
            dir.path(),
            &format!(
                "{PARSE_OUTPUT_ARG}{}\n{}\nexec sleep 30",
                fork_helper(&helper_pid, "sleep 1; echo late > \"$1\""),
                record_pid(&pid_file)
            ),
        );
        let ctx = context(&dir, worker);
        let disconnect = CancellationToken::new();

        let task = tokio::spawn(run_download(
            ctx.clone(),
            download_query("https://youtu.be/abc123"),
            disconnect.clone(),
        ));
        wait_for_file(&pid_file).await;
        wait_for_file(&helper_pid).await;
        disconnect.cancel();

        assert!(matches!(task.await.unwrap(), Outcome::Cancelled));
        assert!(wait_until_dead(&helper_pid).await, "helper outlived the request");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(artifacts(&ctx), 0, "artifact reappeared after cleanup");
    }

    #[tokio::test]
    async fn subtitle_sidecar_is_removed_after_relay() {
        let dir = tempdir().unwrap();
        let worker = install_worker_stub(
            dir.path(),
            &format!(
                "{PARSE_OUTPUT_ARG}printf media > \"$out\"\nprintf cue > \"${{out%.*}}.en.vtt\"\nexit 0"
            ),
        );
        let ctx = context(&dir, worker);
        let query = DownloadQuery {
            include_subs: Some("true".into()),
            ..download_query("https://youtu.be/abc123")
        };

        let response = completed(run_download(ctx.clone(), query, CancellationToken::new()).await);
        assert_eq!(artifacts(&ctx), 2);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"media");
        assert_eq!(artifacts(&ctx), 0);
    }

    #[tokio::test]
    async fn failed_worker_leaves_no_part_files() {
        let dir = tempdir().unwrap();
        let worker = install_worker_stub(
            dir.path(),
            &format!(
                "{PARSE_OUTPUT_ARG}echo partial > \"$out.part\"\necho frag > \"${{out%.*}}.f137.mp4\"\nexit 1"
            ),
        );
        let ctx = context(&dir, worker);
        failed(
            run_download(
                ctx.clone(),
                download_query("https://youtu.be/abc123"),
                CancellationToken::new(),
            )
            .await,
        );
        assert_eq!(artifacts(&ctx), 0);
    }

    #[tokio::test]
    async fn disconnect_wins_over_simultaneous_success() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, install_download_stub(dir.path(), "media-bytes"));
        let disconnect = CancellationToken::new();
        disconnect.cancel();

        let outcome = run_download(ctx.clone(), download_query("https://youtu.be/abc123"), disconnect)
            .await;
        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(artifacts(&ctx), 0);
    }

    #[tokio::test]
    async fn disallowed_host_never_spawns() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let worker = install_worker_stub(dir.path(), &format!("touch '{}'", marker.display()));
        let ctx = context(&dir, worker);

        let outcome = run_download(
            ctx,
            download_query("https://vimeo.com/1"),
            CancellationToken::new(),
        )
        .await;
        let err = failed(outcome);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn spawn_failure_maps_to_internal_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-executable");
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        let worker = WorkerBinary::locate("not-executable", Some(&path)).unwrap();
        let ctx = context(&dir, worker);

        let outcome = run_download(
            ctx.clone(),
            download_query("https://youtu.be/abc123"),
            CancellationToken::new(),
        )
        .await;
        let err = failed(outcome);
        assert_eq!(err.kind, ErrorKind::Spawn);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(artifacts(&ctx), 0);
    }

    #[tokio::test]
    async fn info_projects_worker_output() {
        let dir = tempdir().unwrap();
        let worker = install_worker_stub(
            dir.path(),
            r#"cat <<'EOF'
{"title":"T","duration":10,"formats":[{"ext":"mp4","vcodec":"h264","acodec":"aac","format_id":"18","height":360,"fps":30,"filesize":1000},{"ext":"webm","vcodec":"vp9","acodec":"opus","format_id":"43"}]}
EOF"#,
        );
        let ctx = context(&dir, worker);

        let outcome = run_info(
            ctx,
            InfoQuery {
                url: Some("https://youtu.be/abc123".into()),
            },
            CancellationToken::new(),
        )
        .await;
        let info = completed(outcome);
        assert_eq!(info.title.as_deref(), Some("T"));
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].resolution.as_deref(), Some("360p"));
    }

    #[tokio::test]
    async fn info_distinguishes_parse_and_process_failures() {
        let dir = tempdir().unwrap();
        let query = || InfoQuery {
            url: Some("https://youtu.be/abc123".into()),
        };

        let garbage = context(&dir, install_worker_stub(dir.path(), "echo 'not json'"));
        let err = failed(run_info(garbage, query(), CancellationToken::new()).await);
        assert_eq!(err.kind, ErrorKind::Parse);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);

        let failing = context(&dir, install_worker_stub(dir.path(), "echo oops >&2\nexit 2"));
        let err = failed(run_info(failing, query(), CancellationToken::new()).await);
        assert_eq!(err.kind, ErrorKind::ProcessFailure);
        assert_eq!(err.message, "Failed to fetch video info");
    }

    #[tokio::test]
    async fn info_disconnect_kills_worker() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("info.pid");
        let worker = install_worker_stub(
            dir.path(),
            &format!("{}\nexec sleep 30", record_pid(&pid_file)),
        );
        let ctx = context(&dir, worker);
        let disconnect = CancellationToken::new();
        let task = tokio::spawn(run_info(
            ctx,
            InfoQuery {
                url: Some("https://youtu.be/abc123".into()),
            },
            disconnect.clone(),
        ));
        wait_for_file(&pid_file).await;
        disconnect.cancel();
        assert!(matches!(task.await.unwrap(), Outcome::Cancelled));
        assert!(!pid_alive(&pid_file));
    }

    #[tokio::test]
    async fn dropping_detached_caller_cancels_work() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("detached.pid");
        let worker = install_worker_stub(
            dir.path(),
            &format!(
                "{PARSE_OUTPUT_ARG}echo partial > \"$out\"\n{}\nexec sleep 30",
                record_pid(&pid_file)
            ),
        );
        let ctx = context(&dir, worker);
        let disconnect = CancellationToken::new();

        let caller = tokio::spawn(detached(
            disconnect.clone(),
            run_download(
                ctx.clone(),
                download_query("https://youtu.be/abc123"),
                disconnect.clone(),
            ),
        ));
        wait_for_file(&pid_file).await;
        caller.abort();
        let _ = caller.await;
        assert!(disconnect.is_cancelled());

        for _ in 0..200 {
            if artifacts(&ctx) == 0 && !pid_alive(&pid_file) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker or artifact outlived the dropped request");
    }
}
