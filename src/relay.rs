#![forbid(unsafe_code)]

//! Streams a finished artifact into the response body.
//!
//! The body owns the artifact's [`ArtifactCleanup`], so the file is removed
//! when the last byte has been read, when reading fails, or when hyper drops
//! the body because the client went away.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{HeaderValue, header},
    response::Response,
};
use futures_util::Stream;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::artifact::ArtifactPath;
use crate::cleanup::ArtifactCleanup;
use crate::error::{ApiError, ApiResult, ErrorKind};

/// Opens the artifact and builds a streaming attachment response. Headers are
/// fixed here, before any body byte exists.
pub async fn relay_artifact(
    artifact: &ArtifactPath,
    cleanup: ArtifactCleanup,
) -> ApiResult<Response> {
    let file = File::open(&artifact.path).await.map_err(|err| {
        error!(path = %artifact.path.display(), error = %err, "opening artifact failed");
        cleanup.run();
        ApiError::internal(ErrorKind::Stream, "File streaming failed")
    })?;

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        artifact.download_name
    ))
    .map_err(|_| ApiError::internal(ErrorKind::Stream, "File streaming failed"))?;

    let body = Body::from_stream(ArtifactStream::new(ReaderStream::new(file), cleanup));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(artifact.content_type),
    );
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

/// Forward-only byte stream over an artifact file.
pub struct ArtifactStream<S> {
    inner: S,
    cleanup: ArtifactCleanup,
    sent: u64,
    finished: bool,
}

impl<S> ArtifactStream<S> {
    pub fn new(inner: S, cleanup: ArtifactCleanup) -> Self {
        Self {
            inner,
            cleanup,
            sent: 0,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.cleanup.run();
    }
}

impl<S> Stream for ArtifactStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                error!(
                    path = %this.cleanup.path().display(),
                    sent = this.sent,
                    error = %err,
                    "File streaming failed"
                );
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                debug!(path = %this.cleanup.path().display(), sent = this.sent, "relay complete");
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for ArtifactStream<S> {
    fn drop(&mut self) {
        if !self.finished {
            info!(
                path = %self.cleanup.path().display(),
                sent = self.sent,
                "client went away during relay"
            );
            self.finish();
        }
    }
}
