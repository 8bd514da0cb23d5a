#![forbid(unsafe_code)]

//! HTTP surface: routes, query extraction and response shaping.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ApiError;
use crate::lifecycle::{Outcome, ServiceContext, detached, run_download, run_info};
use crate::metadata::VideoInfo;
use crate::request::{DownloadQuery, InfoQuery};

#[derive(Serialize)]
struct InfoResponse {
    success: bool,
    data: VideoInfo,
}

pub fn router(ctx: Arc<ServiceContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/video/info", get(video_info))
        .route("/video/download", get(video_download))
        .fallback(not_found)
        .with_state(ctx)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not Found" })))
}

async fn video_info(
    State(ctx): State<Arc<ServiceContext>>,
    query: Result<Query<InfoQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return reject_query(rejection),
    };
    let disconnect = CancellationToken::new();
    match detached(disconnect.clone(), run_info(ctx, query, disconnect)).await {
        Outcome::Completed(info) => Json(InfoResponse {
            success: true,
            data: info,
        })
        .into_response(),
        Outcome::Failed(err) => err.into_response(),
        Outcome::Cancelled => cancelled_response(),
    }
}

async fn video_download(
    State(ctx): State<Arc<ServiceContext>>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return reject_query(rejection),
    };
    let disconnect = CancellationToken::new();
    match detached(disconnect.clone(), run_download(ctx, query, disconnect)).await {
        Outcome::Completed(response) => response,
        Outcome::Failed(err) => err.into_response(),
        Outcome::Cancelled => cancelled_response(),
    }
}

fn reject_query(rejection: QueryRejection) -> Response {
    debug!(error = %rejection, "malformed query string");
    ApiError::bad_request("Invalid query string").into_response()
}

/// Only produced after the connection is gone; nothing reads it.
fn cancelled_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
