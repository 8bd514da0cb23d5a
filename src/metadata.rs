#![forbid(unsafe_code)]

//! Projection of the worker's JSON metadata dump into the `/video/info`
//! payload.
//!
//! Only progressive mp4 formats (both a video and an audio codec) survive,
//! in the order the worker listed them.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

const CANONICAL_CONTAINER: &str = "mp4";
const NO_CODEC: &str = "none";

/// Subset of the worker's metadata document we read.
#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<Value>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<Number>,
    fps: Option<Number>,
    filesize: Option<Number>,
    filesize_approx: Option<Number>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: Option<String>,
    pub duration: Option<Value>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    pub formats: Vec<FormatSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatSummary {
    pub format_id: Option<String>,
    pub resolution: Option<String>,
    pub fps: Option<Number>,
    pub filesize: Option<Number>,
    pub vcodec: String,
    pub acodec: String,
}

/// Parses the worker's stdout and reduces it to the public shape.
pub fn parse_video_info(stdout: &[u8]) -> serde_json::Result<VideoInfo> {
    let raw: RawInfo = serde_json::from_slice(stdout)?;
    Ok(project(raw))
}

fn project(raw: RawInfo) -> VideoInfo {
    let formats = raw.formats.into_iter().filter_map(summarize).collect();
    VideoInfo {
        title: raw.title,
        duration: raw.duration,
        thumbnail: raw.thumbnail,
        uploader: raw.uploader,
        formats,
    }
}

fn summarize(format: RawFormat) -> Option<FormatSummary> {
    if format.ext.as_deref() != Some(CANONICAL_CONTAINER) {
        return None;
    }
    let vcodec = format.vcodec.filter(|codec| codec != NO_CODEC)?;
    let acodec = format.acodec.filter(|codec| codec != NO_CODEC)?;

    Some(FormatSummary {
        format_id: format.format_id,
        resolution: non_zero(format.height).map(|height| format!("{}p", plain_number(&height))),
        fps: format.fps,
        filesize: non_zero(format.filesize).or_else(|| non_zero(format.filesize_approx)),
        vcodec,
        acodec,
    })
}

/// Integers print as integers and whole floats drop their `.0`, so `360.0`
/// reads `360`.
fn plain_number(number: &Number) -> String {
    match (number.as_u64(), number.as_i64(), number.as_f64()) {
        (Some(n), _, _) => n.to_string(),
        (None, Some(n), _) => n.to_string(),
        (None, None, Some(n)) => n.to_string(),
        _ => number.to_string(),
    }
}

fn non_zero(value: Option<Number>) -> Option<Number> {
    value.filter(|number| number.as_f64().is_some_and(|n| n != 0.0))
}
