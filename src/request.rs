#![forbid(unsafe_code)]

//! Query parameters and the validated request values built from them.

use serde::Deserialize;
use url::Url;

use crate::error::{ApiError, ApiResult};
use crate::security::validate_source_url;

const DEFAULT_QUALITY: &str = "best";
const DEFAULT_SUBTITLE_LANG: &str = "en";
const DEFAULT_TITLE: &str = "video";
const TRIM_START_FALLBACK: &str = "00:00:00";

#[derive(Debug, Default, Deserialize)]
pub struct InfoQuery {
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub quality: Option<String>,
    pub format_id: Option<String>,
    pub audio_format: Option<String>,
    pub include_subs: Option<String>,
    pub sub_lang: Option<String>,
    pub embed_subs: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub filename: Option<String>,
    pub title: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Aac,
    M4a,
    Opus,
    Wav,
}

impl AudioFormat {
    /// Unknown or missing values fall back to mp3.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("aac") => Self::Aac,
            Some("m4a") => Self::M4a,
            Some("opus") => Self::Opus,
            Some("wav") => Self::Wav,
            _ => Self::Mp3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::M4a => "m4a",
            Self::Opus => "opus",
            Self::Wav => "wav",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Aac => "audio/aac",
            Self::M4a => "audio/mp4",
            Self::Opus => "audio/opus",
            Self::Wav => "audio/wav",
        }
    }
}

/// How the worker should pick video streams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoFormat {
    Explicit(String),
    Best,
    MaxHeight(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Media {
    Video(VideoFormat),
    Audio(AudioFormat),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubtitleOptions {
    pub lang: String,
    pub embed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrimRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl TrimRange {
    /// Section expression in the form the worker expects, e.g. `*00:01:00-00:02:00`.
    pub fn section(&self) -> String {
        format!(
            "*{}-{}",
            self.start.as_deref().unwrap_or(TRIM_START_FALLBACK),
            self.end.as_deref().unwrap_or("")
        )
    }
}

#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub url: Url,
    pub media: Media,
    /// Raw quality label, used when composing the artifact name.
    pub quality: String,
    pub subtitles: Option<SubtitleOptions>,
    pub trim: Option<TrimRange>,
    pub title: String,
    pub filename: Option<String>,
}

impl DownloadRequest {
    pub fn from_query(query: DownloadQuery) -> ApiResult<Self> {
        let url = parse_source_url(query.url.as_deref())?;
        let quality = query
            .quality
            .clone()
            .unwrap_or_else(|| DEFAULT_QUALITY.to_string());

        let media = if non_empty(query.media_type.as_deref()) == Some("audio") {
            Media::Audio(AudioFormat::parse(non_empty(query.audio_format.as_deref())))
        } else {
            let height = parse_video_quality(&quality)?;
            let format = match (non_empty(query.format_id.as_deref()), height) {
                (Some(format_id), _) => VideoFormat::Explicit(format_id.to_string()),
                (None, None) => VideoFormat::Best,
                (None, Some(height)) => VideoFormat::MaxHeight(height),
            };
            Media::Video(format)
        };

        let subtitles = is_true(query.include_subs.as_deref()).then(|| SubtitleOptions {
            lang: non_empty(query.sub_lang.as_deref())
                .unwrap_or(DEFAULT_SUBTITLE_LANG)
                .to_string(),
            embed: is_true(query.embed_subs.as_deref()),
        });

        let start = non_empty(query.start_time.as_deref()).map(str::to_string);
        let end = non_empty(query.end_time.as_deref()).map(str::to_string);
        let trim = (start.is_some() || end.is_some()).then_some(TrimRange { start, end });

        Ok(Self {
            url,
            media,
            quality,
            subtitles,
            trim,
            title: non_empty(query.title.as_deref())
                .unwrap_or(DEFAULT_TITLE)
                .to_string(),
            filename: non_empty(query.filename.as_deref()).map(str::to_string),
        })
    }
}

pub fn parse_source_url(value: Option<&str>) -> ApiResult<Url> {
    value
        .and_then(validate_source_url)
        .ok_or_else(|| ApiError::bad_request("Invalid YouTube URL"))
}

/// `best` means no ceiling; any other value must be a plain height.
fn parse_video_quality(value: &str) -> ApiResult<Option<u32>> {
    let value = value.trim();
    if value == DEFAULT_QUALITY {
        return Ok(None);
    }
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|_| ApiError::bad_request("Invalid video quality"))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn is_true(value: Option<&str>) -> bool {
    value.map(str::trim) == Some("true")
}
