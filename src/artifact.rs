#![forbid(unsafe_code)]

//! Temporary file naming for download artifacts.
//!
//! Everything here is pure: a name is computed from the request and a clock
//! reading, no file is touched.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::request::{DownloadRequest, Media};

const VIDEO_EXTENSION: &str = "mp4";
const VIDEO_MIME: &str = "video/mp4";

/// Where the worker writes its output and how the relay labels it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactPath {
    pub path: PathBuf,
    /// Attachment name offered to the client, extension included.
    pub download_name: String,
    pub extension: &'static str,
    pub content_type: &'static str,
}

impl ArtifactPath {
    pub fn allocate(dir: &Path, request: &DownloadRequest) -> Self {
        Self::allocate_at(dir, request, Utc::now())
    }

    pub fn allocate_at(dir: &Path, request: &DownloadRequest, now: DateTime<Utc>) -> Self {
        let (extension, content_type) = output_format(&request.media);
        let stamp = timestamp(now);

        let caller_name = request
            .filename
            .as_deref()
            .map(sanitize_filename)
            .filter(|name| !name.is_empty());

        let (stem, disk_stem) = match caller_name {
            Some(name) => {
                let disk = format!("{name}_{stamp}");
                (name, disk)
            }
            None => {
                let composed = format!(
                    "{}_{}_{}",
                    sanitize_title(&request.title),
                    sanitize_filename(&request.quality),
                    stamp
                );
                (composed.clone(), composed)
            }
        };

        Self {
            path: dir.join(format!("{disk_stem}.{extension}")),
            download_name: format!("{stem}.{extension}"),
            extension,
            content_type,
        }
    }
}

pub fn output_format(media: &Media) -> (&'static str, &'static str) {
    match media {
        Media::Video(_) => (VIDEO_EXTENSION, VIDEO_MIME),
        Media::Audio(format) => (format.as_str(), format.mime()),
    }
}

/// Millisecond UTC instant with `:` and `.` swapped for `-`, e.g.
/// `2024-01-01T12-34-56-789Z`.
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Keeps `[A-Za-z0-9-_ ]` and turns every run of spaces into one `_`.
pub fn sanitize_title(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_space = false;
    for c in raw.chars() {
        if c == ' ' {
            if !in_space {
                out.push('_');
            }
            in_space = true;
        } else if is_name_char(c) {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Keeps `[A-Za-z0-9-_]` only.
pub fn sanitize_filename(raw: &str) -> String {
    raw.chars().filter(|c| is_name_char(*c)).collect()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}
