#![forbid(unsafe_code)]

//! Locating the worker executable and building its argument vectors.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};

use crate::artifact::ArtifactPath;
use crate::request::{DownloadRequest, Media, VideoFormat};

const BEST_PAIR_SELECTOR: &str = "bestvideo[ext=mp4][vcodec!=av1]+bestaudio[ext=m4a]/best";

/// Absolute path of the worker, resolved once at boot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerBinary {
    path: PathBuf,
}

impl WorkerBinary {
    /// Uses `explicit` when given, otherwise searches `PATH` for `name`.
    pub fn locate(name: &str, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.is_file() {
                bail!("worker executable {} does not exist", path.display());
            }
            return Ok(Self {
                path: path.to_path_buf(),
            });
        }
        let path = which::which(name).with_context(|| format!("{name} not found in PATH"))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Arguments for a JSON metadata dump of a single video.
pub fn info_args(url: &str, cookies: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--no-warnings".into(), "-j".into(), "--no-playlist".into()];
    push_cookies(&mut args, cookies);
    args.push(url.into());
    args
}

/// Arguments for a download into `artifact`.
pub fn download_args(
    request: &DownloadRequest,
    artifact: &ArtifactPath,
    cookies: Option<&Path>,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        request.url.as_str().into(),
        "--no-warnings".into(),
        "--no-playlist".into(),
    ];
    push_cookies(&mut args, cookies);
    args.push("-o".into());
    args.push(artifact.path.clone().into_os_string());

    match &request.media {
        Media::Audio(format) => {
            args.extend(
                ["-x", "--audio-format", format.as_str(), "--audio-quality", "0"].map(OsString::from),
            );
        }
        Media::Video(format) => {
            args.push("-f".into());
            args.push(format_selector(format).into());
            args.push("--merge-output-format".into());
            args.push("mp4".into());
        }
    }

    if let Some(subtitles) = &request.subtitles {
        args.push("--write-subs".into());
        args.push("--sub-lang".into());
        args.push(subtitles.lang.clone().into());
        if subtitles.embed {
            args.push("--embed-subs".into());
        }
    }

    if let Some(trim) = &request.trim {
        args.push("--download-sections".into());
        args.push(trim.section().into());
    }

    args
}

pub fn format_selector(format: &VideoFormat) -> String {
    match format {
        VideoFormat::Explicit(id) => id.clone(),
        VideoFormat::Best => BEST_PAIR_SELECTOR.to_string(),
        VideoFormat::MaxHeight(height) => {
            format!("bestvideo[height<={height}][vcodec!=av1]+bestaudio[ext=m4a]/best")
        }
    }
}

fn push_cookies(args: &mut Vec<OsString>, cookies: Option<&Path>) {
    if let Some(cookies) = cookies {
        args.push("--cookies".into());
        args.push(cookies.as_os_str().to_owned());
    }
}
