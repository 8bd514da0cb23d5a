#![forbid(unsafe_code)]

//! Boot-time and per-request guards shared by the streamforge binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use url::Url;

/// Hosts the worker is allowed to fetch from.
pub const ALLOWED_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "youtu.be"];

/// Fails fast when the service is started as root. Every request spawns a
/// worker process with the service's privileges, so it should run under a
/// dedicated unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Returns the parsed URL when it is an `https` link to one of the allowed
/// hosts.
pub fn validate_source_url(input: &str) -> Option<Url> {
    let url = Url::parse(input).ok()?;
    if url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?;
    if !ALLOWED_HOSTS.contains(&host) {
        return None;
    }
    Some(url)
}
