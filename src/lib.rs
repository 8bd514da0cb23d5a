#![forbid(unsafe_code)]

//! Streamforge: an HTTP front for yt-dlp that streams finished downloads back
//! to the caller and never keeps them.

pub mod api;
pub mod artifact;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metadata;
pub mod relay;
pub mod request;
pub mod security;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
mod testing;
