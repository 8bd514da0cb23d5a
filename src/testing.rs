//! Shell-script stand-ins for the worker executable.

use std::{fs, os::unix::fs::PermissionsExt, path::Path, time::Duration};

use nix::{sys::signal::kill, unistd::Pid};

use crate::worker::WorkerBinary;

/// Prelude that leaves the value of `-o` in `$out`.
pub const PARSE_OUTPUT_ARG: &str = r#"out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o)
      shift
      out="$1"
      ;;
  esac
  shift
done
"#;

pub fn install_worker_stub(dir: &Path, body: &str) -> WorkerBinary {
    let path = dir.join("fake-yt-dlp");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    WorkerBinary::locate("fake-yt-dlp", Some(&path)).unwrap()
}

/// A worker that writes `payload` to its `-o` path and exits 0.
pub fn install_download_stub(dir: &Path, payload: &str) -> WorkerBinary {
    install_worker_stub(
        dir,
        &format!("{PARSE_OUTPUT_ARG}printf '%s' '{payload}' > \"$out\"\nexit 0"),
    )
}

/// Shell line that writes `$$` to `pid_file` atomically.
pub fn record_pid(pid_file: &Path) -> String {
    let tmp = pid_file.with_extension("tmp");
    format!(
        "echo $$ > '{}'\nmv '{}' '{}'",
        tmp.display(),
        tmp.display(),
        pid_file.display()
    )
}

/// Shell line that forks a helper into the background, the way yt-dlp forks
/// ffmpeg. The helper records its pid in `pid_file`, then runs `then`, which
/// sees the parent's `$out` as `$1`.
pub fn fork_helper(pid_file: &Path, then: &str) -> String {
    let tmp = pid_file.with_extension("tmp");
    format!(
        "sh -c 'echo $$ > \"{}\"; mv \"{}\" \"{}\"; {then}' helper \"$out\" &",
        tmp.display(),
        tmp.display(),
        pid_file.display()
    )
}

pub async fn wait_for_file(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never appeared", path.display());
}

fn read_pid(pid_file: &Path) -> i32 {
    fs::read_to_string(pid_file).unwrap().trim().parse().unwrap()
}

/// Running and not a zombie. A killed helper is reparented and may linger
/// as a zombie until its new parent reaps it.
pub fn pid_alive(pid_file: &Path) -> bool {
    let pid = read_pid(pid_file);
    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

/// Polls until the process recorded in `pid_file` is gone.
pub async fn wait_until_dead(pid_file: &Path) -> bool {
    for _ in 0..200 {
        if !pid_alive(pid_file) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
