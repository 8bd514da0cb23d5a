#![forbid(unsafe_code)]

//! One supervised worker process per request.
//!
//! A [`SupervisedProcess`] owns the child handle plus two background readers:
//! one that keeps the tail of stderr for diagnostics and, in metadata mode,
//! one that drains stdout. Exit is observed through [`SupervisedProcess::wait`],
//! which is cancel safe and can sit inside a `tokio::select!` next to other
//! termination triggers.

use std::{
    ffi::OsString,
    io,
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::worker::WorkerBinary;

/// Most stderr bytes kept per process.
pub const STDERR_TAIL_LIMIT: usize = 64 * 1024;

/// Most stdout bytes kept in metadata mode. A metadata dump is far smaller.
pub const STDOUT_LIMIT: usize = 32 * 1024 * 1024;

/// How long a pipe reader may outlive the worker. Helpers the worker forked
/// can keep a pipe open after it exits.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on reaping a worker after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputCapture {
    /// The worker writes to a file; stdout is discarded.
    Discard,
    /// The worker writes its result to stdout.
    Stdout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forceful,
}

/// Why a worker stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Code(i32),
    Signal(i32),
}

impl ExitReason {
    pub fn success(self) -> bool {
        self == Self::Code(0)
    }
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signal(signal),
            (None, None) => Self::Code(-1),
        }
    }
}

/// A worker and everything it forked. The worker leads its own process
/// group, so helpers such as ffmpeg are signalled together with it.
pub struct SupervisedProcess {
    child: Child,
    pgid: Option<Pid>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    exit: Option<ExitReason>,
    sent: Option<TermSignal>,
}

impl SupervisedProcess {
    /// Spawns the worker. An `Err` here is the spawn-error signal: the OS
    /// could not create the process at all.
    pub fn start(
        worker: &WorkerBinary,
        args: Vec<OsString>,
        capture: OutputCapture,
    ) -> io::Result<Self> {
        let stdout = match capture {
            OutputCapture::Discard => Stdio::null(),
            OutputCapture::Stdout => Stdio::piped(),
        };
        let mut child = Command::new(worker.path())
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        debug!(pid = child.id(), worker = %worker.path().display(), "spawned worker");

        let stdout = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, STDOUT_LIMIT)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_tail(pipe, STDERR_TAIL_LIMIT)));

        Ok(Self {
            child,
            pgid,
            stdout,
            stderr,
            exit: None,
            sent: None,
        })
    }

    #[cfg(test)]
    pub fn id(&self) -> Option<u32> {
        self.pgid.map(|pid| pid.as_raw() as u32)
    }

    #[cfg(test)]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    /// Signal most recently delivered by [`Self::terminate`].
    #[cfg(test)]
    pub fn signal_sent(&self) -> Option<TermSignal> {
        self.sent
    }

    /// Resolves once the worker is gone. Cancel safe; after the first
    /// completion it returns the recorded reason immediately.
    pub async fn wait(&mut self) -> io::Result<ExitReason> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        Ok(self.record_exit(status))
    }

    /// Sends `signal` to the worker's process group. A no-op once the worker
    /// has exited.
    pub fn terminate(&mut self, signal: TermSignal) {
        if self.exit.is_some() {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.record_exit(status);
            return;
        }
        let Some(pgid) = self.pgid else {
            return;
        };

        let raw = match signal {
            TermSignal::Graceful => Signal::SIGTERM,
            TermSignal::Forceful => Signal::SIGKILL,
        };
        match signal::killpg(pgid, raw) {
            Ok(()) => {
                debug!(pgid = pgid.as_raw(), ?signal, "signalled worker group");
                self.sent = Some(signal);
            }
            Err(err) => warn!(pgid = pgid.as_raw(), ?signal, error = %err, "failed to signal worker"),
        }
    }

    /// Kills a running worker and waits for it to be reaped, so no zombie is
    /// left behind when the request gives up on it.
    pub async fn kill_and_reap(&mut self) {
        self.terminate(TermSignal::Forceful);
        if self.exit.is_some() {
            return;
        }
        match tokio::time::timeout(REAP_TIMEOUT, self.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "waiting for killed worker failed"),
            Err(_) => warn!(pgid = ?self.pgid, "killed worker was not reaped in time"),
        }
    }

    /// Everything the worker wrote to stdout, up to [`STDOUT_LIMIT`]. Empty
    /// when stdout was not captured or was already taken.
    pub async fn take_stdout(&mut self) -> Vec<u8> {
        drain(self.stdout.take()).await
    }

    /// Tail of stderr, lossily decoded.
    pub async fn take_stderr(&mut self) -> String {
        String::from_utf8_lossy(&drain(self.stderr.take()).await).into_owned()
    }

    fn record_exit(&mut self, status: ExitStatus) -> ExitReason {
        let exit = ExitReason::from(status);
        self.exit = Some(exit);
        debug!(pgid = ?self.pgid, ?exit, signal = ?self.sent, "worker exited");
        self.sweep_group();
        exit
    }

    /// Kills whatever the worker left running in its group. The group id
    /// stays reserved while any member is alive, so this cannot reach an
    /// unrelated process.
    fn sweep_group(&self) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match signal::killpg(pgid, Signal::SIGKILL) {
            Ok(()) => debug!(pgid = pgid.as_raw(), "killed leftover worker helpers"),
            Err(Errno::ESRCH) => {}
            Err(err) => warn!(pgid = pgid.as_raw(), error = %err, "failed to sweep worker group"),
        }
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            self.sweep_group();
        }
    }
}

async fn drain(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(handle) = handle else {
        return Vec::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            warn!(error = %err, "pipe reader task failed");
            Vec::new()
        }
        Err(_) => {
            warn!("pipe reader did not finish after worker exit");
            Vec::new()
        }
    }
}

/// Keeps the first `limit` bytes and discards the rest, still reading to EOF
/// so the worker never blocks on a full pipe.
async fn read_capped(mut pipe: impl AsyncRead + Unpin, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut dropped = 0usize;
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buf.len());
                let kept = n.min(room);
                buf.extend_from_slice(&chunk[..kept]);
                dropped += n - kept;
            }
            Err(err) => {
                warn!(error = %err, "reading worker stdout failed");
                break;
            }
        }
    }
    if dropped > 0 {
        warn!(limit, dropped, "worker stdout exceeded limit, output truncated");
    }
    buf
}

async fn read_tail(mut pipe: impl AsyncRead + Unpin, limit: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
            Err(err) => {
                warn!(error = %err, "reading worker stderr failed");
                break;
            }
        }
    }
    tail
}
