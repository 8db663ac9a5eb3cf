//! PTY process plumbing on top of `portable-pty`.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::TerminalError;
use crate::shell_env;

const READ_CHUNK: usize = 8192;

/// Program and arguments a terminal runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    /// The user's shell as a login shell.
    pub fn login_shell() -> Self {
        Self {
            program: shell_env::user_shell(),
            args: vec!["-l".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyExit {
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
}

/// Handles kept by the session after spawn.
pub struct PtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pub pid: Option<u32>,
}

impl PtyHandle {
    pub fn write_all(&self, data: &[u8]) -> Result<(), TerminalError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(pty_size(cols, rows))
            .map_err(|e| TerminalError::Pty(e.to_string()))
    }

    pub fn kill(&self) {
        let _ = self
            .killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill();
    }
}

pub struct SpawnedPty {
    pub handle: PtyHandle,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn portable_pty::Child + Send + Sync>,
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

pub fn spawn_pty(
    shell: &ShellCommand,
    path_env: &str,
    cwd: &Path,
    cols: u16,
    rows: u16,
) -> Result<SpawnedPty, TerminalError> {
    let pair = native_pty_system()
        .openpty(pty_size(cols, rows))
        .map_err(|e| TerminalError::Pty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&shell.program);
    cmd.args(&shell.args);
    cmd.cwd(cwd);
    cmd.env("PATH", path_env);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| TerminalError::Pty(e.to_string()))?;
    // The reader only sees EOF once no slave handle remains open here.
    drop(pair.slave);

    let killer = child.clone_killer();
    let pid = child.process_id();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TerminalError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| TerminalError::Pty(e.to_string()))?;

    Ok(SpawnedPty {
        handle: PtyHandle {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            pid,
        },
        reader,
        child,
    })
}

/// Pause/resume counters for the PTY read side.
#[derive(Debug, Default)]
pub struct PumpStats {
    pub pauses: AtomicU64,
    pub resumes: AtomicU64,
    pub bytes: AtomicU64,
}

/// Blocking read loop feeding a bounded channel.
///
/// When the channel is full the loop stops reading until the consumer makes
/// room, so a slow consumer throttles the PTY instead of growing a buffer.
pub fn pump_output<R: Read>(mut reader: R, tx: mpsc::Sender<Bytes>, stats: &PumpStats) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // EIO once the child side hangs up.
            Err(_) => break,
        };
        stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        match tx.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                stats.pauses.fetch_add(1, Ordering::Relaxed);
                if tx.blocking_send(chunk).is_err() {
                    break;
                }
                stats.resumes.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

pub fn wait_child(mut child: Box<dyn portable_pty::Child + Send + Sync>) -> PtyExit {
    match child.wait() {
        Ok(status) => PtyExit {
            exit_code: Some(status.exit_code()),
            signal: status.signal().map(str::to_string),
        },
        Err(_) => PtyExit {
            exit_code: None,
            signal: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Produces `total` bytes of a repeating counter pattern in small reads.
    struct PatternReader {
        produced: usize,
        total: usize,
    }

    impl Read for PatternReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = (self.total - self.produced).min(buf.len()).min(1024);
            for (i, byte) in buf[..n].iter_mut().enumerate() {
                *byte = ((self.produced + i) % 251) as u8;
            }
            self.produced += n;
            Ok(n)
        }
    }

    #[tokio::test]
    async fn slow_consumer_pauses_reader_without_loss() {
        const TOTAL: usize = 256 * 1024;
        let (tx, mut rx) = mpsc::channel(2);
        let stats = std::sync::Arc::new(PumpStats::default());
        let pump_stats = stats.clone();
        let pump = tokio::task::spawn_blocking(move || {
            pump_output(
                PatternReader {
                    produced: 0,
                    total: TOTAL,
                },
                tx,
                &pump_stats,
            )
        });

        let mut received = Vec::with_capacity(TOTAL);
        while let Some(chunk) = rx.recv().await {
            received.extend_from_slice(&chunk);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        pump.await.unwrap();

        assert_eq!(received.len(), TOTAL);
        assert!(received
            .iter()
            .enumerate()
            .all(|(i, b)| *b == (i % 251) as u8));
        let pauses = stats.pauses.load(Ordering::Relaxed);
        assert!(pauses >= 1);
        assert_eq!(pauses, stats.resumes.load(Ordering::Relaxed));
    }
}
