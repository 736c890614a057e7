//! A single local pseudo-terminal process

use std::io::{Read, Write};
use std::sync::Mutex;

use bytes::BytesMut;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::error::PtyError;

const READ_CHUNK: usize = 4096;
const OUTPUT_QUEUE: usize = 64;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WinSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<WinSize> for PtySize {
    fn from(size: WinSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

struct Process {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    reader_cancel: CancellationToken,
}

impl Process {
    fn kill(mut self) {
        self.reader_cancel.cancel();
        let _ = self.child.kill();
        // Reap off the runtime threads.
        let mut child = self.child;
        tokio::task::spawn_blocking(move || match child.wait() {
            Ok(status) => tracing::debug!(code = status.exit_code(), "pty process exited"),
            Err(e) => tracing::debug!(error = %e, "Failed to reap pty process"),
        });
    }
}

struct Output {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: BytesMut,
}

/// A pty process owned by one gateway
///
/// At most one process runs at a time. Output is pumped by a blocking reader
/// thread into a bounded queue, so a slow `read` caller back-pressures the
/// process instead of buffering without limit.
pub struct LocalPty {
    process: Mutex<Option<Process>>,
    output: AsyncMutex<Option<Output>>,
}

impl Default for LocalPty {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPty {
    pub fn new() -> Self {
        Self {
            process: Mutex::new(None),
            output: AsyncMutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_process().is_some()
    }

    fn lock_process(&self) -> std::sync::MutexGuard<'_, Option<Process>> {
        self.process.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `name` with `args` in a fresh pty of `size`
    pub async fn start(&self, name: &str, args: &[String], size: WinSize) -> Result<(), PtyError> {
        if self.is_running() {
            return Err(PtyError::AlreadyStarted);
        }

        tracing::info!(command = %name, rows = size.rows, cols = size.cols, "Starting pty");

        let pair = native_pty_system().openpty(size.into()).map_err(PtyError::pty)?;

        let mut cmd = CommandBuilder::new(name);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");
        let child = pair.slave.spawn_command(cmd).map_err(PtyError::pty)?;
        // The child holds the only slave handle so its exit ends our reads.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(PtyError::pty)?;
        let writer = pair.master.take_writer().map_err(PtyError::pty)?;

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
        let reader_cancel = CancellationToken::new();
        spawn_reader(reader, tx, reader_cancel.clone());

        let process = Process {
            master: pair.master,
            child,
            writer,
            reader_cancel,
        };

        *self.output.lock().await = Some(Output {
            rx,
            pending: BytesMut::new(),
        });

        let mut slot = self.lock_process();
        if slot.is_some() {
            drop(slot);
            process.kill();
            return Err(PtyError::AlreadyStarted);
        }
        *slot = Some(process);
        Ok(())
    }

    /// Kill the running process
    pub fn stop(&self) -> Result<(), PtyError> {
        let process = self.lock_process().take().ok_or(PtyError::NotStarted)?;
        tracing::info!("Stopping pty");
        process.kill();
        Ok(())
    }

    /// Read up to `max` bytes of output; an empty result means the process
    /// has exited and all of its output was consumed
    pub async fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        if !self.is_running() {
            return Err(PtyError::NotStarted);
        }
        let max = max.max(1);

        let mut guard = self.output.lock().await;
        let out = guard.as_mut().ok_or(PtyError::NotStarted)?;

        if out.pending.is_empty() {
            match out.rx.recv().await {
                Some(data) => out.pending.extend_from_slice(&data),
                None => return Ok(Vec::new()),
            }
        }
        let n = max.min(out.pending.len());
        Ok(out.pending.split_to(n).to_vec())
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let mut slot = self.lock_process();
        let process = slot.as_mut().ok_or(PtyError::NotStarted)?;
        process.writer.write_all(data)?;
        process.writer.flush()?;
        Ok(data.len())
    }

    pub fn set_pty_size(&self, size: WinSize) -> Result<(), PtyError> {
        let slot = self.lock_process();
        let process = slot.as_ref().ok_or(PtyError::NotStarted)?;
        tracing::debug!(rows = size.rows, cols = size.cols, "Resizing pty");
        process.master.resize(size.into()).map_err(PtyError::pty)
    }
}

impl Drop for LocalPty {
    fn drop(&mut self) {
        let process = self
            .process
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut process) = process {
            process.reader_cancel.cancel();
            let _ = process.child.kill();
        }
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO once the child side closes on Linux.
                    tracing::debug!(error = %e, "pty reader closed");
                    break;
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn read_all(pty: &LocalPty) -> String {
        let mut out = Vec::new();
        loop {
            let chunk = pty.read(1024).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_command_output() {
        let pty = LocalPty::new();
        pty.start("echo", &["hello pty".to_string()], WinSize::default())
            .await
            .unwrap();

        let out = read_all(&pty).await;
        assert!(out.contains("hello pty"), "output was {out:?}");
        pty.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice_fails() {
        let pty = LocalPty::new();
        pty.start("sleep", &["5".to_string()], WinSize::default())
            .await
            .unwrap();
        let err = pty
            .start("sleep", &["5".to_string()], WinSize::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PtyError::AlreadyStarted));
        pty.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_not_started() {
        let pty = LocalPty::new();
        assert!(matches!(pty.stop(), Err(PtyError::NotStarted)));
        assert!(matches!(pty.write(b"x"), Err(PtyError::NotStarted)));
        assert!(matches!(pty.read(16).await, Err(PtyError::NotStarted)));
        assert!(matches!(
            pty.set_pty_size(WinSize::default()),
            Err(PtyError::NotStarted)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_reaches_process() {
        let pty = LocalPty::new();
        pty.start("cat", &[], WinSize::default()).await.unwrap();
        pty.set_pty_size(WinSize { rows: 40, cols: 120 }).unwrap();
        pty.write(b"ping\n").unwrap();

        let mut seen = String::new();
        while !seen.contains("ping") {
            let chunk = pty.read(64).await.unwrap();
            assert!(!chunk.is_empty(), "cat exited early");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        pty.stop().unwrap();
    }
}
