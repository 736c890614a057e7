//! CLI side of a pty host: connects to the host's CLI listener

use std::sync::Arc;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dmsg_core::config::{default_cli_addr, CliNet};
use dmsg_protocol::PubKey;

use crate::client::{PtyClient, WhitelistClient};
use crate::error::PtyError;
use crate::pty::WinSize;
use crate::request::Request;

const READ_CHUNK: usize = 4096;

/// Byte stream to the host, whichever network it listens on
pub trait CliConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> CliConn for T {}

/// Where the local host listens for CLI connections
#[derive(Debug, Clone)]
pub struct Cli {
    pub net: CliNet,
    pub addr: String,
}

impl Default for Cli {
    fn default() -> Self {
        if cfg!(unix) {
            Self {
                net: CliNet::Unix,
                addr: default_cli_addr(),
            }
        } else {
            Self {
                net: CliNet::Tcp,
                addr: "127.0.0.1:3435".to_string(),
            }
        }
    }
}

impl Cli {
    pub fn new(net: CliNet, addr: impl Into<String>) -> Self {
        Self {
            net,
            addr: addr.into(),
        }
    }

    async fn connect(&self) -> Result<Box<dyn CliConn>, PtyError> {
        match self.net {
            CliNet::Tcp => {
                let conn = TcpStream::connect(&self.addr).await?;
                conn.set_nodelay(true)?;
                Ok(Box::new(conn))
            }
            #[cfg(unix)]
            CliNet::Unix => Ok(Box::new(tokio::net::UnixStream::connect(&self.addr).await?)),
            #[cfg(not(unix))]
            CliNet::Unix => Err(PtyError::Request(
                "unix CLI sockets are not supported on this platform".to_string(),
            )),
        }
    }

    pub async fn whitelist_client(&self) -> Result<WhitelistClient, PtyError> {
        WhitelistClient::connect(self.connect().await?).await
    }

    /// Open a pty session through the host without starting anything
    pub async fn pty_client(&self, req: Request) -> Result<PtyClient, PtyError> {
        PtyClient::connect(self.connect().await?, req).await
    }

    /// Run `name` on the host's own pty, bridged to this terminal
    pub async fn start_pty(&self, name: &str, args: &[String]) -> Result<(), PtyError> {
        let client = self.pty_client(Request::local_pty()).await?;
        run_interactive(client, name, args).await
    }

    /// Run `name` on the host at `pk:port`, proxied by the local host
    pub async fn start_remote_pty(
        &self,
        pk: PubKey,
        port: u16,
        name: &str,
        args: &[String],
    ) -> Result<(), PtyError> {
        let client = self.pty_client(Request::remote_pty(pk, port)).await?;
        run_interactive(client, name, args).await
    }
}

fn terminal_size() -> WinSize {
    match size() {
        Ok((cols, rows)) => WinSize { rows, cols },
        Err(_) => WinSize::default(),
    }
}

/// Bridge the local terminal to a pty until the process exits or the
/// user detaches with Ctrl+]
async fn run_interactive(client: PtyClient, name: &str, args: &[String]) -> Result<(), PtyError> {
    let client = Arc::new(client);
    client.start(name, args, terminal_size()).await?;

    enable_raw_mode()?;
    let result = bridge(&client).await;
    let restored = disable_raw_mode();

    if let Err(e) = client.stop().await {
        tracing::debug!(error = %e, "pty stop after session");
    }
    result?;
    restored?;
    Ok(())
}

async fn bridge(client: &Arc<PtyClient>) -> Result<(), PtyError> {
    let cancel = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);

    let events = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            while !cancel.is_cancelled() {
                if event::poll(std::time::Duration::from_millis(10)).unwrap_or(false) {
                    if let Ok(evt) = event::read() {
                        if event_tx.blocking_send(evt).is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let mut output = {
        let client = Arc::clone(client);
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                let chunk = client.read(READ_CHUNK).await?;
                if chunk.is_empty() {
                    return Ok::<_, PtyError>(());
                }
                stdout.write_all(&chunk).await?;
                stdout.flush().await?;
            }
        })
    };

    let result = loop {
        tokio::select! {
            res = &mut output => {
                break match res {
                    Ok(res) => res,
                    Err(e) => Err(PtyError::pty(e)),
                };
            }
            Some(evt) = event_rx.recv() => match evt {
                Event::Key(KeyEvent { code, modifiers, kind, .. }) if kind != KeyEventKind::Release => {
                    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char(']') {
                        break Ok(());
                    }
                    let data = key_to_bytes(code, modifiers);
                    if !data.is_empty() {
                        if let Err(e) = client.write(&data).await {
                            break Err(e);
                        }
                    }
                }
                Event::Resize(cols, rows) => {
                    if let Err(e) = client.set_pty_size(WinSize { rows, cols }).await {
                        tracing::debug!(error = %e, "Failed to forward terminal size");
                    }
                }
                _ => {}
            },
        }
    };

    cancel.cancel();
    output.abort();
    let _ = events.await;
    result
}

/// Convert a key event to the bytes a terminal would send
fn key_to_bytes(code: KeyCode, modifiers: KeyModifiers) -> Vec<u8> {
    use KeyCode::*;

    match code {
        Char(c) if modifiers.contains(KeyModifiers::CONTROL) => {
            match c.to_ascii_lowercase() {
                c @ 'a'..='z' => vec![c as u8 - b'a' + 1],
                '@' | ' ' => vec![0],
                '\\' => vec![0x1c],
                '^' => vec![0x1e],
                '_' => vec![0x1f],
                _ => vec![],
            }
        }
        Char(c) => {
            let mut buf = [0u8; 4];
            let encoded = c.encode_utf8(&mut buf).as_bytes();
            if modifiers.contains(KeyModifiers::ALT) {
                let mut out = vec![0x1b];
                out.extend_from_slice(encoded);
                out
            } else {
                encoded.to_vec()
            }
        }
        Enter => vec![b'\r'],
        Tab => vec![b'\t'],
        BackTab => vec![0x1b, b'[', b'Z'],
        Backspace => vec![0x7f],
        Esc => vec![0x1b],
        Up => vec![0x1b, b'[', b'A'],
        Down => vec![0x1b, b'[', b'B'],
        Right => vec![0x1b, b'[', b'C'],
        Left => vec![0x1b, b'[', b'D'],
        Home => vec![0x1b, b'[', b'H'],
        End => vec![0x1b, b'[', b'F'],
        PageUp => vec![0x1b, b'[', b'5', b'~'],
        PageDown => vec![0x1b, b'[', b'6', b'~'],
        Delete => vec![0x1b, b'[', b'3', b'~'],
        Insert => vec![0x1b, b'[', b'2', b'~'],
        F(n @ 1..=4) => vec![0x1b, b'O', b'P' + (n - 1)],
        F(n) => match n {
            5 => b"\x1b[15~".to_vec(),
            6 => b"\x1b[17~".to_vec(),
            7 => b"\x1b[18~".to_vec(),
            8 => b"\x1b[19~".to_vec(),
            9 => b"\x1b[20~".to_vec(),
            10 => b"\x1b[21~".to_vec(),
            11 => b"\x1b[23~".to_vec(),
            12 => b"\x1b[24~".to_vec(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_keys() {
        assert_eq!(key_to_bytes(KeyCode::Char('c'), KeyModifiers::CONTROL), vec![3]);
        assert_eq!(key_to_bytes(KeyCode::Char('D'), KeyModifiers::CONTROL), vec![4]);
        assert_eq!(key_to_bytes(KeyCode::Char('x'), KeyModifiers::ALT), vec![0x1b, b'x']);
    }

    #[test]
    fn test_unicode_and_function_keys() {
        assert_eq!(
            key_to_bytes(KeyCode::Char('é'), KeyModifiers::NONE),
            "é".as_bytes().to_vec()
        );
        assert_eq!(key_to_bytes(KeyCode::F(2), KeyModifiers::NONE), b"\x1bOQ".to_vec());
        assert_eq!(key_to_bytes(KeyCode::F(12), KeyModifiers::NONE), b"\x1b[24~".to_vec());
    }
}
