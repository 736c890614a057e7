//! Host tests over a real relay with in-memory discovery

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;

use dmsg::{Addr, Client, Server};
use dmsg_core::config::{ClientConfig, CliNet, ServerConfig};
use dmsg_core::disc::{Discovery, MemoryDiscovery};
use dmsg_core::rpc::RpcError;
use dmsg_protocol::cipher::generate_keypair;
use dmsgpty::{
    Cli, Host, MemoryWhitelist, PtyClient, PtyError, Request, Whitelist, WhitelistClient, WinSize,
};

const WAIT: Duration = Duration::from_secs(10);
const PTY_PORT: u16 = 22;

async fn start_server(disc: &Arc<MemoryDiscovery>) -> Server {
    let (pk, sk) = generate_keypair();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(pk, sk, disc.clone(), ServerConfig::default());
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    timeout(WAIT, async {
        while disc.server_entry(&pk).await.is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server never registered");
    server
}

async fn start_client(disc: &Arc<MemoryDiscovery>) -> Client {
    let (pk, sk) = generate_keypair();
    let config = ClientConfig {
        dial_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    };
    let client = Client::new(pk, sk, disc.clone(), config);
    let serving = client.clone();
    tokio::spawn(async move { serving.serve().await });

    timeout(WAIT, async {
        client.ready().await;
        while disc.client_entry(&pk).await.is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never became ready");
    client
}

/// Host on `client` serving dmsg port 22 with `whitelist`
fn start_host(client: &Client, whitelist: Arc<MemoryWhitelist>) -> Host {
    let host = Host::new(client.clone(), whitelist);
    let listener = client.listen(PTY_PORT).unwrap();
    let serving = host.clone();
    tokio::spawn(async move { serving.serve_dmsg(listener).await });
    host
}

async fn start_cli(host: &Host) -> Cli {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let serving = host.clone();
    tokio::spawn(async move { serving.serve_cli_tcp(listener).await });
    Cli::new(CliNet::Tcp, addr)
}

async fn read_until_exit(client: &PtyClient) -> String {
    let mut out = Vec::new();
    timeout(WAIT, async {
        loop {
            let chunk = client.read(1024).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
    })
    .await
    .expect("pty never exited");
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_whitelisted_peers_get_a_pty() {
    let disc = Arc::new(MemoryDiscovery::new());
    let _server = start_server(&disc).await;
    let h = start_client(&disc).await;
    let b = start_client(&disc).await;
    let c = start_client(&disc).await;

    let whitelist = Arc::new(MemoryWhitelist::with_keys([b.local_pk()]));
    let _host = start_host(&h, whitelist);
    let dst = Addr::new(h.local_pk(), PTY_PORT);

    // Not whitelisted: the host hangs up without answering.
    let stream = timeout(WAIT, c.dial_stream(dst)).await.unwrap().unwrap();
    // The request write itself may already fail if the hang-up wins the race.
    if let Ok(denied) = PtyClient::connect(stream, Request::local_pty()).await {
        let err = timeout(WAIT, denied.start("echo", &["nope".into()], WinSize::default()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, PtyError::Rpc(RpcError::ConnectionClosed)), "got {err:?}");
    }

    // Whitelisted: the command runs and its output comes back.
    let stream = timeout(WAIT, b.dial_stream(dst)).await.unwrap().unwrap();
    let allowed = PtyClient::connect(stream, Request::local_pty()).await.unwrap();
    allowed
        .start("echo", &["hello from h".into()], WinSize::default())
        .await
        .unwrap();
    let out = read_until_exit(&allowed).await;
    assert!(out.contains("hello from h"), "output was {out:?}");
    allowed.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cfg_requests_refused_over_dmsg() {
    let disc = Arc::new(MemoryDiscovery::new());
    let _server = start_server(&disc).await;
    let h = start_client(&disc).await;
    let b = start_client(&disc).await;

    let whitelist = Arc::new(MemoryWhitelist::with_keys([b.local_pk()]));
    let host = start_host(&h, whitelist);

    let stream = timeout(WAIT, b.dial_stream(Addr::new(h.local_pk(), PTY_PORT)))
        .await
        .unwrap()
        .unwrap();
    let cfg = WhitelistClient::connect(stream).await.unwrap();
    let err = timeout(WAIT, cfg.view()).await.unwrap().unwrap_err();
    assert!(matches!(err, PtyError::Rpc(RpcError::ConnectionClosed)), "got {err:?}");

    timeout(WAIT, async {
        while host.stream_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never dropped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cli_edits_whitelist() {
    let disc = Arc::new(MemoryDiscovery::new());
    let _server = start_server(&disc).await;
    let h = start_client(&disc).await;

    let whitelist = Arc::new(MemoryWhitelist::new());
    let host = Host::new(h.clone(), whitelist.clone());
    let cli = start_cli(&host).await;

    let (pk, _) = generate_keypair();
    let wl = cli.whitelist_client().await.unwrap();
    wl.add(&[pk]).await.unwrap();
    assert_eq!(wl.view().await.unwrap(), vec![pk]);
    assert!(whitelist.get(&pk).await.unwrap());

    wl.remove(&[pk]).await.unwrap();
    assert!(wl.view().await.unwrap().is_empty());
    assert_eq!(host.cli_connections(), 1);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cli_pty_proxied_to_remote_host() {
    let disc = Arc::new(MemoryDiscovery::new());
    let _server = start_server(&disc).await;
    let h = start_client(&disc).await;
    let b = start_client(&disc).await;

    let _remote = start_host(&h, Arc::new(MemoryWhitelist::with_keys([b.local_pk()])));
    let local = Host::new(b.clone(), Arc::new(MemoryWhitelist::new()));
    let cli = start_cli(&local).await;

    let pty = cli
        .pty_client(Request::remote_pty(h.local_pk(), PTY_PORT))
        .await
        .unwrap();
    pty.start("echo", &["proxied".into()], WinSize { rows: 30, cols: 100 })
        .await
        .unwrap();
    let out = read_until_exit(&pty).await;
    assert!(out.contains("proxied"), "output was {out:?}");
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unix_socket_removed_on_close() {
    let disc = Arc::new(MemoryDiscovery::new());
    let _server = start_server(&disc).await;
    let h = start_client(&disc).await;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("dmsgpty.sock");
    let addr = path.to_string_lossy().into_owned();
    // A stale socket file from an earlier run must not block binding.
    std::fs::write(&path, b"").unwrap();

    let host = Host::new(h.clone(), Arc::new(MemoryWhitelist::new()));
    let serving = host.clone();
    let serve_addr = addr.clone();
    let task = tokio::spawn(async move { serving.serve_cli(CliNet::Unix, &serve_addr).await });

    let cli = Cli::new(CliNet::Unix, addr);
    let wl = timeout(WAIT, async {
        loop {
            match cli.whitelist_client().await {
                Ok(wl) => break wl,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .unwrap();
    assert!(wl.view().await.unwrap().is_empty());

    host.close();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert!(!path.exists());
}
