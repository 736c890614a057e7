//! End-to-end tests driving the dmsg binary against live services

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use dmsg::Client;
use dmsg_core::config::{ClientConfig, CliNet};
use dmsg_core::disc::{Discovery, HttpDiscovery, MemoryDiscovery};
use dmsg_protocol::cipher::generate_keypair;
use dmsgpty::{Host, MemoryWhitelist, Whitelist};

const WAIT: Duration = Duration::from_secs(10);

/// Kills the child process on drop
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn run_dmsg(args: Vec<String>) -> std::process::Output {
    tokio::task::spawn_blocking(move || {
        assert_cmd::Command::cargo_bin("dmsg")
            .unwrap()
            .args(&args)
            .output()
            .unwrap()
    })
    .await
    .unwrap()
}

/// Host with a TCP CLI listener and no dmsg sessions
async fn start_host(whitelist: Arc<MemoryWhitelist>) -> (Host, String) {
    let (pk, sk) = generate_keypair();
    let client = Client::new(
        pk,
        sk,
        Arc::new(MemoryDiscovery::new()),
        ClientConfig::default(),
    );
    let host = Host::new(client, whitelist);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let serving = host.clone();
    tokio::spawn(async move { serving.serve_cli_tcp(listener).await });
    (host, addr)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_whitelist_commands_edit_running_host() {
    let whitelist = Arc::new(MemoryWhitelist::new());
    let (host, addr) = start_host(Arc::clone(&whitelist)).await;
    let target = |action: &str| {
        vec![
            "pty".to_string(),
            action.to_string(),
            "--cli-net".to_string(),
            CliNet::Tcp.to_string(),
            "--cli-addr".to_string(),
            addr.clone(),
        ]
    };

    let (a, _) = generate_keypair();
    let (b, _) = generate_keypair();

    let mut add = target("whitelist-add");
    add.extend([a.to_hex(), b.to_hex()]);
    let out = run_dmsg(add).await;
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(whitelist.get(&a).await.unwrap());
    assert!(whitelist.get(&b).await.unwrap());

    let mut remove = target("whitelist-remove");
    remove.push(a.to_hex());
    let out = run_dmsg(remove).await;
    assert!(out.status.success());

    let mut view = target("whitelist");
    view.push("--json".to_string());
    let out = run_dmsg(view).await;
    assert!(out.status.success());
    let keys: Vec<String> = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(keys, vec![b.to_hex()]);

    host.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_discovery_command_serves_api() {
    let bind = format!("127.0.0.1:{}", free_port());
    let child = Command::new(assert_cmd::cargo::cargo_bin("dmsg"))
        .args(["discovery", "--bind", &bind])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let _guard = ChildGuard(child);

    let disc = HttpDiscovery::new(format!("http://{}", bind));
    let servers = tokio::time::timeout(WAIT, async {
        loop {
            match disc.available_servers().await {
                Ok(servers) => break servers,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("discovery service never came up");
    assert!(servers.is_empty());

    let (pk, _) = generate_keypair();
    assert!(disc.entry(&pk).await.is_err());
}
