//! End-to-end tests for the reconciler and the ambassador run loop,
//! with real listeners and a canned topology source.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use portkite::discovery::{TaskFilter, TaskSource};
use portkite::error::DiscoveryError;
use portkite::reconcile::{reconcile, Ambassador, ProxySet};
use portkite::topology::{Container, PortBinding, Protocol, Snapshot, Task};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Backend that writes `banner` on accept and then echoes.
async fn spawn_backend(banner: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if !banner.is_empty() {
                    let _ = stream.write_all(banner.as_bytes()).await;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A port that is very likely free: bind ephemeral, note it, release.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn snapshot(entries: &[(u16, Vec<String>)]) -> Snapshot {
    entries.iter().cloned().collect()
}

/// Connect with retries, since the accept loop is spawned asynchronously
/// after reconcile returns.
async fn connect_eventually(addr: SocketAddr) -> TcpStream {
    for _ in 0..40 {
        if let Ok(conn) = TcpStream::connect(addr).await {
            return conn;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("could not connect to {} within the deadline", addr);
}

async fn assert_closed_without_data(conn: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("expected no data, got {} bytes", n),
        Err(_) => panic!("connection was not closed within the deadline"),
    }
}

#[tokio::test]
async fn port_lifecycle_create_update_remove() {
    let first = spawn_backend("one").await;
    let second = spawn_backend("two").await;
    let port = free_port().await;
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    let mut set = ProxySet::new();

    // Round 1: the port appears with one backend
    reconcile(&snapshot(&[(port, vec![first.to_string()])]), &mut set).await;
    assert_eq!(set.ports(), vec![port]);

    let mut old_conn = connect_eventually(addr).await;
    let mut banner = [0u8; 3];
    old_conn.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"one");

    // Round 2: the backend moves; the open connection stays where it is
    reconcile(&snapshot(&[(port, vec![second.to_string()])]), &mut set).await;

    old_conn.write_all(b"sticky").await.unwrap();
    let mut echoed = [0u8; 6];
    old_conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"sticky");

    let mut new_conn = connect_eventually(addr).await;
    let mut banner = [0u8; 3];
    new_conn.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"two");

    // Round 3: the port disappears; everything is torn down
    reconcile(&snapshot(&[]), &mut set).await;
    assert!(set.is_empty());
    assert!(set.ports().is_empty());

    assert_closed_without_data(&mut old_conn).await;
    assert_closed_without_data(&mut new_conn).await;

    let mut refused = false;
    for _ in 0..40 {
        match TcpStream::connect(addr).await {
            Err(_) => {
                refused = true;
                break;
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    assert!(refused, "stale port still accepting connections");
}

#[tokio::test]
async fn losing_all_backends_keeps_the_listener() {
    let backend = spawn_backend("").await;
    let port = free_port().await;
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    let mut set = ProxySet::new();
    reconcile(&snapshot(&[(port, vec![backend.to_string()])]), &mut set).await;
    let mut conn = connect_eventually(addr).await;
    conn.write_all(b"up").await.unwrap();
    let mut buf = [0u8; 2];
    conn.read_exact(&mut buf).await.unwrap();

    // Backends drain away but the port itself is still in the snapshot
    reconcile(&snapshot(&[(port, Vec::new())]), &mut set).await;
    assert_eq!(set.len(), 1);
    assert!(set.get(port).unwrap().is_active());

    // The established connection keeps working on its old backend
    conn.write_all(b"ok").await.unwrap();
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");

    set.get(port).unwrap().close();
}

/// Canned topology source: hands out prepared rounds, then empty lists.
struct StaticSource {
    rounds: Mutex<VecDeque<Vec<Task>>>,
}

impl StaticSource {
    fn new(rounds: Vec<Vec<Task>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
        }
    }
}

impl TaskSource for StaticSource {
    async fn tasks(&self, _filter: &TaskFilter) -> Result<Vec<Task>, DiscoveryError> {
        Ok(self.rounds.lock().pop_front().unwrap_or_default())
    }
}

fn running_task(arn: &str, container: &str, container_port: u16, host_port: u16) -> Task {
    Task {
        arn: arn.to_string(),
        last_status: "RUNNING".to_string(),
        private_ip: Some("127.0.0.1".to_string()),
        public_ip: None,
        containers: vec![Container {
            name: container.to_string(),
            last_status: "RUNNING".to_string(),
            bindings: vec![PortBinding {
                container_port,
                host_port,
                protocol: Protocol::Tcp,
            }],
        }],
    }
}

#[tokio::test]
async fn ambassador_proxies_discovered_tasks() {
    let backend = spawn_backend("").await;
    let port = free_port().await;

    let source = StaticSource::new(vec![vec![running_task(
        "arn:aws:ecs:us-east-1:123:task/abc",
        "web",
        port,
        backend.port(),
    )]]);
    let filter = TaskFilter {
        cluster: "default".to_string(),
        family: Some("web".to_string()),
        service: None,
        container: "web".to_string(),
        public: false,
    };

    tokio::spawn(Ambassador::new(source, filter).run());

    let mut conn = connect_eventually(([127, 0, 0, 1], port).into()).await;
    conn.write_all(b"through the kite").await.unwrap();
    let mut buf = [0u8; 16];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the kite");
}
