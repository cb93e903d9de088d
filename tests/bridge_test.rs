// Integration tests for the socket side of the bridge, through the library API.
//
// These tests verify that:
// 1. Many clients writing in random fragments each get their own reply
// 2. A bridge can forward to another bridge through the socket backend
// 3. Reuse probing distinguishes live, stale and absent sockets

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_bridge::backend::{BackendSpec, Dispatcher};
use agent_bridge::daemon::CleanupState;
use agent_bridge::socket::framing::encode_frame;
use agent_bridge::socket::listener::bind_and_listen;
use agent_bridge::socket::{try_reuse, ReuseOutcome, SocketServer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinSet;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Replies with message type 6 followed by the request payload reversed.
fn reversing_agent() -> Arc<dyn Dispatcher> {
    Arc::new(|request: &[u8]| {
        let mut reply = vec![6u8];
        reply.extend(request[4..].iter().rev());
        Some(encode_frame(&reply))
    })
}

fn start(path: &Path, dispatcher: Arc<dyn Dispatcher>, cleanup: &CleanupState) -> SocketServer {
    let listener = bind_and_listen(path, cleanup).unwrap();
    SocketServer::start(listener, dispatcher, 64).unwrap()
}

async fn read_frame(stream: &mut UnixStream) -> Vec<u8> {
    let mut prefix = [0u8; 4];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut prefix))
        .await
        .expect("Timed out waiting for reply")
        .expect("Read failed");
    let mut frame = prefix.to_vec();
    frame.resize(4 + u32::from_be_bytes(prefix) as usize, 0);
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut frame[4..]))
        .await
        .expect("Timed out waiting for reply body")
        .expect("Read failed");
    frame
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_with_fragmented_writes() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("agent.sock");
    let cleanup = CleanupState::new();
    let server = start(&path, reversing_agent(), &cleanup);

    let mut clients = JoinSet::new();
    for client in 0..32u64 {
        let path = path.clone();
        clients.spawn(async move {
            let mut rng = StdRng::seed_from_u64(client);
            let mut stream = UnixStream::connect(&path).await.unwrap();

            for round in 0..3u64 {
                // Nonce first so crossed replies would be caught.
                let len: usize = rng.random_range(16..4096);
                let mut payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                payload[..8].copy_from_slice(&((client << 8) | round).to_be_bytes());
                let request = encode_frame(&payload);

                let mut offset = 0;
                while offset < request.len() {
                    let n = rng.random_range(1..=97).min(request.len() - offset);
                    stream.write_all(&request[offset..offset + n]).await.unwrap();
                    offset += n;
                    if rng.random_bool(0.3) {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }

                let mut expected = vec![6u8];
                expected.extend(payload.iter().rev());
                assert_eq!(read_frame(&mut stream).await, encode_frame(&expected));
            }
        });
    }
    while let Some(result) = clients.join_next().await {
        result.unwrap();
    }

    server.shutdown().await;
    assert!(cleanup.run());
    assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bridge_forwards_to_upstream_bridge() {
    let tmp = TempDir::new().unwrap();
    let upstream_path = tmp.path().join("upstream.sock");
    let front_path = tmp.path().join("front.sock");
    let cleanup = CleanupState::new();

    let upstream = start(&upstream_path, reversing_agent(), &cleanup);
    let backend = BackendSpec::Socket { path: upstream_path.clone() }.build(TIMEOUT);
    let front = start(&front_path, backend, &CleanupState::new());

    let mut stream = UnixStream::connect(&front_path).await.unwrap();
    stream.write_all(&encode_frame(&[11, 1, 2, 3])).await.unwrap();
    assert_eq!(read_frame(&mut stream).await, encode_frame(&[6, 3, 2, 1, 11]));

    // Upstream gone: the client now gets the failure reply.
    upstream.shutdown().await;
    std::fs::remove_file(&upstream_path).unwrap();
    stream.write_all(&encode_frame(&[11])).await.unwrap();
    assert_eq!(read_frame(&mut stream).await, vec![0, 0, 0, 1, 5]);

    front.shutdown().await;
}

#[tokio::test]
async fn test_reuse_of_live_then_stale_socket() {
    let tmp = TempDir::new().unwrap();
    let path: PathBuf = tmp.path().join("agent.sock");
    let cleanup = CleanupState::new();

    assert_eq!(try_reuse(&path).unwrap(), ReuseOutcome::NotPresent);

    let server = start(&path, reversing_agent(), &cleanup);
    assert_eq!(
        tokio::task::spawn_blocking({
            let path = path.clone();
            move || try_reuse(&path).unwrap()
        })
        .await
        .unwrap(),
        ReuseOutcome::Reused
    );
    assert!(path.exists(), "reuse must not remove a live socket");

    // The listener is gone but the file stays behind, as after a crash.
    server.shutdown().await;
    assert!(path.exists());
    assert_eq!(try_reuse(&path).unwrap(), ReuseOutcome::StaleRemoved);
    assert!(!path.exists());

    let rebound = start(&path, reversing_agent(), &CleanupState::new());
    let mut stream = UnixStream::connect(&path).await.unwrap();
    stream.write_all(&encode_frame(&[11])).await.unwrap();
    assert_eq!(read_frame(&mut stream).await, encode_frame(&[6, 11]));
    rebound.shutdown().await;
}
