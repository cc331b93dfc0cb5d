//! Integration tests for relay lifecycle and shutdown

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use faultrelay::Relay;

/// Spawn an echo server on an ephemeral port and return its address
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
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
                Err(_) => break,
            }
        }
    });

    addr
}

#[tokio::test]
async fn test_stop_without_start_is_safe() {
    let relay = Relay::new(0, "127.0.0.1", 9999);

    let stopped = timeout(Duration::from_secs(1), relay.stop()).await;
    assert!(stopped.is_ok());

    // And again
    let stopped = timeout(Duration::from_secs(1), relay.stop()).await;
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_stop_is_idempotent_after_start() {
    let echo_addr = spawn_echo_server().await;
    let relay = Relay::new(0, "127.0.0.1", echo_addr.port());
    relay.start().await.unwrap();

    relay.stop().await;
    relay.stop().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_start_after_stop_is_an_error() {
    let relay = Relay::new(0, "127.0.0.1", 9999);
    relay.stop().await;

    assert!(relay.start().await.is_err());
}

#[tokio::test]
async fn test_stop_closes_the_listening_socket() {
    let echo_addr = spawn_echo_server().await;
    let relay = Relay::new(0, "127.0.0.1", echo_addr.port());
    relay.start().await.unwrap();
    let port = relay.listen_port().unwrap();

    // Sanity check: the relay accepts before stopping
    let probe = TcpStream::connect(("127.0.0.1", port)).await;
    assert!(probe.is_ok());
    drop(probe);

    relay.stop().await;

    // The listener is gone, so new connections are refused
    let refused = TcpStream::connect(("127.0.0.1", port)).await;
    assert!(refused.is_err(), "listener should be closed after stop");
}

#[tokio::test]
async fn test_stop_under_active_traffic_drains_all_connections() {
    let echo_addr = spawn_echo_server().await;
    let relay = Relay::new(0, "127.0.0.1", echo_addr.port());
    relay.start().await.unwrap();
    let port = relay.listen_port().unwrap();

    // Keep several clients busy echoing while we pull the plug
    let mut clients = Vec::new();
    for i in 0..3u8 {
        let handle = tokio::spawn(async move {
            let mut stream = match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => stream,
                Err(_) => return,
            };
            let message = [b'a' + i; 32];
            let mut buf = [0u8; 32];
            loop {
                if stream.write_all(&message).await.is_err() {
                    break;
                }
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                sleep(Duration::from_millis(5)).await;
            }
        });
        clients.push(handle);
    }

    sleep(Duration::from_millis(150)).await;
    assert!(relay.active_connections() > 0);

    relay.stop().await;
    assert_eq!(relay.active_connections(), 0);

    // Every client sees its connection die rather than hanging forever
    for handle in clients {
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("client task should finish once the relay stops")
            .unwrap();
    }
}

#[tokio::test]
async fn test_listen_port_is_stable_across_stop() {
    let echo_addr = spawn_echo_server().await;
    let relay = Relay::new(0, "127.0.0.1", echo_addr.port());

    assert_eq!(relay.listen_port(), None);

    relay.start().await.unwrap();
    let port = relay.listen_port().unwrap();
    assert!(port > 0);

    relay.stop().await;

    // The last bound port stays queryable after shutdown
    assert_eq!(relay.listen_port(), Some(port));
}
