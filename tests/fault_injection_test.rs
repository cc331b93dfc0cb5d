//! Integration tests for upstream drop mode

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

/// Assert that nothing arrives on `stream` within `window`
async fn assert_silent(stream: &mut TcpStream, window: Duration) {
    let mut buf = [0u8; 64];
    let read = timeout(window, stream.read(&mut buf)).await;
    assert!(
        read.is_err(),
        "received bytes that should have been dropped: {:?}",
        read
    );
}

#[tokio::test]
async fn test_block_drops_then_unblock_forwards_only_new_data() {
    let echo_addr = spawn_echo_server().await;
    let relay = Relay::new(0, "127.0.0.1", echo_addr.port());
    relay.start().await.unwrap();
    let port = relay.listen_port().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // Unblocked: the echo comes straight back
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 16];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf[..4]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..4], b"ping");

    // Blocked: the echo of "ping2" is consumed and destroyed by the relay
    relay.set_blocked(true);
    assert!(relay.is_blocked());

    client.write_all(b"ping2").await.unwrap();
    assert_silent(&mut client, Duration::from_millis(300)).await;

    // Unblocked again: only data echoed after the toggle arrives. The
    // dropped "ping2" echo is never replayed.
    relay.set_blocked(false);
    assert!(!relay.is_blocked());
    sleep(Duration::from_millis(50)).await;

    client.write_all(b"ping3").await.unwrap();
    timeout(Duration::from_secs(2), client.read_exact(&mut buf[..5]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..5], b"ping3");

    // And nothing else is waiting behind it
    assert_silent(&mut client, Duration::from_millis(200)).await;

    relay.stop().await;
}

#[tokio::test]
async fn test_downstream_direction_unaffected_by_drop_mode() {
    // Target server that counts what it receives and stays silent
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = listener.local_addr().unwrap();
    let (count_tx, mut count_rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = count_tx.send(buf[..n].to_vec());
                    }
                }
            }
        }
    });

    let relay = Relay::new(0, "127.0.0.1", target_addr.port());
    relay.start().await.unwrap();
    let port = relay.listen_port().unwrap();

    relay.set_blocked(true);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"still-flowing").await.unwrap();

    // Client-to-target bytes pass through even while upstream is blocked
    let mut received = Vec::new();
    while received.len() < 13 {
        let chunk = timeout(Duration::from_secs(2), count_rx.recv())
            .await
            .unwrap()
            .unwrap();
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"still-flowing");

    relay.stop().await;
}

#[tokio::test]
async fn test_toggle_applies_to_all_connections() {
    let echo_addr = spawn_echo_server().await;
    let relay = Relay::new(0, "127.0.0.1", echo_addr.port());
    relay.start().await.unwrap();
    let port = relay.listen_port().unwrap();

    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    relay.set_blocked(true);

    first.write_all(b"one").await.unwrap();
    second.write_all(b"two").await.unwrap();
    assert_silent(&mut first, Duration::from_millis(300)).await;
    assert_silent(&mut second, Duration::from_millis(100)).await;

    relay.set_blocked(false);
    sleep(Duration::from_millis(50)).await;

    let mut buf = [0u8; 8];
    first.write_all(b"three").await.unwrap();
    timeout(Duration::from_secs(2), first.read_exact(&mut buf[..5]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..5], b"three");

    second.write_all(b"four").await.unwrap();
    timeout(Duration::from_secs(2), second.read_exact(&mut buf[..4]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..4], b"four");

    relay.stop().await;
}

#[tokio::test]
async fn test_connections_survive_a_block_unblock_cycle() {
    let echo_addr = spawn_echo_server().await;
    let relay = Relay::new(0, "127.0.0.1", echo_addr.port());
    relay.start().await.unwrap();
    let port = relay.listen_port().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.active_connections(), 1);

    relay.set_blocked(true);
    sleep(Duration::from_millis(100)).await;
    relay.set_blocked(false);
    sleep(Duration::from_millis(50)).await;

    // The pair is still alive and still relays
    assert_eq!(relay.active_connections(), 1);
    let mut buf = [0u8; 5];
    client.write_all(b"alive").await.unwrap();
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"alive");

    relay.stop().await;
}
