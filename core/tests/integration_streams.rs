//! Stream multiplexer integration tests
//!
//! Run with: cargo test --test integration_streams

use peerlink_core::{
    DestroyCause, LocalAcceptor, LocalConnector, P2pError, PeerClient, PeerConfig, RelayServer,
    StreamChannel, StreamError, StreamListener, StreamOptions, StreamState,
};
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn start_relay() -> LocalConnector {
    let (acceptor, connector) = LocalAcceptor::new();
    let relay = RelayServer::new();
    tokio::spawn(async move { relay.serve(acceptor).await });
    connector
}

async fn peer(connector: &LocalConnector, id: &str) -> PeerClient {
    PeerClient::connect_local(connector, id, PeerConfig::default())
        .await
        .expect("Failed to connect peer")
}

async fn accept(listener: &mut StreamListener) -> StreamChannel {
    timeout(WAIT, listener.accept())
        .await
        .expect("Timed out accepting stream")
        .expect("Stream listener closed")
}

async fn read(channel: &StreamChannel) -> Vec<u8> {
    timeout(WAIT, channel.read())
        .await
        .expect("Timed out reading")
        .expect("Stream ended early")
}

async fn closed(channel: &StreamChannel) {
    timeout(WAIT, channel.closed())
        .await
        .expect("Timed out waiting for stream to close");
}

/// Open a stream from `from` to `to`, returning both ends
async fn open_pair(from: &PeerClient, to: &PeerClient) -> (StreamChannel, StreamChannel) {
    let mut listener = to.streams().listen();
    let local = from
        .streams()
        .add_stream(to.peer_id(), StreamOptions::default())
        .await
        .expect("Failed to open stream");
    let remote = accept(&mut listener).await;
    (local, remote)
}

#[tokio::test]
async fn test_stream_refused_without_listener() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let _bob = peer(&connector, "bob").await;

    let result = alice
        .streams()
        .add_stream("bob", StreamOptions::default())
        .await;
    assert!(matches!(result, Err(P2pError::StreamCreateRefused(_))));

    let result = alice
        .streams()
        .add_stream("nobody", StreamOptions::default())
        .await;
    assert!(matches!(result, Err(P2pError::StreamCreateRefused(_))));
    assert_eq!(alice.streams().channel_count(), 0);
}

#[tokio::test]
async fn test_data_flows_both_ways() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let bob = peer(&connector, "bob").await;

    let (to_bob, from_alice) = open_pair(&alice, &bob).await;
    assert_eq!(to_bob.state(), StreamState::Open);
    assert_eq!(from_alice.state(), StreamState::Open);
    assert_eq!(from_alice.remote(), "alice");
    assert_eq!(to_bob.source_id(), from_alice.target_id());
    assert_eq!(to_bob.target_id(), from_alice.source_id());

    to_bob.write(b"hello ".to_vec()).await.expect("Failed to write");
    to_bob.write(b"world".to_vec()).await.expect("Failed to write");
    assert_eq!(read(&from_alice).await, b"hello ");
    assert_eq!(read(&from_alice).await, b"world");

    from_alice
        .write(b"hi alice".to_vec())
        .await
        .expect("Failed to write back");
    assert_eq!(read(&to_bob).await, b"hi alice");

    assert_eq!(to_bob.bytes_written(), 11);
    assert_eq!(from_alice.bytes_read(), 11);
}

#[tokio::test]
async fn test_slow_reader_holds_writer() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let bob = peer(&connector, "bob").await;

    let mut listener = bob
        .streams()
        .listen_with(None, StreamOptions::with_high_water_mark(4));
    let writer = alice
        .streams()
        .add_stream("bob", StreamOptions::default())
        .await
        .expect("Failed to open stream");
    let reader = accept(&mut listener).await;

    // Below the mark: acknowledged right away
    writer.write(b"ab".to_vec()).await.expect("Failed to write");
    // Reaches the mark: the acknowledgement is withheld
    let blocked = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write(b"cd".to_vec()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());
    assert_eq!(reader.buffered_len(), 4);

    // Draining below the mark releases it
    assert_eq!(read(&reader).await, b"ab");
    timeout(WAIT, blocked)
        .await
        .expect("Timed out waiting for writer")
        .expect("Writer task panicked")
        .expect("Failed to write after drain");
    assert_eq!(read(&reader).await, b"cd");
    assert_eq!(writer.bytes_written(), 4);
}

#[tokio::test]
async fn test_destroy_propagates() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let bob = peer(&connector, "bob").await;

    let (to_bob, from_alice) = open_pair(&alice, &bob).await;
    to_bob.write(b"last words".to_vec()).await.expect("Failed to write");

    to_bob.destroy();
    assert_eq!(to_bob.destroy_cause(), Some(DestroyCause::Local));
    closed(&from_alice).await;
    assert_eq!(from_alice.destroy_cause(), Some(DestroyCause::PeerDestroyed));

    // Buffered data is still readable, then the stream ends
    let rest = timeout(WAIT, from_alice.read_to_end())
        .await
        .expect("Timed out draining stream");
    assert_eq!(rest, b"last words");

    assert!(matches!(
        to_bob.write(b"more".to_vec()).await,
        Err(StreamError::Destroyed)
    ));
    assert!(matches!(
        from_alice.write(b"more".to_vec()).await,
        Err(StreamError::Destroyed)
    ));
    assert_eq!(alice.streams().channel_count(), 0);
    assert_eq!(bob.streams().channel_count(), 0);

    // Idempotent
    to_bob.destroy();
    from_alice.destroy();
}

#[tokio::test]
async fn test_destroy_releases_blocked_writer() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let bob = peer(&connector, "bob").await;

    let mut listener = bob
        .streams()
        .listen_with(None, StreamOptions::with_high_water_mark(1));
    let writer = alice
        .streams()
        .add_stream("bob", StreamOptions::default())
        .await
        .expect("Failed to open stream");
    let reader = accept(&mut listener).await;

    let blocked = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write(b"stuck".to_vec()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    reader.destroy();

    let result = timeout(WAIT, blocked)
        .await
        .expect("Timed out waiting for writer")
        .expect("Writer task panicked");
    assert!(matches!(result, Err(StreamError::Destroyed)));
    assert_eq!(writer.destroy_cause(), Some(DestroyCause::PeerDestroyed));
}

#[tokio::test]
async fn test_peer_disconnect_tears_down_streams() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let bob = peer(&connector, "bob").await;

    let (first, _) = open_pair(&alice, &bob).await;
    let (second, _) = open_pair(&alice, &bob).await;
    assert_eq!(alice.streams().channel_count(), 2);

    bob.disconnect();

    closed(&first).await;
    closed(&second).await;
    assert_eq!(first.destroy_cause(), Some(DestroyCause::Disconnected));
    assert_eq!(second.destroy_cause(), Some(DestroyCause::Disconnected));
    assert_eq!(alice.streams().channel_count(), 0);
    assert_eq!(alice.addressing().protocol_listener_count_from("bob"), 0);
}

#[tokio::test]
async fn test_destroy_removes_only_its_listeners() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let bob = peer(&connector, "bob").await;

    alice.addressing().from("bob").on("chat", |_| {});
    let (first, first_remote) = open_pair(&alice, &bob).await;
    let (second, second_remote) = open_pair(&alice, &bob).await;
    assert_eq!(alice.addressing().protocol_listener_count_from("bob"), 4);

    first.destroy();
    assert_eq!(alice.addressing().protocol_listener_count_from("bob"), 2);
    assert_eq!(alice.addressing().listener_count_from("bob"), 1);
    closed(&first_remote).await;

    // The other stream on the same connection is unaffected
    second.write(b"still here".to_vec()).await.expect("Failed to write");
    assert_eq!(read(&second_remote).await, b"still here");
    assert_eq!(second.state(), StreamState::Open);
}

#[tokio::test]
async fn test_stream_over_session() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let bob = peer(&connector, "bob").await;

    let unregistered = alice.streams().register_stream(StreamOptions::default()).await;
    assert!(matches!(unregistered, Err(P2pError::NotRegistered)));

    alice
        .session()
        .register("bob")
        .await
        .expect("Failed to register session");

    let mut listener = bob.streams().listen_from("alice");
    let channel = alice
        .streams()
        .register_stream(StreamOptions::default())
        .await
        .expect("Failed to open session stream");
    let remote = accept(&mut listener).await;
    assert_eq!(channel.remote(), "bob");

    channel.write(b"over session".to_vec()).await.expect("Failed to write");
    assert_eq!(read(&remote).await, b"over session");
}

#[tokio::test]
async fn test_listener_filter_and_drop() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let bob = peer(&connector, "bob").await;
    let carol = peer(&connector, "carol").await;

    let listener = bob.streams().listen_from("carol");
    let refused = alice
        .streams()
        .add_stream("bob", StreamOptions::default())
        .await;
    assert!(matches!(refused, Err(P2pError::StreamCreateRefused(_))));

    carol
        .streams()
        .add_stream("bob", StreamOptions::default())
        .await
        .expect("Failed to open stream from carol");

    // Streams accepted but never picked up go away with the listener
    drop(listener);
    assert_eq!(bob.streams().channel_count(), 0);
    let refused = carol
        .streams()
        .add_stream("bob", StreamOptions::default())
        .await;
    assert!(matches!(refused, Err(P2pError::StreamCreateRefused(_))));
}

#[tokio::test]
async fn test_cancelled_open_leaves_no_stream() {
    let connector = start_relay();
    let alice = peer(&connector, "alice").await;
    let bob = peer(&connector, "bob").await;
    let mut listener = bob.streams().listen();

    // One poll sends the create request; the future is dropped before the answer
    let cancelled = timeout(
        Duration::ZERO,
        alice.streams().add_stream("bob", StreamOptions::default()),
    )
    .await;
    assert!(cancelled.is_err());

    // Bob accepted, then sees the stream torn down by the late answer
    let orphan = accept(&mut listener).await;
    closed(&orphan).await;
    assert!(orphan.is_destroyed());

    let settled = timeout(WAIT, async {
        while alice.streams().channel_count() != 0
            || bob.streams().channel_count() != 0
            || alice.addressing().protocol_listener_count_from("bob") != 0
            || bob.addressing().protocol_listener_count_from("alice") != 0
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "Timed out waiting for the cancelled stream to clear");

    // A later open on the same pair is unaffected
    drop(listener);
    let (local, remote) = open_pair(&alice, &bob).await;
    local.write(b"after".to_vec()).await.expect("Failed to write");
    assert_eq!(read(&remote).await, b"after");
}
