//! Link transport over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use logsync_core::transport::{LinkConfig, LinkTransport, TRANSPORT_EVENT_CAPACITY};
use logsync_core::wire::{self, Frame, WireFormat};
use logsync_core::{
    ActivityTracker, ComposeOptions, ContentStore, Keypair, MemoryStore, Pipeline, Transport,
    TransportEvent,
};
use tokio::sync::{mpsc, watch};

fn fast_config() -> LinkConfig {
    LinkConfig {
        initial_backoff_ms: 20,
        max_backoff_ms: 200,
        connect_timeout_ms: 1_000,
        ..LinkConfig::default()
    }
}

async fn next_received(rx: &mut mpsc::Receiver<TransportEvent>) -> Frame {
    let wait = async {
        loop {
            match rx.recv().await {
                Some(TransportEvent::Received { bytes, .. }) => {
                    return wire::decode(&bytes, WireFormat::Tagged).expect("decodable frame")
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("frame in time")
}

async fn wait_ready(rx: &mut mpsc::Receiver<TransportEvent>, expected: bool) {
    let wait = async {
        loop {
            if let Some(TransportEvent::ConnectionState { ready, .. }) = rx.recv().await {
                if ready == expected {
                    return;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("connection state in time")
}

#[tokio::test]
async fn test_new_connection_is_primed_with_known_authors() {
    let server_store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let author = Keypair::from_seed(&[5; 32]);
    let pipeline = Pipeline::new(
        author.clone(),
        Arc::clone(&server_store),
        Arc::new(ActivityTracker::new()),
    );
    let composed = pipeline
        .compose("hi", ComposeOptions::default(), 1_700_000_000_000)
        .unwrap();

    let (_shutdown_tx, shutdown) = watch::channel(false);
    let (server_tx, _server_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let server = LinkTransport::start(
        LinkConfig {
            listen: Some("127.0.0.1:0".into()),
            ..fast_config()
        },
        WireFormat::Tagged,
        server_store,
        server_tx,
        shutdown.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();

    let (client_tx, mut client_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let client = LinkTransport::start(
        LinkConfig {
            connect: vec![addr.to_string()],
            ..fast_config()
        },
        WireFormat::Tagged,
        Arc::new(MemoryStore::new()),
        client_tx,
        shutdown,
    )
    .await
    .unwrap();

    wait_ready(&mut client_rx, true).await;
    assert!(client.is_ready());

    assert_eq!(
        next_received(&mut client_rx).await,
        Frame::Request(author.peer_id().as_request())
    );
    assert_eq!(
        next_received(&mut client_rx).await,
        Frame::Payload(composed.envelope)
    );

    client.close();
    server.close();
}

#[tokio::test]
async fn test_frames_flow_both_ways() {
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let (server_tx, mut server_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let server = LinkTransport::start(
        LinkConfig {
            listen: Some("127.0.0.1:0".into()),
            ..fast_config()
        },
        WireFormat::Tagged,
        Arc::new(MemoryStore::new()),
        server_tx,
        shutdown.clone(),
    )
    .await
    .unwrap();

    let (client_tx, mut client_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let client = LinkTransport::start(
        LinkConfig {
            connect: vec![server.local_addr().unwrap().to_string()],
            ..fast_config()
        },
        WireFormat::Tagged,
        Arc::new(MemoryStore::new()),
        client_tx,
        shutdown,
    )
    .await
    .unwrap();

    wait_ready(&mut client_rx, true).await;
    wait_ready(&mut server_rx, true).await;

    let payload = Frame::Payload(Bytes::from_static(b"{\"body\":\"ping\"}"));
    client
        .send(wire::encode(&payload, WireFormat::Tagged), None)
        .unwrap();
    assert_eq!(next_received(&mut server_rx).await, payload);

    // unknown reply target falls back to every connection
    let reply = Frame::Payload(Bytes::from_static(b"{\"body\":\"pong\"}"));
    server
        .send(wire::encode(&reply, WireFormat::Tagged), Some("10.9.9.9:1"))
        .unwrap();
    assert_eq!(next_received(&mut client_rx).await, reply);

    client.close();
    server.close();
}

#[tokio::test]
async fn test_client_reconnects_when_server_appears() {
    // reserve a free port, then release it
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let (_shutdown_tx, shutdown) = watch::channel(false);
    let (client_tx, mut client_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let client = LinkTransport::start(
        LinkConfig {
            connect: vec![addr.to_string()],
            ..fast_config()
        },
        WireFormat::Tagged,
        Arc::new(MemoryStore::new()),
        client_tx,
        shutdown.clone(),
    )
    .await
    .unwrap();
    assert!(!client.is_ready());
    assert!(client.send(Bytes::from_static(b"x"), None).is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;

    let (server_tx, _server_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let server = LinkTransport::start(
        LinkConfig {
            listen: Some(addr.to_string()),
            ..fast_config()
        },
        WireFormat::Tagged,
        Arc::new(MemoryStore::new()),
        server_tx,
        shutdown,
    )
    .await
    .unwrap();

    wait_ready(&mut client_rx, true).await;
    assert_eq!(client.connection_count(), 1);

    server.close();
    wait_ready(&mut client_rx, false).await;
    assert!(!client.is_ready());

    client.close();
}

#[tokio::test]
async fn test_shutdown_signal_stops_the_link() {
    let (shutdown_tx, shutdown) = watch::channel(false);
    let (tx, _rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let link = LinkTransport::start(
        LinkConfig {
            listen: Some("127.0.0.1:0".into()),
            ..fast_config()
        },
        WireFormat::Tagged,
        Arc::new(MemoryStore::new()),
        tx,
        shutdown,
    )
    .await
    .unwrap();
    let addr = link.local_addr().unwrap();

    shutdown_tx.send_replace(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the accept loop is gone; a connect may succeed at the OS level but
    // no connection is ever registered
    let _ = tokio::net::TcpStream::connect(addr).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(link.connection_count(), 0);
}
