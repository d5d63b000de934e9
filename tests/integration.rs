//! Integration tests for the tankws hub
//!
//! These drive the hub both through its API and through attached in-memory
//! transports, the way a WebSocket client would.

use bytes::Bytes;
use std::time::{Duration, Instant};
use tankws::server::{memory_transport, Frame, MemoryPeer};
use tankws::{Connection, DuplicatePolicy, ErrorCode, EventType, Hub, HubConfig, HubError, HubState};
use tokio::time::timeout;

fn quiet() -> HubConfig {
    HubConfig::new().no_heartbeat()
}

async fn next_frame(peer: &mut MemoryPeer) -> Frame {
    timeout(Duration::from_secs(2), peer.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("transport closed")
}

async fn wait_for_count(hub: &Hub, expected: usize) {
    timeout(Duration::from_secs(2), async {
        while hub.connection_count().await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection count never reached expected value");
}

async fn wait_for_subscribers(hub: &Hub, topic: &str, expected: usize) {
    timeout(Duration::from_secs(2), async {
        while hub.subscriber_count(topic).await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber count never reached expected value");
}

#[tokio::test]
async fn test_topic_broadcast_reaches_only_subscribers() {
    let hub = Hub::start(quiet());
    let (a, mut rx_a) = Connection::new(Some("a".into()), 16);
    let (b, mut rx_b) = Connection::new(Some("b".into()), 16);
    let a_id = a.id();
    hub.register(a).await.unwrap();
    hub.register(b).await.unwrap();

    hub.subscribe(a_id, "news").await;
    hub.broadcast_topic("news", "hello").await.unwrap();
    hub.connection_count().await;

    let msg = rx_a.try_recv().unwrap();
    assert_eq!(&msg[..], br#"{"topic":"news","data":"hello"}"#);
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn test_global_broadcast_reaches_everyone() {
    let hub = Hub::start(quiet());
    let (a, mut rx_a) = Connection::new(Some("a".into()), 16);
    let (b, mut rx_b) = Connection::new(Some("b".into()), 16);
    hub.register(a).await.unwrap();
    hub.register(b).await.unwrap();

    hub.broadcast(Bytes::from_static(b"ping")).await.unwrap();
    hub.connection_count().await;

    assert_eq!(&rx_a.try_recv().unwrap()[..], b"ping");
    assert_eq!(&rx_b.try_recv().unwrap()[..], b"ping");
}

#[tokio::test]
async fn test_shutdown_with_two_live_connections() {
    let hub = Hub::start(quiet());
    let mut events = hub.connection_events();

    let (reader_a, writer_a, mut peer_a) = memory_transport();
    let (reader_b, writer_b, mut peer_b) = memory_transport();
    hub.attach(Some("a".into()), reader_a, writer_a).await.unwrap();
    hub.attach(Some("b".into()), reader_b, writer_b).await.unwrap();
    assert_eq!(hub.connection_count().await, 2);

    let deadline = Duration::from_secs(5);
    let start = Instant::now();
    hub.shutdown(deadline).await.unwrap();
    assert!(start.elapsed() < deadline);

    for peer in [&mut peer_a, &mut peer_b] {
        assert_eq!(
            next_frame(peer).await,
            Frame::Text("Server is shutting down".to_string())
        );
        assert_eq!(next_frame(peer).await, Frame::Close(Some(1000)));
    }

    assert_eq!(hub.state(), HubState::Stopped);
    assert_eq!(hub.connection_count().await, 0);

    let mut disconnects = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type == EventType::Disconnect {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 2);
}

#[tokio::test]
async fn test_wire_subscribe_and_topic_delivery() {
    let hub = Hub::start(quiet());
    let (reader, writer, mut peer) = memory_transport();
    let id = hub.attach(Some("alice".into()), reader, writer).await.unwrap();

    peer.send_text("sub:news");
    wait_for_subscribers(&hub, "news", 1).await;
    assert_eq!(hub.topics_of(id).await, vec!["news".to_string()]);

    hub.broadcast_topic("news", "breaking").await.unwrap();
    assert_eq!(
        next_frame(&mut peer).await,
        Frame::Text(r#"{"topic":"news","data":"breaking"}"#.to_string())
    );

    peer.send_text("unsub:news");
    wait_for_subscribers(&hub, "news", 0).await;
    assert!(hub.topics_of(id).await.is_empty());
}

#[tokio::test]
async fn test_empty_topic_commands_are_ignored() {
    let hub = Hub::start(quiet());
    let mut events = hub.connection_events();
    let (reader, writer, peer) = memory_transport();
    hub.attach(None, reader, writer).await.unwrap();

    peer.send_text("sub:");
    peer.send_text("sub:real");
    wait_for_subscribers(&hub, "real", 1).await;

    assert_eq!(hub.topics().await, vec!["real".to_string()]);
    let mut subscribes = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type == EventType::Subscribe {
            assert_eq!(event.topic.as_deref(), Some("real"));
            subscribes += 1;
        }
    }
    assert_eq!(subscribes, 1);
}

#[tokio::test]
async fn test_messages_go_to_other_connections() {
    let hub = Hub::start(quiet());
    let (reader_a, writer_a, mut peer_a) = memory_transport();
    let (reader_b, writer_b, mut peer_b) = memory_transport();
    hub.attach(Some("a".into()), reader_a, writer_a).await.unwrap();
    hub.attach(Some("b".into()), reader_b, writer_b).await.unwrap();

    peer_a.send_text("hello from a");
    assert_eq!(
        next_frame(&mut peer_b).await,
        Frame::Text("hello from a".to_string())
    );

    // Barrier: once b's reply reached a, a's own message would have too
    peer_b.send_text("hello from b");
    assert_eq!(
        next_frame(&mut peer_a).await,
        Frame::Text("hello from b".to_string())
    );
    assert!(peer_a.try_recv().is_none());
}

#[tokio::test]
async fn test_echo_to_sender() {
    let hub = Hub::start(quiet().echo_to_sender(true));
    let (reader, writer, mut peer) = memory_transport();
    hub.attach(None, reader, writer).await.unwrap();

    peer.send_text("echo");
    assert_eq!(next_frame(&mut peer).await, Frame::Text("echo".to_string()));
}

#[tokio::test]
async fn test_heartbeat_ack_is_not_broadcast() {
    let hub = Hub::start(quiet());
    let (reader_a, writer_a, peer_a) = memory_transport();
    let (reader_b, writer_b, mut peer_b) = memory_transport();
    hub.attach(None, reader_a, writer_a).await.unwrap();
    hub.attach(None, reader_b, writer_b).await.unwrap();

    peer_a.send_text("heartbeat_ack");
    peer_a.send_text("after ack");

    assert_eq!(
        next_frame(&mut peer_b).await,
        Frame::Text("after ack".to_string())
    );
}

#[tokio::test]
async fn test_binary_payload_stays_binary() {
    let hub = Hub::start(quiet());
    let (reader_a, writer_a, peer_a) = memory_transport();
    let (reader_b, writer_b, mut peer_b) = memory_transport();
    hub.attach(None, reader_a, writer_a).await.unwrap();
    hub.attach(None, reader_b, writer_b).await.unwrap();

    let blob = Bytes::from_static(&[0x00, 0xff, 0x10]);
    peer_a.send(Frame::Binary(blob.clone()));
    assert_eq!(next_frame(&mut peer_b).await, Frame::Binary(blob));
}

#[tokio::test]
async fn test_client_close_unregisters_without_error() {
    let hub = Hub::start(quiet());
    let mut errors = hub.error_events();
    let mut events = hub.connection_events();
    let (reader, writer, mut peer) = memory_transport();
    let id = hub.attach(Some("carol".into()), reader, writer).await.unwrap();

    peer.send_text("sub:news");
    wait_for_subscribers(&hub, "news", 1).await;

    peer.send(Frame::Close(Some(1000)));
    wait_for_count(&hub, 0).await;

    assert!(!hub.is_live(id).await);
    assert_eq!(hub.subscriber_count("news").await, 0);
    assert_eq!(next_frame(&mut peer).await, Frame::Close(Some(1000)));
    assert!(errors.try_recv().is_err());

    let kinds: Vec<EventType> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        kinds,
        vec![EventType::Connect, EventType::Subscribe, EventType::Disconnect]
    );
}

#[tokio::test]
async fn test_unexpected_close_code_reports_1003() {
    let hub = Hub::start(quiet());
    let mut errors = hub.error_events();
    let (reader, writer, peer) = memory_transport();
    hub.attach(Some("dave".into()), reader, writer).await.unwrap();

    peer.send(Frame::Close(Some(1011)));
    wait_for_count(&hub, 0).await;

    let event = errors.recv().await.unwrap();
    assert_eq!(event.code, ErrorCode::ReadFailed);
    assert_eq!(event.connection_id.as_deref(), Some("dave"));
}

#[tokio::test]
async fn test_rejected_attach_gets_close_frame() {
    let hub = Hub::start(quiet().duplicate_policy(DuplicatePolicy::Reject));
    let (reader_a, writer_a, _peer_a) = memory_transport();
    hub.attach(Some("erin".into()), reader_a, writer_a).await.unwrap();

    let (reader_b, writer_b, mut peer_b) = memory_transport();
    let result = hub.attach(Some("erin".into()), reader_b, writer_b).await;
    assert!(matches!(result, Err(HubError::DuplicateIdentity(_))));
    assert_eq!(next_frame(&mut peer_b).await, Frame::Close(Some(1000)));
    assert_eq!(hub.connection_count().await, 1);
}

#[tokio::test]
async fn test_replace_policy_closes_previous_transport() {
    let hub = Hub::start(quiet().duplicate_policy(DuplicatePolicy::Replace));
    let (reader_a, writer_a, mut peer_a) = memory_transport();
    let first = hub.attach(Some("frank".into()), reader_a, writer_a).await.unwrap();

    let (reader_b, writer_b, _peer_b) = memory_transport();
    let second = hub.attach(Some("frank".into()), reader_b, writer_b).await.unwrap();

    assert_eq!(next_frame(&mut peer_a).await, Frame::Close(Some(1000)));
    assert!(!hub.is_live(first).await);
    assert!(hub.is_live(second).await);
    assert_eq!(hub.connection_count().await, 1);
}

#[tokio::test]
async fn test_close_by_identity() {
    let hub = Hub::start(quiet());
    let (reader, writer, mut peer) = memory_transport();
    hub.attach(Some("gina".into()), reader, writer).await.unwrap();

    assert!(hub.close("gina").await);
    assert_eq!(next_frame(&mut peer).await, Frame::Close(Some(1000)));
    assert_eq!(hub.connection_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_register_unregister() {
    let hub = Hub::start(quiet());

    // Spawn 100 tasks that register and unregister concurrently
    let mut handles = vec![];
    for i in 0..100 {
        let hub = hub.clone();
        handles.push(tokio::spawn(async move {
            let (conn, _rx) = Connection::new(Some(format!("client-{}", i)), 4);
            let id = conn.id();
            hub.register(conn).await.unwrap();
            hub.subscribe(id, "shared").await;

            tokio::time::sleep(Duration::from_micros(100)).await;

            hub.unregister(id).await;
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(hub.connection_count().await, 0);
    assert_eq!(hub.subscriber_count("shared").await, 0);
}

#[tokio::test]
async fn test_subscribe_racing_unregister_leaves_no_orphans() {
    let hub = Hub::start(quiet());

    for round in 0..50 {
        let (conn, _rx) = Connection::new(None, 4);
        let id = conn.id();
        hub.register(conn).await.unwrap();

        let topic = format!("t{}", round % 5);
        let sub_a = {
            let hub = hub.clone();
            let topic = topic.clone();
            tokio::spawn(async move { hub.subscribe(id, topic).await })
        };
        let sub_b = {
            let hub = hub.clone();
            let topic = topic.clone();
            tokio::spawn(async move { hub.subscribe(id, topic).await })
        };
        let unreg = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.unregister(id).await })
        };
        sub_a.await.unwrap();
        sub_b.await.unwrap();
        unreg.await.unwrap();

        assert!(!hub.is_live(id).await);
        assert!(hub.topics_of(id).await.is_empty());
        assert_eq!(hub.subscriber_count(&topic).await, 0);
    }
}

#[tokio::test]
async fn test_topic_json_broadcast() {
    #[derive(serde::Serialize)]
    struct Price {
        symbol: &'static str,
        cents: u64,
    }

    let hub = Hub::start(quiet());
    let (conn, mut rx) = Connection::new(None, 4);
    let id = conn.id();
    hub.register(conn).await.unwrap();
    hub.subscribe(id, "prices").await;

    hub.broadcast_topic_json("prices", &Price { symbol: "ACME", cents: 1250 })
        .await
        .unwrap();
    hub.connection_count().await;

    let msg = rx.try_recv().unwrap();
    let envelope: serde_json::Value = serde_json::from_slice(&msg).unwrap();
    assert_eq!(envelope["topic"], "prices");
    assert_eq!(envelope["data"], r#"{"symbol":"ACME","cents":1250}"#);
}
