//! Resolver + broker + nodes over real localhost sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tbus_protocol::{
    config_request, new_token, resolve, topics, Broker, BrokerConfig, Endpoint, Message, Node,
    NodeConfig, Resolver, ResolverConfig, TbusError, TopicKind,
};
use tbus_transport::{dial, TransportConfig};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

async fn start_resolver() -> Resolver {
    let resolver = Resolver::new(
        ResolverConfig::new()
            .resolution_address("127.0.0.1:0")
            .config_address("127.0.0.1:0"),
    )
    .unwrap();
    resolver.start().await.unwrap();
    resolver
}

fn broker_config(name: &str, resolver: &Resolver) -> BrokerConfig {
    BrokerConfig::new(name)
        .node_address("127.0.0.1:0")
        .config_address("127.0.0.1:0")
        .resolver(resolver.config_endpoint().unwrap())
        .sync_topic("orders")
        .async_topic("events")
        .sync_response_timeout(Duration::from_secs(2))
}

async fn start_broker(resolver: &Resolver) -> Broker {
    let broker = Broker::new(broker_config("broker-1", resolver)).unwrap();
    broker.start().await.unwrap();
    broker
}

fn node_config(name: &str, resolver: &Resolver) -> NodeConfig {
    NodeConfig::new(name)
        .resolver(resolver.resolution_endpoint().unwrap())
        .tcp_timeout(Duration::from_secs(2))
        .sync_response_timeout(Duration::from_secs(2))
        .subscribe_delay(Duration::from_millis(50))
}

async fn start_plain_node(name: &str, resolver: &Resolver) -> Node {
    let node = Node::new(node_config(name, resolver)).unwrap();
    node.start().await.unwrap();
    node
}

async fn start_pong_node(name: &str, resolver: &Resolver) -> Node {
    let node = Node::builder(node_config(name, resolver))
        .on_sync("orders", |_node, request| async move {
            assert_eq!(request.payload_str(), "ping");
            Ok(b"pong".to_vec())
        })
        .build()
        .unwrap();
    node.start().await.unwrap();
    node
}

/// Poll `check` until it holds or `WAIT` runs out.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

// ── Resolver ──────────────────────────────────────────────────────────

#[tokio::test]
async fn resolver_learns_topics_from_config_requests() {
    init_tracing();
    let resolver = start_resolver().await;
    let resolution = resolver.resolution_endpoint().unwrap();
    let config = resolver.config_endpoint().unwrap();
    let transport = TransportConfig::new();

    let err = resolve(&resolution, "orders", "tester", &transport, WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, TbusError::Remote(ref msg) if msg.contains("orders")));

    let broker = Endpoint::new("10.0.0.7:60002");
    let payload = format!("{}|orders|events", broker.to_json());
    config_request(&config, topics::ADD_TOPICS, "broker-x", payload, WAIT)
        .await
        .unwrap();
    assert_eq!(
        resolve(&resolution, "events", "tester", &transport, WAIT).await.unwrap(),
        broker
    );

    config_request(&config, topics::REMOVE_TOPICS, "broker-x", "orders", WAIT)
        .await
        .unwrap();
    assert_eq!(resolver.topics(), vec!["events".to_string()]);
    assert!(resolver.metrics().successful_resolutions.get() >= 1);
    resolver.stop().unwrap();
}

#[tokio::test]
async fn broker_registers_and_deregisters_its_topics() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let endpoint = broker.endpoint().unwrap();

    assert_eq!(resolver.resolve("orders"), Some(endpoint.clone()));
    assert_eq!(resolver.resolve("events"), Some(endpoint));
    assert_eq!(resolver.resolve("subscribe"), None);

    broker.stop().await.unwrap();
    assert!(resolver.topics().is_empty());
    resolver.stop().unwrap();
}

// ── Sync requests ─────────────────────────────────────────────────────

#[tokio::test]
async fn orders_ping_pong() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let a = start_pong_node("a", &resolver).await;
    let b = start_plain_node("b", &resolver).await;

    assert_eq!(broker.subscribers("orders"), vec!["a".to_string()]);
    assert_eq!(a.subscribed_topics(), vec!["orders".to_string()]);

    let reply = b.send_sync("orders", "ping", WAIT).await.unwrap();
    assert_eq!(reply.payload_str(), "pong");
    assert_eq!(reply.origin(), "a");
    assert!(reply.is_sync_response());
    assert_eq!(b.pending_responses(), 0);
    assert_eq!(broker.open_sync_requests(), 0);

    b.stop().await.unwrap();
    a.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test]
async fn sync_request_without_subscribers_is_rejected() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let b = start_plain_node("b", &resolver).await;

    let err = b.send_sync("orders", "ping", WAIT).await.unwrap_err();
    assert!(matches!(err, TbusError::Remote(ref msg) if msg.contains("no subscribers")));
    assert_eq!(b.pending_responses(), 0);

    b.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test]
async fn handler_error_comes_back_as_remote_error() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let a = Node::builder(node_config("a", &resolver))
        .on_sync("orders", |_node, _request| async move {
            Err(anyhow::anyhow!("out of stock"))
        })
        .build()
        .unwrap();
    a.start().await.unwrap();
    let b = start_plain_node("b", &resolver).await;

    let err = b.send_sync("orders", "ping", WAIT).await.unwrap_err();
    assert!(matches!(err, TbusError::Remote(ref msg) if msg.contains("out of stock")));

    b.stop().await.unwrap();
    a.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test]
async fn slow_responder_times_out_and_cleans_up() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let a = Node::builder(node_config("a", &resolver))
        .on_sync("orders", |_node, _request| async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(b"late".to_vec())
        })
        .build()
        .unwrap();
    a.start().await.unwrap();
    let b = start_plain_node("b", &resolver).await;

    let err = b
        .send_sync("orders", "ping", Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, TbusError::Timeout));
    assert_eq!(b.pending_responses(), 0);

    b.stop().await.unwrap();
    a.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broker_loss_fails_in_flight_request() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let a = Node::builder(node_config("a", &resolver).max_subscribe_attempts(1))
        .on_sync("orders", |_node, _request| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        })
        .build()
        .unwrap();
    a.start().await.unwrap();
    let b = start_plain_node("b", &resolver).await;

    let requester = b.clone();
    let call =
        tokio::spawn(async move { requester.send_sync("orders", "ping", Duration::from_secs(20)).await });
    assert!(eventually(|| broker.open_sync_requests() == 1).await);

    broker.stop().await.unwrap();
    let result = tokio::time::timeout(WAIT, call).await.unwrap().unwrap();
    assert!(
        matches!(result, Err(TbusError::ConnectionLost { .. } | TbusError::Shutdown)),
        "unexpected result {result:?}"
    );
    assert_eq!(b.pending_responses(), 0);

    b.stop().await.unwrap();
    resolver.stop().unwrap();
}

// ── Async fan-out ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_message_reaches_every_subscriber() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();

    let mut subscribers = Vec::new();
    for name in ["s1", "s2", "s3"] {
        let tx = tx.clone();
        let node = Node::builder(node_config(name, &resolver))
            .on_async("events", move |node, message| {
                let tx = tx.clone();
                async move {
                    tx.send((node.name().to_string(), message.payload_str().into_owned()))?;
                    Ok(())
                }
            })
            .build()
            .unwrap();
        node.start().await.unwrap();
        subscribers.push(node);
    }
    assert_eq!(broker.subscribers("events").len(), 3);

    let publisher = start_plain_node("pub", &resolver).await;
    publisher.send_async("events", "hello").await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (name, payload) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(payload, "hello");
        seen.push(name);
    }
    seen.sort();
    assert_eq!(seen, ["s1", "s2", "s3"]);

    publisher.stop().await.unwrap();
    for node in subscribers {
        node.stop().await.unwrap();
    }
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_share_one_connection() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let node = start_plain_node("pub", &resolver).await;

    let mut sends = tokio::task::JoinSet::new();
    for i in 0..20 {
        let node = node.clone();
        let topic = if i % 2 == 0 { "events" } else { "orders" };
        sends.spawn(async move {
            if topic == "events" {
                node.send_async(topic, format!("{i}")).await.unwrap();
            } else {
                // No subscribers yet; the request fails but the connection stays.
                let _ = node.send_sync(topic, format!("{i}"), WAIT).await;
            }
        });
    }
    while let Some(done) = sends.join_next().await {
        done.unwrap();
    }

    assert_eq!(node.connection_count().await, 1);
    assert_eq!(broker.node_count(), 1);
    assert_eq!(node.resolved_topics(), vec!["events".to_string(), "orders".to_string()]);

    node.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test]
async fn sequential_handlers_never_overlap() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    let (flight, overlap, count) = (in_flight.clone(), overlapped.clone(), handled.clone());
    let consumer = Node::builder(node_config("seq", &resolver).handle_messages_sequentially(true))
        .on_async("events", move |_node, _message| {
            let (flight, overlap, count) = (flight.clone(), overlap.clone(), count.clone());
            async move {
                if flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                flight.fetch_sub(1, Ordering::SeqCst);
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    let publisher = start_plain_node("pub", &resolver).await;
    for i in 0..10 {
        publisher.send_async("events", format!("{i}")).await.unwrap();
    }
    assert!(eventually(|| handled.load(Ordering::SeqCst) == 10).await);
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);

    publisher.stop().await.unwrap();
    consumer.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

// ── Subscriptions ─────────────────────────────────────────────────────

#[tokio::test]
async fn subscribe_and_unsubscribe_round_trip() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let node = start_plain_node("n", &resolver).await;

    node.subscribe("events").await.unwrap();
    assert_eq!(broker.subscribers("events"), vec!["n".to_string()]);
    assert!(matches!(
        node.subscribe("events").await,
        Err(TbusError::AlreadySubscribed { .. })
    ));
    assert!(matches!(
        node.remove_topic_resolution("events"),
        Err(TbusError::AlreadySubscribed { .. })
    ));

    node.unsubscribe("events").await.unwrap();
    assert!(broker.subscribers("events").is_empty());
    assert!(matches!(
        node.unsubscribe("events").await,
        Err(TbusError::NotSubscribed { .. })
    ));

    node.remove_topic_resolution("events").unwrap();
    assert!(node.resolved_topics().is_empty());

    node.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test]
async fn unsubscribe_without_subscription_gets_error_response() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let endpoint = broker.endpoint().unwrap();

    let mut raw = dial(&endpoint, &TransportConfig::new()).await.unwrap();
    let hello = Message::new_async(topics::CONNECT, "raw", Vec::new());
    let reply = raw.exchange(&hello.to_bytes().unwrap(), WAIT).await.unwrap();
    assert_eq!(Message::from_bytes(&reply).unwrap().topic(), topics::CONNECTED);

    let token = new_token();
    let request = Message::new_sync(topics::UNSUBSCRIBE, "raw", "orders", token.clone());
    let reply = raw.exchange(&request.to_bytes().unwrap(), WAIT).await.unwrap();
    let reply = Message::from_bytes(&reply).unwrap();
    assert_eq!(reply.topic(), topics::ERROR);
    assert_eq!(reply.sync_response_token(), Some(token.as_str()));
    assert!(reply.payload_str().contains("not subscribed"));

    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test]
async fn duplicate_node_name_is_refused() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let first = start_plain_node("twin", &resolver).await;
    first.send_async("events", "x").await.unwrap();

    let second = start_plain_node("twin", &resolver).await;
    let err = second.send_async("events", "y").await.unwrap_err();
    assert!(matches!(err, TbusError::HandshakeRejected { .. }));
    assert_eq!(broker.node_count(), 1);

    second.stop().await.unwrap();
    first.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_resubscribes_after_broker_restart() {
    init_tracing();
    let resolver = start_resolver().await;
    let address = format!("127.0.0.1:{}", free_port());
    let config = broker_config("broker-1", &resolver).node_address(address.clone());

    let broker = Broker::new(config.clone()).unwrap();
    broker.start().await.unwrap();
    let a = start_pong_node("a", &resolver).await;
    let b = start_plain_node("b", &resolver).await;
    assert_eq!(b.send_sync("orders", "ping", WAIT).await.unwrap().payload_str(), "pong");

    broker.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let restarted = Broker::new(config).unwrap();
    restarted.start().await.unwrap();

    assert!(eventually(|| restarted.subscribers("orders") == vec!["a".to_string()]).await);
    assert!(a.metrics().reconnect_attempts.get() >= 1);
    assert_eq!(b.send_sync("orders", "ping", WAIT).await.unwrap().payload_str(), "pong");

    b.stop().await.unwrap();
    a.stop().await.unwrap();
    restarted.stop().await.unwrap();
    resolver.stop().unwrap();
}

// ── Resolution lifetime ───────────────────────────────────────────────

#[tokio::test]
async fn expired_resolution_is_dropped_when_topic_disappears() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let node = Node::new(
        node_config("n", &resolver).topic_resolution_lifetime(Duration::from_millis(100)),
    )
    .unwrap();
    node.start().await.unwrap();

    node.send_async("events", "x").await.unwrap();
    assert_eq!(node.resolved_topics(), vec!["events".to_string()]);

    resolver.deregister_topics(["events"]);
    assert!(eventually(|| node.resolved_topics().is_empty()).await);
    let mut closed = false;
    for _ in 0..50 {
        if node.connection_count().await == 0 {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(closed, "idle connection was not closed");

    node.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

// ── Broker config commands ────────────────────────────────────────────

#[tokio::test]
async fn broker_config_commands_edit_topics() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let admin = broker.config_endpoint().unwrap();

    config_request(&admin, topics::ADD_ASYNC_TOPICS, "admin", "alerts|audit", WAIT)
        .await
        .unwrap();
    assert_eq!(broker.topic_kind("alerts"), Some(TopicKind::Async));
    assert_eq!(resolver.resolve("audit"), broker.endpoint());

    config_request(&admin, topics::REMOVE_ASYNC_TOPICS, "admin", "audit", WAIT)
        .await
        .unwrap();
    assert_eq!(broker.topic_kind("audit"), None);
    assert_eq!(resolver.resolve("audit"), None);

    let err = config_request(&admin, "reboot", "admin", "", WAIT).await.unwrap_err();
    assert!(matches!(err, TbusError::Remote(ref msg) if msg.contains("reboot")));

    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}

#[tokio::test]
async fn idle_node_refuses_traffic() {
    init_tracing();
    let resolver = start_resolver().await;
    let node = Node::new(node_config("idle", &resolver)).unwrap();
    assert!(matches!(
        node.send_async("events", "x").await,
        Err(TbusError::NotRunning)
    ));
    node.start().await.unwrap();
    assert!(matches!(node.start().await, Err(TbusError::AlreadyRunning)));
    node.stop().await.unwrap();
    assert!(matches!(
        node.send_sync("orders", "x", WAIT).await,
        Err(TbusError::Shutdown)
    ));
    resolver.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeats_reach_broker_without_fan_out() {
    init_tracing();
    let resolver = start_resolver().await;
    let broker = start_broker(&resolver).await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let node = Node::builder(
        node_config("beating", &resolver).heartbeat_interval(Duration::from_millis(50)),
    )
    .on_async("events", move |_node, _message| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .build()
    .unwrap();
    node.start().await.unwrap();

    let incoming = broker.metrics().incoming_messages.get();
    let outgoing = broker.metrics().outgoing_messages.get();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(broker.metrics().incoming_messages.get() >= incoming + 3);
    assert_eq!(broker.metrics().outgoing_messages.get(), outgoing);
    assert_eq!(broker.metrics().delivery_failures.get(), 0);
    assert_eq!(received.load(Ordering::SeqCst), 0);
    assert_eq!(node.connection_count().await, 1);
    assert_eq!(node.metrics().reconnect_attempts.get(), 0);

    node.stop().await.unwrap();
    broker.stop().await.unwrap();
    resolver.stop().unwrap();
}
