//! End-to-end scenarios against an in-process websocket server.
//!
//! The mock server accepts connections on a loopback listener, records each
//! connection's subscription payload, answers pings, and lets tests push
//! frames or drop connections to exercise sharding, filtering, derived-price
//! synthesis and reconnection.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use clob_stream::{
    ApiCredentials, BookEvent, Error, GroupStatus, MarketHandlers, MarketOptions,
    MarketStreamManager, OrderEvent, PriceUpdate, TradeEvent, UserHandlers, UserOptions,
    UserStreamManager,
};

// ---------------------------------------------------------------------------
// Mock websocket server
// ---------------------------------------------------------------------------

struct ServerConn {
    subscription: Value,
    frames: mpsc::UnboundedSender<Message>,
    closed: Arc<Mutex<bool>>,
}

struct MockServer {
    addr: SocketAddr,
    conns: Arc<Mutex<Vec<ServerConn>>>,
}

/// Route `RUST_LOG`-filtered tracing output through the test writer.
fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

impl MockServer {
    async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conns: Arc<Mutex<Vec<ServerConn>>> = Arc::default();
        let accept_conns = conns.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_conn(stream, accept_conns.clone()));
            }
        });
        Self { addr, conns }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn conn_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    fn subscription(&self, index: usize) -> Value {
        self.conns.lock().unwrap()[index].subscription.clone()
    }

    fn send(&self, index: usize, frame: Value) {
        // Ignore send failures: the connection may already be reaped.
        let _ = self.conns.lock().unwrap()[index]
            .frames
            .send(Message::Text(frame.to_string()));
    }

    /// Server-side close of one connection.
    fn disconnect(&self, index: usize) {
        let _ = self.conns.lock().unwrap()[index]
            .frames
            .send(Message::Close(None));
    }

    fn is_closed(&self, index: usize) -> bool {
        *self.conns.lock().unwrap()[index].closed.lock().unwrap()
    }
}

async fn handle_conn(stream: TcpStream, conns: Arc<Mutex<Vec<ServerConn>>>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut write, mut read) = ws.split();

    // The first text message is the subscription payload.
    let subscription = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<Value>(&text).unwrap(),
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let closed = Arc::new(Mutex::new(false));
    conns.lock().unwrap().push(ServerConn {
        subscription,
        frames: tx,
        closed: closed.clone(),
    });

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(msg) => {
                    let is_close = matches!(msg, Message::Close(_));
                    if write.send(msg).await.is_err() || is_close {
                        break;
                    }
                }
                None => break,
            },
            inc = read.next() => match inc {
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    *closed.lock().unwrap() = true;
}

// ---------------------------------------------------------------------------
// Capturing handlers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MarketState {
    opens: Mutex<Vec<(u64, Vec<String>)>>,
    closes: Mutex<Vec<u64>>,
    books: Mutex<Vec<BookEvent>>,
    updates: Mutex<Vec<PriceUpdate>>,
    errors: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
struct MarketRecorder(Arc<MarketState>);

#[async_trait]
impl MarketHandlers for MarketRecorder {
    async fn on_book(&self, events: Vec<BookEvent>) {
        self.0.books.lock().unwrap().extend(events);
    }

    async fn on_price_update(&self, events: Vec<PriceUpdate>) {
        self.0.updates.lock().unwrap().extend(events);
    }

    async fn on_open(&self, group_id: u64, keys: Vec<String>) {
        self.0.opens.lock().unwrap().push((group_id, keys));
    }

    async fn on_close(&self, group_id: u64, _code: Option<u16>, _reason: String) {
        self.0.closes.lock().unwrap().push(group_id);
    }

    async fn on_error(&self, err: Error) {
        self.0.errors.lock().unwrap().push(err.to_string());
    }
}

#[derive(Default)]
struct UserState {
    opens: Mutex<Vec<(u64, Vec<String>)>>,
    orders: Mutex<Vec<Vec<OrderEvent>>>,
    trades: Mutex<Vec<Vec<TradeEvent>>>,
}

#[derive(Clone, Default)]
struct UserRecorder(Arc<UserState>);

#[async_trait]
impl UserHandlers for UserRecorder {
    async fn on_order(&self, events: Vec<OrderEvent>) {
        self.0.orders.lock().unwrap().push(events);
    }

    async fn on_trade(&self, events: Vec<TradeEvent>) {
        self.0.trades.lock().unwrap().push(events);
    }

    async fn on_open(&self, group_id: u64, keys: Vec<String>) {
        self.0.opens.lock().unwrap().push((group_id, keys));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

macro_rules! wait_for {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                stringify!($cond)
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }};
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn string_set(value: &Value, field: &str) -> HashSet<String> {
    value[field]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

fn market_options(server: &MockServer) -> MarketOptions {
    MarketOptions {
        ws_url: server.url(),
        reconnect_and_cleanup_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

fn credentials() -> ApiCredentials {
    ApiCredentials {
        api_key: "key".to_string(),
        secret: "secret".to_string(),
        passphrase: "phrase".to_string(),
    }
}

fn book_frame(asset: &str, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> Value {
    let levels = |side: &[(&str, &str)]| -> Vec<Value> {
        side.iter()
            .map(|(p, s)| json!({"price": p, "size": s}))
            .collect()
    };
    json!({
        "event_type": "book",
        "asset_id": asset,
        "bids": levels(bids),
        "asks": levels(asks),
        "timestamp": "1704067200000",
        "hash": "h1",
    })
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shard_overflow_opens_one_socket_per_group() {
    let server = MockServer::start().await;
    let recorder = MarketRecorder::default();
    let options = MarketOptions {
        max_assets_per_ws: 2,
        ..market_options(&server)
    };
    let manager = MarketStreamManager::new(recorder.clone(), options);

    manager.add_subscriptions(&keys(&["a", "b", "c"])).await;
    wait_for!(server.conn_count() == 2);

    let subs: Vec<HashSet<String>> = (0..2)
        .map(|i| string_set(&server.subscription(i), "assets_ids"))
        .collect();
    let expect_ab: HashSet<String> = keys(&["a", "b"]).into_iter().collect();
    let expect_c: HashSet<String> = keys(&["c"]).into_iter().collect();
    assert!(subs.contains(&expect_ab));
    assert!(subs.contains(&expect_c));
    assert_eq!(manager.group_count().await, 2);

    wait_for!(recorder.0.opens.lock().unwrap().len() == 2);
    wait_for!({
        let snapshot = manager.snapshot().await;
        snapshot.iter().all(|g| g.status == GroupStatus::Alive)
    });
}

#[tokio::test]
async fn adding_overlapping_keys_dials_only_the_new_group() {
    let server = MockServer::start().await;
    let recorder = MarketRecorder::default();
    let options = MarketOptions {
        max_assets_per_ws: 2,
        ..market_options(&server)
    };
    let manager = MarketStreamManager::new(recorder, options);

    manager.add_subscriptions(&keys(&["a", "b"])).await;
    wait_for!(server.conn_count() == 1);

    manager.add_subscriptions(&keys(&["b", "c"])).await;
    wait_for!(server.conn_count() == 2);

    // No third dial: "b" was deduplicated, only the group that received "c"
    // connected.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.conn_count(), 2);
    let second = string_set(&server.subscription(1), "assets_ids");
    assert_eq!(second, keys(&["c"]).into_iter().collect());
    assert_eq!(manager.subscription_count().await, 3);
}

#[tokio::test]
async fn removed_key_is_filtered_then_group_reaped() {
    let server = MockServer::start().await;
    let recorder = MarketRecorder::default();
    let manager = MarketStreamManager::new(recorder.clone(), market_options(&server));

    manager.add_subscriptions(&keys(&["a"])).await;
    wait_for!(recorder.0.opens.lock().unwrap().len() == 1);

    manager.remove_subscriptions(&keys(&["a"])).await;
    // The socket is still up; a late event for the removed key must be
    // filtered out before any handler runs.
    server.send(0, book_frame("a", &[("0.60", "10")], &[("0.62", "8")]));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(recorder.0.books.lock().unwrap().is_empty());

    // The next reaper pass drops the drained group and closes its socket.
    wait_for!(manager.group_count().await == 0);
    wait_for!(server.is_closed(0));
}

#[tokio::test]
async fn book_deltas_synthesize_price_update() {
    let server = MockServer::start().await;
    let recorder = MarketRecorder::default();
    let manager = MarketStreamManager::new(recorder.clone(), market_options(&server));

    manager.add_subscriptions(&keys(&["a"])).await;
    wait_for!(recorder.0.opens.lock().unwrap().len() == 1);

    server.send(0, book_frame("a", &[("0.60", "10")], &[("0.62", "8")]));
    wait_for!(recorder.0.books.lock().unwrap().len() == 1);
    assert_eq!(manager.midpoint("a").unwrap(), "0.61");
    // A snapshot alone never synthesizes an update.
    assert!(recorder.0.updates.lock().unwrap().is_empty());

    server.send(
        0,
        json!({
            "event_type": "price_change",
            "asset_id": "a",
            "changes": [
                {"price": "0.60", "size": "0", "side": "BUY"},
                {"price": "0.59", "size": "5", "side": "BUY"},
            ],
            "timestamp": "1704067201000",
        }),
    );
    wait_for!(recorder.0.updates.lock().unwrap().len() == 1);

    {
        let updates = recorder.0.updates.lock().unwrap();
        assert_eq!(updates[0].asset_id, "a");
        assert_eq!(updates[0].price, "0.605");
        assert_eq!(updates[0].midpoint, "0.605");
        assert_eq!(updates[0].spread, "0.03");
        assert_eq!(updates[0].book.bids.len(), 1);
        assert_eq!(updates[0].book.bids[0].price, "0.59");
        assert_eq!(updates[0].book.bids[0].size, "5");
    }
    // The replica equals the snapshot plus deltas, zero-size level removed.
    let entry = manager.book_entry("a").unwrap();
    assert_eq!(entry.bid_levels().len(), 1);
    assert_eq!(entry.bid_levels()[0].price, "0.59");
    assert!(!manager.spread_over("a", 0.10).unwrap());
}

#[tokio::test]
async fn wide_book_derives_price_from_last_trade_once() {
    let server = MockServer::start().await;
    let recorder = MarketRecorder::default();
    let manager = MarketStreamManager::new(recorder.clone(), market_options(&server));

    manager.add_subscriptions(&keys(&["a"])).await;
    wait_for!(recorder.0.opens.lock().unwrap().len() == 1);

    server.send(0, book_frame("a", &[("0.50", "10")], &[("0.62", "8")]));
    wait_for!(recorder.0.books.lock().unwrap().len() == 1);
    assert!(manager.spread_over("a", 0.10).unwrap());

    let trade = json!({
        "event_type": "last_trade_price",
        "asset_id": "a",
        "price": "0.7000",
        "size": "3",
        "side": "SELL",
        "timestamp": "1704067203000",
    });
    server.send(0, trade.clone());
    wait_for!(recorder.0.updates.lock().unwrap().len() == 1);
    assert_eq!(recorder.0.updates.lock().unwrap()[0].price, "0.7");

    // The identical print again announces nothing new.
    server.send(0, trade);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.0.updates.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn dead_group_reconnects_with_same_keys() {
    let server = MockServer::start().await;
    let recorder = MarketRecorder::default();
    let manager = MarketStreamManager::new(recorder.clone(), market_options(&server));

    manager.add_subscriptions(&keys(&["a"])).await;
    wait_for!(recorder.0.opens.lock().unwrap().len() == 1);
    let group_id = manager.snapshot().await[0].id;

    server.disconnect(0);
    wait_for!(recorder.0.closes.lock().unwrap().len() == 1);
    assert_eq!(recorder.0.closes.lock().unwrap().as_slice(), &[group_id]);

    // One reaper tick later the group redials; keys survive the reconnect.
    wait_for!(server.conn_count() == 2);
    wait_for!(recorder.0.opens.lock().unwrap().len() == 2);
    let resub = string_set(&server.subscription(1), "assets_ids");
    assert_eq!(resub, keys(&["a"]).into_iter().collect());
    let snapshot = manager.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, group_id);
    assert_eq!(snapshot[0].keys, keys(&["a"]));
}

#[tokio::test]
async fn clear_state_closes_sockets_and_empties_registry() {
    let server = MockServer::start().await;
    let recorder = MarketRecorder::default();
    let manager = MarketStreamManager::new(recorder.clone(), market_options(&server));

    manager.add_subscriptions(&keys(&["a", "b"])).await;
    wait_for!(recorder.0.opens.lock().unwrap().len() == 1);

    manager.clear_state().await;
    assert_eq!(manager.group_count().await, 0);
    wait_for!(server.is_closed(0));
    assert!(manager.book_entry("a").is_none());
}

#[tokio::test]
async fn user_channel_subscribes_with_auth_and_filters_markets() {
    let server = MockServer::start().await;
    let recorder = UserRecorder::default();
    let options = UserOptions {
        ws_url: server.url(),
        reconnect_and_cleanup_interval: Duration::from_millis(200),
        ..Default::default()
    };
    let manager = UserStreamManager::new(recorder.clone(), credentials(), options);

    manager.add_subscriptions(&keys(&["m1"])).await;
    wait_for!(recorder.0.opens.lock().unwrap().len() == 1);

    let sub = server.subscription(0);
    assert_eq!(sub["type"], "USER");
    assert_eq!(string_set(&sub, "markets"), keys(&["m1"]).into_iter().collect());
    assert_eq!(sub["auth"]["apiKey"], "key");
    assert_eq!(sub["auth"]["secret"], "secret");

    server.send(
        0,
        json!({"event_type": "order", "market": "m1", "id": "o1", "price": "0.4"}),
    );
    wait_for!(recorder.0.orders.lock().unwrap().len() == 1);
    assert_eq!(recorder.0.orders.lock().unwrap()[0].len(), 1);

    // A trade for an unsubscribed market still ticks the handler, with an
    // empty batch.
    server.send(0, json!({"event_type": "trade", "market": "m9", "id": "t1"}));
    wait_for!(recorder.0.trades.lock().unwrap().len() == 1);
    assert!(recorder.0.trades.lock().unwrap()[0].is_empty());
}

#[tokio::test]
async fn subscribe_to_all_keeps_pinned_group_and_passes_everything() {
    let server = MockServer::start().await;
    let recorder = UserRecorder::default();
    let options = UserOptions {
        ws_url: server.url(),
        reconnect_and_cleanup_interval: Duration::from_millis(200),
        subscribe_to_all: true,
        ..Default::default()
    };
    let manager = UserStreamManager::new(recorder.clone(), credentials(), options);

    // No explicit markets: the pinned group still dials and subscribes.
    manager.add_subscriptions(&[]).await;
    wait_for!(recorder.0.opens.lock().unwrap().len() == 1);
    let sub = server.subscription(0);
    assert!(sub["markets"].as_array().unwrap().is_empty());

    server.send(
        0,
        json!({"event_type": "order", "market": "anything", "id": "o1"}),
    );
    wait_for!(recorder.0.orders.lock().unwrap().len() == 1);
    assert_eq!(recorder.0.orders.lock().unwrap()[0].len(), 1);

    // The pinned group survives reaper passes even though it holds no keys.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(manager.group_count().await, 1);
    assert!(!server.is_closed(0));
}
