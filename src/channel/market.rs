//! Market-channel policy: order-book streams keyed by asset id.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use metrics::counter;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::book::BookCache;
use crate::config::MARKET_PATH;
use crate::error::{Error, Result};
use crate::events::{
    self, BookEvent, LastTradePriceEvent, MarketEvent, PriceChangeEvent, PriceUpdate,
    TickSizeChangeEvent,
};
use crate::handlers::MarketHandlers;
use crate::registry::GroupRegistry;

use super::Channel;

/// Derived updates follow the midpoint while the spread is below this, and
/// the last trade once it is at or above it.
fn spread_threshold() -> Decimal {
    Decimal::new(1, 1)
}

#[derive(Serialize)]
struct MarketSubscription<'a> {
    assets_ids: &'a [String],
    #[serde(rename = "type")]
    channel: &'static str,
    initial_dump: bool,
}

pub struct MarketChannel {
    handlers: Arc<dyn MarketHandlers>,
    registry: Arc<GroupRegistry>,
    books: RwLock<BookCache>,
    initial_dump: bool,
}

impl MarketChannel {
    pub(crate) fn new(
        handlers: Arc<dyn MarketHandlers>,
        registry: Arc<GroupRegistry>,
        initial_dump: bool,
    ) -> Self {
        Self {
            handlers,
            registry,
            books: RwLock::new(BookCache::new()),
            initial_dump,
        }
    }

    pub(crate) fn books(&self) -> &RwLock<BookCache> {
        &self.books
    }

    /// Dispatch-time filter: keep events whose asset is still subscribed in
    /// some group.
    async fn filter_assets<E>(&self, events: &[E], asset_of: fn(&E) -> &str) -> Vec<E>
    where
        E: Clone,
    {
        let assets: Vec<&str> = events.iter().map(asset_of).collect();
        let subscribed = self.registry.filter_subscribed(&assets).await;
        events
            .iter()
            .filter(|e| subscribed.contains(asset_of(e)))
            .cloned()
            .collect()
    }
}

/// Derived update after a `price_change`: while the spread is tight the
/// midpoint is the fair price.
fn synthesize_from_price_change(
    cache: &mut BookCache,
    event: &PriceChangeEvent,
) -> Option<PriceUpdate> {
    let spread = match cache.spread(&event.asset_id) {
        Ok(spread) => spread,
        Err(err) => {
            debug!(asset_id = %event.asset_id, %err, "derived price skipped");
            return None;
        }
    };
    if spread >= spread_threshold() {
        return None;
    }
    let midpoint = cache.midpoint_decimal(&event.asset_id).ok()?;
    let price = midpoint.normalize().to_string();
    let entry = cache.get_mut(&event.asset_id)?;
    if entry.price == price {
        return None;
    }
    entry.price = price.clone();
    entry.midpoint = price.clone();
    entry.spread = spread.normalize().to_string();
    Some(PriceUpdate {
        asset_id: event.asset_id.clone(),
        event_type: "price_update".to_string(),
        triggering_event: triggering_value(event, "price_change"),
        timestamp: timestamp_or_now(&event.timestamp),
        book: entry.levels(),
        price: price.clone(),
        midpoint: price,
        spread: entry.spread.clone(),
    })
}

/// Derived update after a `last_trade_price`: once the book is wide the
/// last print is the fair price.
fn synthesize_from_last_trade(
    cache: &mut BookCache,
    event: &LastTradePriceEvent,
) -> Option<PriceUpdate> {
    let spread = match cache.spread(&event.asset_id) {
        Ok(spread) => spread,
        Err(err) => {
            debug!(asset_id = %event.asset_id, %err, "derived price skipped");
            return None;
        }
    };
    if spread < spread_threshold() {
        return None;
    }
    let Ok(trade_price) = Decimal::from_str(&event.price) else {
        debug!(asset_id = %event.asset_id, price = %event.price, "unparsable trade price");
        return None;
    };
    // Ensure no trailing zeros survive re-serialization.
    let price = trade_price.normalize().to_string();
    let midpoint = cache.midpoint_decimal(&event.asset_id).ok()?;
    let entry = cache.get_mut(&event.asset_id)?;
    if entry.price == price {
        return None;
    }
    entry.price = price.clone();
    entry.midpoint = midpoint.normalize().to_string();
    entry.spread = spread.normalize().to_string();
    Some(PriceUpdate {
        asset_id: event.asset_id.clone(),
        event_type: "price_update".to_string(),
        triggering_event: triggering_value(event, "last_trade_price"),
        timestamp: timestamp_or_now(&event.timestamp),
        book: entry.levels(),
        price,
        midpoint: entry.midpoint.clone(),
        spread: entry.spread.clone(),
    })
}

/// Re-tag the triggering event with its wire discriminator; the decoded
/// structs do not carry `event_type` themselves.
fn triggering_value<E: Serialize>(event: &E, kind: &str) -> Value {
    let mut value = serde_json::to_value(event).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = value {
        map.insert("event_type".to_string(), Value::String(kind.to_string()));
    }
    value
}

fn timestamp_or_now(timestamp: &str) -> String {
    if timestamp.is_empty() {
        events::now_millis()
    } else {
        timestamp.to_string()
    }
}

#[async_trait]
impl Channel for MarketChannel {
    fn name(&self) -> &'static str {
        "market"
    }

    fn ws_path(&self) -> &'static str {
        MARKET_PATH
    }

    fn subscribe_payload(&self, keys: &[String]) -> Result<String> {
        let payload = MarketSubscription {
            assets_ids: keys,
            channel: "market",
            initial_dump: self.initial_dump,
        };
        Ok(serde_json::to_string(&payload)?)
    }

    async fn handle_events(&self, _group_id: u64, group_keys: &HashSet<String>, events: Vec<Value>) {
        let mut books: Vec<BookEvent> = Vec::new();
        let mut ticks: Vec<TickSizeChangeEvent> = Vec::new();
        let mut changes: Vec<PriceChangeEvent> = Vec::new();
        let mut trades: Vec<LastTradePriceEvent> = Vec::new();

        for value in events {
            match events::market_event_from_value(value) {
                Ok(Some(event)) => {
                    // Receive-time filter: stale events for keys that left
                    // this group never reach handlers or the book cache.
                    if !group_keys.contains(event.asset_id()) {
                        counter!("clob_stream_events_dropped_total", "channel" => "market")
                            .increment(1);
                        debug!(asset_id = %event.asset_id(), "dropping event for unsubscribed asset");
                        continue;
                    }
                    match event {
                        MarketEvent::Book(e) => books.push(e),
                        MarketEvent::TickSizeChange(e) => ticks.push(e),
                        MarketEvent::PriceChange(e) => changes.push(e),
                        MarketEvent::LastTradePrice(e) => trades.push(e),
                    }
                }
                Ok(None) => {
                    counter!("clob_stream_events_dropped_total", "channel" => "market")
                        .increment(1);
                    debug!("dropping event without discriminator");
                }
                Err(err) => self.handlers.on_error(err).await,
            }
        }

        // Handler dispatch, through the dispatch-time subscription filter, in
        // frame order: book, tick, price_change, last_trade_price.
        if !books.is_empty() {
            let batch = self.filter_assets(&books, |e| &e.asset_id).await;
            self.handlers.on_book(batch).await;
        }
        if !ticks.is_empty() {
            let batch = self.filter_assets(&ticks, |e| &e.asset_id).await;
            self.handlers.on_tick_size_change(batch).await;
        }
        if !changes.is_empty() {
            let batch = self.filter_assets(&changes, |e| &e.asset_id).await;
            self.handlers.on_price_change(batch).await;
        }
        if !trades.is_empty() {
            let batch = self.filter_assets(&trades, |e| &e.asset_id).await;
            self.handlers.on_last_trade_price(batch).await;
        }

        // Book maintenance and derived price synthesis. Cache errors are
        // logged and skipped, never fatal. Each price_change is judged
        // against the book state right after its own deltas, so an event
        // that momentarily one-sides the book does not qualify off a later
        // event's repairs.
        let updates = {
            let mut cache = self.books.write().unwrap();
            for event in &books {
                cache.replace_book(event);
            }
            let mut updates = Vec::new();
            for event in &changes {
                if let Err(err) = cache.upsert_price_change(event) {
                    debug!(asset_id = %event.asset_id, %err, "price_change skipped");
                }
                updates.extend(synthesize_from_price_change(&mut cache, event));
            }
            for event in &trades {
                updates.extend(synthesize_from_last_trade(&mut cache, event));
            }
            updates
        };
        if !updates.is_empty() {
            counter!("clob_stream_price_updates_total").increment(updates.len() as u64);
            let batch = self.filter_assets(&updates, |e| &e.asset_id).await;
            self.handlers.on_price_update(batch).await;
        }
    }

    async fn on_open(&self, group_id: u64, keys: Vec<String>) {
        self.handlers.on_open(group_id, keys).await;
    }

    async fn on_close(&self, group_id: u64, code: Option<u16>, reason: String) {
        self.handlers.on_close(group_id, code, reason).await;
    }

    async fn on_error(&self, err: Error) {
        self.handlers.on_error(err).await;
    }

    fn on_keys_removed(&self, keys: &[String]) {
        let mut cache = self.books.write().unwrap();
        for key in keys {
            cache.remove(key);
        }
    }

    fn on_clear(&self) {
        self.books.write().unwrap().clear();
    }
}
