//! User-channel policy: per-market account streams (orders and trades).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{ApiCredentials, USER_PATH};
use crate::error::{Error, Result};
use crate::events::{self, OrderEvent, TradeEvent, UserEvent};
use crate::handlers::UserHandlers;
use crate::registry::GroupRegistry;

use super::Channel;

#[derive(Serialize)]
struct UserSubscription<'a> {
    markets: &'a [String],
    #[serde(rename = "type")]
    channel: &'static str,
    auth: &'a ApiCredentials,
}

pub struct UserChannel {
    handlers: Arc<dyn UserHandlers>,
    registry: Arc<GroupRegistry>,
    auth: ApiCredentials,
    subscribe_to_all: bool,
}

impl UserChannel {
    pub(crate) fn new(
        handlers: Arc<dyn UserHandlers>,
        registry: Arc<GroupRegistry>,
        auth: ApiCredentials,
        subscribe_to_all: bool,
    ) -> Self {
        Self {
            handlers,
            registry,
            auth,
            subscribe_to_all,
        }
    }

    /// Dispatch-time filter: everything passes while a subscribe-to-all group
    /// exists, otherwise only events for currently-subscribed markets.
    async fn filter_markets<E>(&self, events: Vec<E>, market_of: fn(&E) -> &str) -> Vec<E> {
        if self.registry.has_pinned().await {
            return events;
        }
        let markets: Vec<&str> = events.iter().map(market_of).collect();
        let subscribed = self.registry.filter_subscribed(&markets).await;
        events
            .into_iter()
            .filter(|e| subscribed.contains(market_of(e)))
            .collect()
    }
}

#[async_trait]
impl Channel for UserChannel {
    fn name(&self) -> &'static str {
        "user"
    }

    fn ws_path(&self) -> &'static str {
        USER_PATH
    }

    fn pin_groups(&self) -> bool {
        self.subscribe_to_all
    }

    fn subscribe_payload(&self, keys: &[String]) -> Result<String> {
        let payload = UserSubscription {
            markets: keys,
            channel: "USER",
            auth: &self.auth,
        };
        Ok(serde_json::to_string(&payload)?)
    }

    async fn handle_events(&self, _group_id: u64, _group_keys: &HashSet<String>, events: Vec<Value>) {
        let mut orders: Vec<OrderEvent> = Vec::new();
        let mut trades: Vec<TradeEvent> = Vec::new();

        for value in events {
            match events::user_event_from_value(value) {
                Ok(Some(UserEvent::Order(event))) => orders.push(event),
                Ok(Some(UserEvent::Trade(event))) => trades.push(event),
                Ok(None) => {
                    counter!("clob_stream_events_dropped_total", "channel" => "user").increment(1);
                    debug!("dropping event without discriminator");
                }
                Err(err) => self.handlers.on_error(err).await,
            }
        }

        // Handlers always see the (possibly empty) filtered batch so
        // consumers can observe ticks even when nothing passed.
        if !orders.is_empty() {
            let batch = self.filter_markets(orders, |e| &e.market).await;
            self.handlers.on_order(batch).await;
        }
        if !trades.is_empty() {
            let batch = self.filter_markets(trades, |e| &e.market).await;
            self.handlers.on_trade(batch).await;
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
}
