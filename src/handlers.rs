//! User-facing callback records.
//!
//! Implement the methods you care about; everything defaults to a no-op.
//! Handlers live for the lifetime of the manager and are invoked one frame
//! at a time per socket, so slow handlers back-pressure that socket only.

use async_trait::async_trait;

use crate::error::Error;
use crate::events::{
    BookEvent, LastTradePriceEvent, OrderEvent, PriceChangeEvent, PriceUpdate,
    TickSizeChangeEvent, TradeEvent,
};

/// Callbacks for the market channel.
///
/// Batches are per incoming frame and already filtered to the current
/// subscription set; a batch may be empty when every event in the frame was
/// filtered after receipt.
#[async_trait]
pub trait MarketHandlers: Send + Sync + 'static {
    async fn on_book(&self, _events: Vec<BookEvent>) {}
    async fn on_price_change(&self, _events: Vec<PriceChangeEvent>) {}
    async fn on_tick_size_change(&self, _events: Vec<TickSizeChangeEvent>) {}
    async fn on_last_trade_price(&self, _events: Vec<LastTradePriceEvent>) {}
    /// Synthesized derived-price events, never sent on the wire.
    async fn on_price_update(&self, _events: Vec<PriceUpdate>) {}
    async fn on_open(&self, _group_id: u64, _keys: Vec<String>) {}
    async fn on_close(&self, _group_id: u64, _code: Option<u16>, _reason: String) {}
    async fn on_error(&self, _err: Error) {}
}

/// Callbacks for the user channel.
#[async_trait]
pub trait UserHandlers: Send + Sync + 'static {
    async fn on_order(&self, _events: Vec<OrderEvent>) {}
    async fn on_trade(&self, _events: Vec<TradeEvent>) {}
    async fn on_open(&self, _group_id: u64, _keys: Vec<String>) {}
    async fn on_close(&self, _group_id: u64, _code: Option<u16>, _reason: String) {}
    async fn on_error(&self, _err: Error) {}
}
