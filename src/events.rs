//! Wire event types for the market and user channels, plus the synthesized
//! `price_update` event.
//!
//! Frames arrive as untyped JSON, either a single event object or an array of
//! them, discriminated by `event_type`. Parsing goes through `serde_json::Value`
//! first so that entries without a discriminator can be dropped and unknown
//! kinds can be reported without losing the rest of the frame.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Deserialize a field that the feed sends as either a string or a number.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Ok(String::new()),
    }
}

/// Same as [`string_or_number`], tolerating an absent field.
fn string_or_number_default<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Ok(String::new()),
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// One price level, prices and sizes kept as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    #[serde(deserialize_with = "string_or_number")]
    pub price: String,
    #[serde(deserialize_with = "string_or_number")]
    pub size: String,
}

/// Full L2 snapshot for one asset (`event_type: "book"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookEvent {
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(default, deserialize_with = "string_or_number_default")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "string_or_number_default")]
    pub hash: String,
}

/// One delta inside a `price_change` event. Size 0 removes the level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceChange {
    #[serde(deserialize_with = "string_or_number")]
    pub price: String,
    #[serde(deserialize_with = "string_or_number")]
    pub size: String,
    pub side: Side,
}

/// Level deltas for one asset (`event_type: "price_change"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceChangeEvent {
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    pub changes: Vec<PriceChange>,
    #[serde(default, deserialize_with = "string_or_number_default")]
    pub timestamp: String,
}

/// Tick size update (`event_type: "tick_size_change"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSizeChangeEvent {
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(deserialize_with = "string_or_number")]
    pub old_tick_size: String,
    #[serde(deserialize_with = "string_or_number")]
    pub new_tick_size: String,
    #[serde(default, deserialize_with = "string_or_number_default")]
    pub timestamp: String,
}

/// Print of the last trade (`event_type: "last_trade_price"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastTradePriceEvent {
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(deserialize_with = "string_or_number")]
    pub price: String,
    #[serde(default, deserialize_with = "string_or_number_default")]
    pub size: String,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default, deserialize_with = "string_or_number_default")]
    pub timestamp: String,
}

/// Any event the market channel can deliver.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Book(BookEvent),
    PriceChange(PriceChangeEvent),
    TickSizeChange(TickSizeChangeEvent),
    LastTradePrice(LastTradePriceEvent),
}

impl MarketEvent {
    pub fn asset_id(&self) -> &str {
        match self {
            Self::Book(e) => &e.asset_id,
            Self::PriceChange(e) => &e.asset_id,
            Self::TickSizeChange(e) => &e.asset_id,
            Self::LastTradePrice(e) => &e.asset_id,
        }
    }
}

/// Order update on the user channel (`event_type: "order"`). The `market`
/// field drives dispatch filtering; everything else the feed sent is kept in
/// `fields`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Trade update on the user channel (`event_type: "trade"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Any event the user channel can deliver.
#[derive(Debug, Clone)]
pub enum UserEvent {
    Order(OrderEvent),
    Trade(TradeEvent),
}

impl UserEvent {
    pub fn market(&self) -> &str {
        match self {
            Self::Order(e) => &e.market,
            Self::Trade(e) => &e.market,
        }
    }
}

/// Bid/ask snapshot carried on a synthesized [`PriceUpdate`].
#[derive(Debug, Clone, Serialize)]
pub struct BookLevels {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Client-synthesized fair-price event. Never sent on the wire; emitted when
/// the local book implies a new price under the spread gate.
#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdate {
    pub asset_id: String,
    pub event_type: String,
    #[serde(rename = "triggeringEvent")]
    pub triggering_event: Value,
    pub timestamp: String,
    pub book: BookLevels,
    pub price: String,
    pub midpoint: String,
    pub spread: String,
}

/// Current time in feed timestamp format (milliseconds since epoch).
pub(crate) fn now_millis() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Split a raw frame into its event objects. Frames are either a single JSON
/// object or an array of them.
pub fn parse_frame(text: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(text)?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Decode one market-channel entry. `Ok(None)` means the entry carried no
/// discriminator or no asset id and is silently dropped; an unknown
/// `event_type` is an error so the caller can report it.
pub fn market_event_from_value(value: Value) -> Result<Option<MarketEvent>> {
    let Some(kind) = value.get("event_type").and_then(Value::as_str).map(str::to_owned) else {
        return Ok(None);
    };
    let event = match kind.as_str() {
        "book" => MarketEvent::Book(serde_json::from_value(value)?),
        "price_change" => MarketEvent::PriceChange(serde_json::from_value(value)?),
        "tick_size_change" => MarketEvent::TickSizeChange(serde_json::from_value(value)?),
        "last_trade_price" => MarketEvent::LastTradePrice(serde_json::from_value(value)?),
        other => return Err(Error::UnknownEventKind(other.to_string())),
    };
    if event.asset_id().is_empty() {
        return Ok(None);
    }
    Ok(Some(event))
}

/// Decode one user-channel entry. Same drop/report contract as
/// [`market_event_from_value`].
pub fn user_event_from_value(value: Value) -> Result<Option<UserEvent>> {
    let Some(kind) = value.get("event_type").and_then(Value::as_str).map(str::to_owned) else {
        return Ok(None);
    };
    let event = match kind.as_str() {
        "order" => UserEvent::Order(serde_json::from_value(value)?),
        "trade" => UserEvent::Trade(serde_json::from_value(value)?),
        other => return Err(Error::UnknownEventKind(other.to_string())),
    };
    Ok(Some(event))
}
