//! Client-side subscription multiplexer for the Polymarket CLOB websocket
//! feeds.
//!
//! Dynamic sets of subscription keys (asset ids on the market channel,
//! market ids on the user channel) are sharded into groups of bounded size,
//! each backed by one websocket connection. Incoming events are
//! demultiplexed to user-supplied handler records; the market variant also
//! maintains an L2 book replica per asset and synthesizes derived
//! `price_update` events from it. A periodic reaper drops drained groups and
//! redials dead ones, and every outbound dial goes through a token-bucket
//! limiter.
//!
//! ```no_run
//! use clob_stream::{MarketHandlers, MarketOptions, MarketStreamManager, PriceUpdate};
//!
//! struct PrintPrices;
//!
//! #[async_trait::async_trait]
//! impl MarketHandlers for PrintPrices {
//!     async fn on_price_update(&self, events: Vec<PriceUpdate>) {
//!         for event in events {
//!             println!("{} -> {}", event.asset_id, event.price);
//!         }
//!     }
//! }
//!
//! # async fn run() {
//! let manager = MarketStreamManager::new(PrintPrices, MarketOptions::default());
//! manager.add_subscriptions(&["asset-1".to_string()]).await;
//! # }
//! ```

pub mod book;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod limiter;
pub mod manager;
pub(crate) mod registry;
pub(crate) mod socket;

pub use book::{BookCache, BookEntry};
pub use channel::{Channel, MarketChannel, UserChannel};
pub use config::{
    ApiCredentials, MarketOptions, UserOptions, DEFAULT_MAX_MARKETS_PER_WS,
    DEFAULT_RECONNECT_AND_CLEANUP_INTERVAL, DEFAULT_WS_URL,
};
pub use error::{Error, Result};
pub use events::{
    BookEvent, BookLevels, LastTradePriceEvent, MarketEvent, OrderEvent, PriceChange,
    PriceChangeEvent, PriceLevel, PriceUpdate, Side, TickSizeChangeEvent, TradeEvent, UserEvent,
};
pub use handlers::{MarketHandlers, UserHandlers};
pub use limiter::{DialLimiter, TokenBucket};
pub use manager::{MarketStreamManager, StreamManager, UserStreamManager};
pub use registry::{GroupSnapshot, GroupStatus};
