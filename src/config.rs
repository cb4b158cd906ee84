//! Configuration for the stream managers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::limiter::DialLimiter;

/// Production websocket host.
pub const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com";

/// Channel paths appended to the base URL.
pub(crate) const MARKET_PATH: &str = "/ws/market";
pub(crate) const USER_PATH: &str = "/ws/user";

/// How often the reaper drops empty groups and redials dead ones.
pub const DEFAULT_RECONNECT_AND_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Per-connection subscription cap on the user channel.
pub const DEFAULT_MAX_MARKETS_PER_WS: usize = 100;

/// Dial budget per window for the default limiter.
pub const DEFAULT_DIAL_BURST: u32 = 5;
pub const DEFAULT_DIAL_WINDOW: Duration = Duration::from_secs(1);

/// API credentials for the user channel, passed through opaquely in the
/// subscription payload.
#[derive(Debug, Clone, Serialize)]
pub struct ApiCredentials {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

/// Options for [`MarketStreamManager`](crate::manager::MarketStreamManager).
#[derive(Clone)]
pub struct MarketOptions {
    /// Websocket base URL; the channel path is appended.
    pub ws_url: String,
    /// Reaper period.
    pub reconnect_and_cleanup_interval: Duration,
    /// Maximum assets per connection. Unbounded by default.
    pub max_assets_per_ws: usize,
    /// Ask the server for a full book snapshot on subscribe.
    pub initial_dump: bool,
    /// Override for the shared dial limiter.
    pub burst_limiter: Option<Arc<dyn DialLimiter>>,
}

impl Default for MarketOptions {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            reconnect_and_cleanup_interval: DEFAULT_RECONNECT_AND_CLEANUP_INTERVAL,
            max_assets_per_ws: usize::MAX,
            initial_dump: true,
            burst_limiter: None,
        }
    }
}

/// Options for [`UserStreamManager`](crate::manager::UserStreamManager).
#[derive(Clone)]
pub struct UserOptions {
    /// Websocket base URL; the channel path is appended.
    pub ws_url: String,
    /// Reaper period.
    pub reconnect_and_cleanup_interval: Duration,
    /// Maximum markets per connection.
    pub max_markets_per_ws: usize,
    /// Keep one pinned connection subscribed to every market.
    pub subscribe_to_all: bool,
    /// Override for the shared dial limiter.
    pub burst_limiter: Option<Arc<dyn DialLimiter>>,
}

impl Default for UserOptions {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            reconnect_and_cleanup_interval: DEFAULT_RECONNECT_AND_CLEANUP_INTERVAL,
            max_markets_per_ws: DEFAULT_MAX_MARKETS_PER_WS,
            subscribe_to_all: false,
            burst_limiter: None,
        }
    }
}
