//! Top-level coordinators for the market and user channels.
//!
//! A manager owns the registry, the channel policy, the dial limiter and the
//! reaper task. `add_subscriptions` shards new keys and dials whatever groups
//! need a socket; `remove_subscriptions` only mutates the registry and leaves
//! sockets to the next reaper pass so in-flight events drain; `clear_state`
//! swaps the registry out and tears everything down outside the lock.

use std::sync::{Arc, Mutex};

use metrics::gauge;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::book::BookEntry;
use crate::channel::{Channel, MarketChannel, UserChannel};
use crate::config::{ApiCredentials, MarketOptions, UserOptions};
use crate::error::Result;
use crate::handlers::{MarketHandlers, UserHandlers};
use crate::limiter::{DialLimiter, TokenBucket};
use crate::registry::{GroupRegistry, GroupSnapshot};
use crate::socket;

pub struct StreamManager<C: Channel> {
    registry: Arc<GroupRegistry>,
    channel: Arc<C>,
    limiter: Arc<dyn DialLimiter>,
    url: String,
    max_keys_per_group: usize,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Multiplexer for per-asset order-book streams.
pub type MarketStreamManager = StreamManager<MarketChannel>;

/// Multiplexer for per-market account streams.
pub type UserStreamManager = StreamManager<UserChannel>;

impl MarketStreamManager {
    /// Must be called from within a tokio runtime; the reaper task starts
    /// immediately.
    pub fn new(handlers: impl MarketHandlers, options: MarketOptions) -> Self {
        let registry = Arc::new(GroupRegistry::new());
        let channel = Arc::new(MarketChannel::new(
            Arc::new(handlers),
            registry.clone(),
            options.initial_dump,
        ));
        Self::with_channel(
            registry,
            channel,
            options.burst_limiter,
            options.ws_url,
            options.max_assets_per_ws,
            options.reconnect_and_cleanup_interval,
        )
    }

    /// Copy of the current book replica for one asset.
    pub fn book_entry(&self, asset_id: &str) -> Option<BookEntry> {
        self.channel.books().read().unwrap().get(asset_id).cloned()
    }

    /// Current midpoint as a decimal string without trailing zeros.
    pub fn midpoint(&self, asset_id: &str) -> Result<String> {
        self.channel.books().read().unwrap().midpoint(asset_id)
    }

    /// True iff the asset's spread is at or above `threshold`.
    pub fn spread_over(&self, asset_id: &str, threshold: f64) -> Result<bool> {
        self.channel
            .books()
            .read()
            .unwrap()
            .spread_over(asset_id, threshold)
    }
}

impl UserStreamManager {
    /// Must be called from within a tokio runtime; the reaper task starts
    /// immediately.
    pub fn new(handlers: impl UserHandlers, auth: ApiCredentials, options: UserOptions) -> Self {
        let registry = Arc::new(GroupRegistry::new());
        let channel = Arc::new(UserChannel::new(
            Arc::new(handlers),
            registry.clone(),
            auth,
            options.subscribe_to_all,
        ));
        Self::with_channel(
            registry,
            channel,
            options.burst_limiter,
            options.ws_url,
            options.max_markets_per_ws,
            options.reconnect_and_cleanup_interval,
        )
    }
}

impl<C: Channel> StreamManager<C> {
    fn with_channel(
        registry: Arc<GroupRegistry>,
        channel: Arc<C>,
        limiter: Option<Arc<dyn DialLimiter>>,
        base_url: String,
        max_keys_per_group: usize,
        reap_interval: std::time::Duration,
    ) -> Self {
        let limiter = limiter.unwrap_or_else(|| Arc::new(TokenBucket::default()));
        let url = format!("{}{}", base_url.trim_end_matches('/'), channel.ws_path());
        let manager = Self {
            registry,
            channel,
            limiter,
            url,
            max_keys_per_group,
            reaper: Mutex::new(None),
        };
        manager.start_reaper(reap_interval);
        manager
    }

    fn start_reaper(&self, period: std::time::Duration) {
        let registry = self.registry.clone();
        let channel = self.channel.clone();
        let limiter = self.limiter.clone();
        let url = self.url.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; reaping starts one period in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reap_once(&registry, &channel, &limiter, &url).await;
            }
        });
        *self.reaper.lock().unwrap() = Some(handle);
    }

    /// Shard `keys` into groups and dial every group that needs a socket.
    /// Errors surface through the handler record's `on_error`, never here.
    pub async fn add_subscriptions(&self, keys: &[String]) {
        if self.channel.pin_groups() {
            if let Some(group_id) = self.registry.ensure_pinned_group().await {
                self.dial(group_id).await;
            }
        }
        let group_ids = self
            .registry
            .add_keys(keys, self.max_keys_per_group)
            .await;
        for group_id in group_ids {
            self.dial(group_id).await;
        }
        self.update_metrics().await;
    }

    /// Drop `keys` from the registry. Sockets are not closed here: the next
    /// reaper pass closes fully-drained groups, trading a short window of
    /// wasted frames for never missing events on a still-subscribed key.
    pub async fn remove_subscriptions(&self, keys: &[String]) {
        let removed = self.registry.remove_keys(keys).await;
        self.channel.on_keys_removed(&removed);
        self.update_metrics().await;
    }

    /// Stop the reaper, swap the registry out, close every socket outside
    /// the lock, then run variant cleanup. The instance is terminal after
    /// this call.
    pub async fn clear_state(&self) {
        if let Some(reaper) = self.reaper.lock().unwrap().take() {
            reaper.abort();
        }
        let groups = self.registry.clear_all().await;
        info!(
            channel = self.channel.name(),
            groups = groups.len(),
            "clearing state"
        );
        for group in groups {
            if let Some(socket) = group.socket {
                socket.close();
            }
        }
        self.channel.on_clear();
        self.update_metrics().await;
    }

    /// Number of groups currently registered.
    pub async fn group_count(&self) -> usize {
        self.registry.group_count().await
    }

    /// Number of keys currently subscribed across all groups.
    pub async fn subscription_count(&self) -> usize {
        self.registry.key_count().await
    }

    /// Read-only copy of the group list.
    pub async fn snapshot(&self) -> Vec<GroupSnapshot> {
        self.registry.snapshot().await
    }

    async fn dial(&self, group_id: u64) {
        socket::spawn(
            self.registry.clone(),
            self.channel.clone(),
            self.limiter.clone(),
            self.url.clone(),
            group_id,
        )
        .await;
    }

    async fn update_metrics(&self) {
        gauge!("clob_stream_subscriptions", "channel" => self.channel.name())
            .set(self.registry.key_count().await as f64);
        gauge!("clob_stream_groups", "channel" => self.channel.name())
            .set(self.registry.group_count().await as f64);
    }
}

impl<C: Channel> Drop for StreamManager<C> {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.lock().unwrap().take() {
            reaper.abort();
        }
    }
}

/// One reaper pass: drop drained groups (closing their sockets) and redial
/// dead-but-needed ones. Never stops the loop on errors; dial failures are
/// reported through the channel and retried next tick.
async fn reap_once<C: Channel>(
    registry: &Arc<GroupRegistry>,
    channel: &Arc<C>,
    limiter: &Arc<dyn DialLimiter>,
    url: &str,
) {
    let (redial, removed) = registry.reconnect_and_cleanup().await;
    for group in removed {
        debug!(group_id = group.id, "reaper dropping drained group");
        if let Some(socket) = group.socket {
            socket.close();
        }
    }
    for group_id in redial {
        info!(group_id, channel = channel.name(), "reaper redialing group");
        socket::spawn(
            registry.clone(),
            channel.clone(),
            limiter.clone(),
            url.to_string(),
            group_id,
        )
        .await;
    }
}
