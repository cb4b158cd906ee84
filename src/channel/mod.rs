//! Channel policies: everything that differs between the market and user
//! feeds.
//!
//! The manager and socket drive a [`Channel`] the way a transport drives a
//! handler: endpoint, subscription payload, pinning policy and the event
//! pipeline are all behind this seam, so the two variants are values rather
//! than subclasses.

mod market;
mod user;

pub use market::MarketChannel;
pub use user::UserChannel;

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Label for logs and metrics.
    fn name(&self) -> &'static str;

    /// Path appended to the websocket base URL.
    fn ws_path(&self) -> &'static str;

    /// Whether this channel keeps one pinned group alive even when empty.
    fn pin_groups(&self) -> bool {
        false
    }

    /// One-shot payload sent when a socket opens.
    fn subscribe_payload(&self, keys: &[String]) -> Result<String>;

    /// Demultiplex one frame's events. `group_keys` is the owning group's key
    /// set at receive time.
    async fn handle_events(&self, group_id: u64, group_keys: &HashSet<String>, events: Vec<Value>);

    /// Socket lifecycle, forwarded to the user's handler record.
    async fn on_open(&self, group_id: u64, keys: Vec<String>);
    async fn on_close(&self, group_id: u64, code: Option<u16>, reason: String);
    async fn on_error(&self, err: Error);

    /// Keys dropped from the registry (the market variant purges its books).
    fn on_keys_removed(&self, _keys: &[String]) {}

    /// Variant cleanup when the manager clears state.
    fn on_clear(&self) {}
}
