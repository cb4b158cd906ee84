//! L2 order-book replica and derived price signals.
//!
//! One [`BookEntry`] per asset, rebuilt from `book` snapshots and kept current
//! with `price_change` deltas. Sides are `BTreeMap<Decimal, Decimal>` so price
//! levels stay sorted and arithmetic stays exact; strings only appear at the
//! wire boundary.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use rust_decimal::Decimal;
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::{BookEvent, BookLevels, PriceChangeEvent, PriceLevel, Side};

/// Book replica for a single asset.
#[derive(Debug, Clone, Default)]
pub struct BookEntry {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    /// Last announced derived values, empty until first computed.
    pub midpoint: String,
    pub spread: String,
    pub price: String,
    /// Snapshot identifier supplied by the feed.
    pub hash: String,
    pub timestamp: String,
}

impl BookEntry {
    /// Highest bid price.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    /// Lowest ask price.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Bid levels, best (highest) first.
    pub fn bid_levels(&self) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .map(|(price, size)| PriceLevel {
                price: price.normalize().to_string(),
                size: size.normalize().to_string(),
            })
            .collect()
    }

    /// Ask levels, best (lowest) first.
    pub fn ask_levels(&self) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .map(|(price, size)| PriceLevel {
                price: price.normalize().to_string(),
                size: size.normalize().to_string(),
            })
            .collect()
    }

    /// Both sides, for synthesized events.
    pub fn levels(&self) -> BookLevels {
        BookLevels {
            bids: self.bid_levels(),
            asks: self.ask_levels(),
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Decimal, Decimal> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    fn recompute_derived(&mut self) {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => {
                self.midpoint = ((bid + ask) / Decimal::from(2)).normalize().to_string();
                self.spread = (ask - bid).normalize().to_string();
            }
            _ => {
                self.midpoint.clear();
                self.spread.clear();
            }
        }
    }
}

fn parse_level(price: &str, size: &str) -> Option<(Decimal, Decimal)> {
    let price = Decimal::from_str(price).ok()?;
    let size = Decimal::from_str(size).ok()?;
    if size.is_sign_negative() {
        return None;
    }
    Some((price, size))
}

/// Mapping asset_id → [`BookEntry`]. Single writer per asset: every asset
/// lives in exactly one group, and each group's socket is the only consumer
/// of its frames.
#[derive(Debug, Default)]
pub struct BookCache {
    books: HashMap<String, BookEntry>,
}

impl BookCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the asset's sides, hash and timestamp with the snapshot and
    /// recompute the stored midpoint/spread. The announced `price` survives
    /// snapshots so repeated books do not re-trigger derived updates.
    pub fn replace_book(&mut self, event: &BookEvent) {
        let entry = self.books.entry(event.asset_id.clone()).or_default();
        entry.bids.clear();
        entry.asks.clear();
        for level in &event.bids {
            if let Some((price, size)) = parse_level(&level.price, &level.size) {
                if !size.is_zero() {
                    entry.bids.insert(price, size);
                }
            }
        }
        for level in &event.asks {
            if let Some((price, size)) = parse_level(&level.price, &level.size) {
                if !size.is_zero() {
                    entry.asks.insert(price, size);
                }
            }
        }
        entry.hash = event.hash.clone();
        entry.timestamp = event.timestamp.clone();
        entry.recompute_derived();
    }

    /// Apply the event's deltas in order. Size 0 removes the level. Fails if
    /// the asset has never received a snapshot.
    pub fn upsert_price_change(&mut self, event: &PriceChangeEvent) -> Result<()> {
        let entry = self
            .books
            .get_mut(&event.asset_id)
            .ok_or_else(|| Error::BookNotFound(event.asset_id.clone()))?;
        for change in &event.changes {
            let Some((price, size)) = parse_level(&change.price, &change.size) else {
                debug!(
                    asset_id = %event.asset_id,
                    price = %change.price,
                    size = %change.size,
                    "skipping unparsable price_change level"
                );
                continue;
            };
            let side = entry.side_mut(change.side);
            if size.is_zero() {
                side.remove(&price);
            } else {
                side.insert(price, size);
            }
        }
        entry.timestamp = event.timestamp.clone();
        Ok(())
    }

    /// Current spread (best ask − best bid).
    pub fn spread(&self, asset_id: &str) -> Result<Decimal> {
        let entry = self
            .books
            .get(asset_id)
            .ok_or_else(|| Error::BookNotFound(asset_id.to_string()))?;
        match (entry.best_bid(), entry.best_ask()) {
            (Some(bid), Some(ask)) => Ok(ask - bid),
            _ => Err(Error::IncompleteBook(asset_id.to_string())),
        }
    }

    /// True iff the spread is at or above `threshold`.
    pub fn spread_over(&self, asset_id: &str, threshold: f64) -> Result<bool> {
        let spread = self.spread(asset_id)?;
        let threshold = Decimal::try_from(threshold)
            .map_err(|e| Error::Generic(format!("bad spread threshold {threshold}: {e}")))?;
        Ok(spread >= threshold)
    }

    /// Current midpoint as a decimal.
    pub fn midpoint_decimal(&self, asset_id: &str) -> Result<Decimal> {
        let entry = self
            .books
            .get(asset_id)
            .ok_or_else(|| Error::BookNotFound(asset_id.to_string()))?;
        match (entry.best_bid(), entry.best_ask()) {
            (Some(bid), Some(ask)) => Ok((bid + ask) / Decimal::from(2)),
            _ => Err(Error::IncompleteBook(asset_id.to_string())),
        }
    }

    /// Current midpoint as a decimal string without trailing zeros.
    pub fn midpoint(&self, asset_id: &str) -> Result<String> {
        Ok(self.midpoint_decimal(asset_id)?.normalize().to_string())
    }

    pub fn get(&self, asset_id: &str) -> Option<&BookEntry> {
        self.books.get(asset_id)
    }

    pub(crate) fn get_mut(&mut self, asset_id: &str) -> Option<&mut BookEntry> {
        self.books.get_mut(asset_id)
    }

    pub fn remove(&mut self, asset_id: &str) {
        self.books.remove(asset_id);
    }

    pub fn clear(&mut self) {
        self.books.clear();
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
