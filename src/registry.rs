//! Sharding of subscription keys into socket-backed groups.
//!
//! The registry owns the group list behind one async mutex. Every mutation
//! funnels through that lock and releases it before any I/O or user callback
//! runs; teardown follows the swap-then-work-outside-the-lock pattern. Reads
//! used for dispatch tolerate races by treating a missing group as "just
//! removed".

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Published lifecycle state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Created or dialing; no live subscription yet.
    Pending,
    /// Socket open and subscribed.
    Alive,
    /// Socket lost; the reaper will redial while the group is still needed.
    Dead,
    /// Drained; the reaper will drop the group.
    Cleanup,
}

/// Handle to a group's running socket task. Closing is a nudge, not an
/// abort: the task finishes in-flight work, sends a close frame and exits.
#[derive(Debug, Clone)]
pub(crate) struct SocketHandle {
    shutdown: mpsc::Sender<()>,
}

impl SocketHandle {
    pub(crate) fn new(shutdown: mpsc::Sender<()>) -> Self {
        Self { shutdown }
    }

    pub(crate) fn close(&self) {
        // A send error means the task already exited.
        let _ = self.shutdown.try_send(());
    }
}

/// A shard of subscription keys bound to at most one live websocket.
#[derive(Debug)]
pub(crate) struct Group {
    pub id: u64,
    pub keys: HashSet<String>,
    pub status: GroupStatus,
    /// Pinned groups stay alive even with no keys (subscribe-to-all).
    pub pinned: bool,
    pub socket: Option<SocketHandle>,
    /// Dial generation. Bumped on every (re)dial; a socket task whose
    /// generation no longer matches has been superseded and must not touch
    /// this group.
    pub generation: u64,
}

/// Read-only copy of a group for inspection and tests.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub id: u64,
    pub keys: Vec<String>,
    pub status: GroupStatus,
    pub pinned: bool,
}

/// What the heartbeat should do on its next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatTick {
    /// Group still wants this socket: send a ping.
    Send,
    /// Group drained: close the socket, group is marked for cleanup.
    Cleanup,
    /// Group removed or superseded: stop silently.
    Gone,
}

pub(crate) struct GroupRegistry {
    groups: Mutex<Vec<Group>>,
    next_id: AtomicU64,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Shard `new_keys` into groups. Keys already present anywhere are
    /// dropped; the rest fill the first non-cleanup, non-pinned group with
    /// room, or a new group. Returns the ids of groups that gained keys and
    /// have no live subscription, i.e. the ones that need a dial.
    pub async fn add_keys(&self, new_keys: &[String], max_per_group: usize) -> Vec<u64> {
        let mut groups = self.groups.lock().await;
        let mut touched = HashSet::new();
        for key in new_keys {
            if key.is_empty() {
                debug!("ignoring empty subscription key");
                continue;
            }
            if groups.iter().any(|g| g.keys.contains(key)) {
                continue;
            }
            let position = groups.iter().position(|g| {
                !g.pinned
                    && g.keys.len() < max_per_group
                    && matches!(
                        g.status,
                        GroupStatus::Alive | GroupStatus::Pending | GroupStatus::Dead
                    )
            });
            match position {
                Some(index) => {
                    let group = &mut groups[index];
                    group.keys.insert(key.clone());
                    touched.insert(group.id);
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let mut keys = HashSet::new();
                    keys.insert(key.clone());
                    groups.push(Group {
                        id,
                        keys,
                        status: GroupStatus::Pending,
                        pinned: false,
                        socket: None,
                        generation: 0,
                    });
                    touched.insert(id);
                }
            }
        }
        groups
            .iter()
            .filter(|g| touched.contains(&g.id) && g.status != GroupStatus::Alive)
            .map(|g| g.id)
            .collect()
    }

    /// Remove keys from whichever groups hold them. Emptied groups are left
    /// for the reaper so in-flight events drain naturally. Returns the keys
    /// actually removed.
    pub async fn remove_keys(&self, old_keys: &[String]) -> Vec<String> {
        let mut groups = self.groups.lock().await;
        let mut removed = Vec::new();
        for key in old_keys {
            for group in groups.iter_mut() {
                if group.keys.remove(key) {
                    removed.push(key.clone());
                    break;
                }
            }
        }
        removed
    }

    /// Ensure one pinned group exists (subscribe-to-all). Returns its id when
    /// a new group was created and needs a dial.
    pub async fn ensure_pinned_group(&self) -> Option<u64> {
        let mut groups = self.groups.lock().await;
        if groups.iter().any(|g| g.pinned) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        groups.push(Group {
            id,
            keys: HashSet::new(),
            status: GroupStatus::Pending,
            pinned: true,
            socket: None,
            generation: 0,
        });
        Some(id)
    }

    /// One reaper pass: drop groups that drained (returned for out-of-lock
    /// teardown) and flip dead-but-needed groups back to PENDING (returned
    /// for redial).
    pub async fn reconnect_and_cleanup(&self) -> (Vec<u64>, Vec<Group>) {
        let mut groups = self.groups.lock().await;
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(groups.len());
        for group in groups.drain(..) {
            if group.keys.is_empty() && !group.pinned {
                debug!(group_id = group.id, "dropping drained group");
                removed.push(group);
            } else {
                kept.push(group);
            }
        }
        *groups = kept;

        let mut redial = Vec::new();
        for group in groups.iter_mut() {
            if group.status == GroupStatus::Dead {
                group.status = GroupStatus::Pending;
                redial.push(group.id);
            }
        }
        (redial, removed)
    }

    /// Atomic swap for teardown: empties the registry and hands the groups
    /// back so sockets can be closed outside the lock.
    pub async fn clear_all(&self) -> Vec<Group> {
        let mut groups = self.groups.lock().await;
        mem::take(&mut *groups)
    }

    pub async fn find_group(&self, id: u64) -> Option<GroupSnapshot> {
        let groups = self.groups.lock().await;
        groups.iter().find(|g| g.id == id).map(snapshot_of)
    }

    pub async fn snapshot(&self) -> Vec<GroupSnapshot> {
        let groups = self.groups.lock().await;
        groups.iter().map(snapshot_of).collect()
    }

    pub async fn group_count(&self) -> usize {
        self.groups.lock().await.len()
    }

    pub async fn key_count(&self) -> usize {
        let groups = self.groups.lock().await;
        groups.iter().map(|g| g.keys.len()).sum()
    }

    /// Dispatch filter: which of `keys` are currently subscribed anywhere.
    /// A key held by more than one group violates the sharding invariant and
    /// is reported, not dropped.
    pub async fn filter_subscribed(&self, keys: &[&str]) -> HashSet<String> {
        let groups = self.groups.lock().await;
        let mut subscribed = HashSet::new();
        for key in keys {
            let holders = groups.iter().filter(|g| g.keys.contains(*key)).count();
            if holders > 1 {
                warn!(key, holders, "subscription key present in multiple groups");
            }
            if holders > 0 {
                subscribed.insert((*key).to_string());
            }
        }
        subscribed
    }

    /// True when any group is pinned (subscribe-to-all).
    pub async fn has_pinned(&self) -> bool {
        self.groups.lock().await.iter().any(|g| g.pinned)
    }

    /// Registers a new dial on the group: supersedes any previous socket,
    /// bumps the generation and sets PENDING. `Ok(None)` means the group
    /// drained and was marked for cleanup instead of dialing.
    pub async fn begin_dial(&self, id: u64, handle: SocketHandle) -> Result<Option<u64>> {
        let mut groups = self.groups.lock().await;
        let group = groups
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or(Error::GroupNotFound(id))?;
        if group.keys.is_empty() && !group.pinned {
            group.status = GroupStatus::Cleanup;
            return Ok(None);
        }
        if let Some(old) = group.socket.replace(handle) {
            old.close();
        }
        group.generation += 1;
        group.status = GroupStatus::Pending;
        Ok(Some(group.generation))
    }

    /// Keys to subscribe when the socket opens, re-checking that the group
    /// still wants it. `None` means don't subscribe and exit.
    pub async fn subscribe_keys(&self, id: u64, generation: u64) -> Option<Vec<String>> {
        let mut groups = self.groups.lock().await;
        let group = groups
            .iter_mut()
            .find(|g| g.id == id && g.generation == generation)?;
        if group.keys.is_empty() && !group.pinned {
            group.status = GroupStatus::Cleanup;
            return None;
        }
        let mut keys: Vec<String> = group.keys.iter().cloned().collect();
        keys.sort();
        Some(keys)
    }

    /// Generation-guarded status update. False when the group is gone or the
    /// caller has been superseded.
    pub async fn set_status(&self, id: u64, generation: u64, status: GroupStatus) -> bool {
        let mut groups = self.groups.lock().await;
        match groups
            .iter_mut()
            .find(|g| g.id == id && g.generation == generation)
        {
            Some(group) => {
                group.status = status;
                true
            }
            None => false,
        }
    }

    /// Key set for the receive-time filter. `None` means the group was just
    /// removed (or the socket superseded) and the frame should be dropped.
    pub async fn current_keys(&self, id: u64, generation: u64) -> Option<HashSet<String>> {
        let groups = self.groups.lock().await;
        groups
            .iter()
            .find(|g| g.id == id && g.generation == generation)
            .map(|g| g.keys.clone())
    }

    /// Classify the group for the next heartbeat tick.
    pub async fn heartbeat_check(&self, id: u64, generation: u64) -> HeartbeatTick {
        let mut groups = self.groups.lock().await;
        let Some(group) = groups
            .iter_mut()
            .find(|g| g.id == id && g.generation == generation)
        else {
            return HeartbeatTick::Gone;
        };
        if group.keys.is_empty() && !group.pinned {
            group.status = GroupStatus::Cleanup;
            HeartbeatTick::Cleanup
        } else {
            HeartbeatTick::Send
        }
    }
}

fn snapshot_of(group: &Group) -> GroupSnapshot {
    let mut keys: Vec<String> = group.keys.iter().cloned().collect();
    keys.sort();
    GroupSnapshot {
        id: group.id,
        keys,
        status: group.status,
        pinned: group.pinned,
    }
}
