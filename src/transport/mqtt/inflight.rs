//! In-flight publish registry
//!
//! Tracks QoS publishes that were handed to the transport but not yet
//! acknowledged by the broker. Entries whose deadline passes are handed back
//! by [`InFlightRegistry::sweep`] for retransmission, with no retry ceiling:
//! a publish stays in flight until it is acknowledged or the registry is
//! cleared. A message id is tracked at most once.

use std::collections::TryReserveError;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Time a publish may stay unacknowledged before it is resent
pub const RESEND_INTERVAL: Duration = Duration::from_millis(1200);

/// One outstanding QoS publish
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPublish {
    pub topic: String,
    pub payload: String,
    pub message_id: u16,
    pub deadline: Instant,
    pub retry_count: u32,
}

/// Unacknowledged publishes keyed by message id.
///
/// Entry order is irrelevant, so removal swaps the last entry into the hole.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: Vec<PendingPublish>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new publish with a deadline of now + [`RESEND_INTERVAL`].
    ///
    /// Returns `false` if the entry could not be allocated, or if `message_id`
    /// is already pending; the existing entry is never replaced.
    pub fn add(&mut self, topic: &str, message_id: u16, payload: &str) -> bool {
        self.add_at(topic, message_id, payload, Instant::now())
    }

    /// [`add`](Self::add) with an explicit clock
    pub fn add_at(&mut self, topic: &str, message_id: u16, payload: &str, now: Instant) -> bool {
        let entry = match try_pending(topic, message_id, payload, now + RESEND_INTERVAL) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(message_id, "MQTT publish not tracked for resend: {}", e);
                return false;
            }
        };

        if self.contains(message_id) {
            warn!(
                message_id,
                "MQTT message id still in flight, publish not tracked for resend"
            );
            return false;
        }

        if let Err(e) = self.entries.try_reserve(1) {
            warn!(message_id, "MQTT publish not tracked for resend: {}", e);
            return false;
        }
        self.entries.push(entry);
        debug!("MQTT publishing: {} ({} inflight)", message_id, self.entries.len());
        true
    }

    /// Remove the entry for `message_id`; `false` if nothing was pending under it
    pub fn acknowledge(&mut self, message_id: u16) -> bool {
        match self.position(message_id) {
            Some(index) => {
                self.entries.swap_remove(index);
                debug!(
                    "MQTT acknowledge: {} ({} inflight)",
                    message_id,
                    self.entries.len()
                );
                true
            }
            None => false,
        }
    }

    /// Collect every entry whose deadline has passed.
    ///
    /// Each returned entry has its retry count bumped and its deadline pushed
    /// to `now + RESEND_INTERVAL` before it is handed out.
    pub fn sweep(&mut self, now: Instant) -> Vec<&PendingPublish> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| {
                entry.retry_count += 1;
                entry.deadline = now + RESEND_INTERVAL;
                let entry: &PendingPublish = entry;
                entry
            })
            .collect()
    }

    /// Ids of the entries whose deadline has passed, left untouched
    pub fn due(&self, now: Instant) -> Vec<u16> {
        self.entries
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.message_id)
            .collect()
    }

    /// Record one retransmission of `message_id`: bump its retry count and
    /// push its deadline to `now + RESEND_INTERVAL`.
    pub fn mark_resent(&mut self, message_id: u16, now: Instant) -> Option<&PendingPublish> {
        let entry = self.entries.iter_mut().find(|e| e.message_id == message_id)?;
        entry.retry_count += 1;
        entry.deadline = now + RESEND_INTERVAL;
        Some(entry)
    }

    /// Drop every entry without attempting delivery
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!("MQTT dropping {} inflight publishes", self.entries.len());
        }
        self.entries.clear();
    }

    pub fn get(&self, message_id: u16) -> Option<&PendingPublish> {
        self.entries.iter().find(|e| e.message_id == message_id)
    }

    pub fn contains(&self, message_id: u16) -> bool {
        self.position(message_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingPublish> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, message_id: u16) -> Option<usize> {
        self.entries.iter().position(|e| e.message_id == message_id)
    }
}

fn try_pending(
    topic: &str,
    message_id: u16,
    payload: &str,
    deadline: Instant,
) -> Result<PendingPublish, TryReserveError> {
    Ok(PendingPublish {
        topic: try_clone_str(topic)?,
        payload: try_clone_str(payload)?,
        message_id,
        deadline,
        retry_count: 0,
    })
}

fn try_clone_str(s: &str) -> Result<String, TryReserveError> {
    let mut owned = String::new();
    owned.try_reserve_exact(s.len())?;
    owned.push_str(s);
    Ok(owned)
}
