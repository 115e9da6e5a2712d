//! Grace period (C9): post-restart reclaim window (RFC 8881 §8.4.2).

use crate::error::{NfsStat4, StateResult};
use crate::ids::ClientId;
use std::collections::HashSet;
use std::time::{Duration, SystemTime};

/// Tracks the reclaim window after a restart.
pub struct GracePeriod {
    active: bool,
    duration: Duration,
    started_at: Option<SystemTime>,
    expected: HashSet<ClientId>,
    reclaimed: HashSet<ClientId>,
    reclaim_complete: HashSet<ClientId>,
}

impl Default for GracePeriod {
    fn default() -> Self {
        Self {
            active: false,
            duration: Duration::from_secs(90),
            started_at: None,
            expected: HashSet::new(),
            reclaimed: HashSet::new(),
            reclaim_complete: HashSet::new(),
        }
    }
}

impl GracePeriod {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts grace from a snapshot's expected-client set. Skipped entirely
    /// if the set is empty (§4.9 "If the set is empty, grace is skipped
    /// entirely").
    pub fn start(&mut self, expected: HashSet<ClientId>, duration: Duration, now: SystemTime) {
        if expected.is_empty() {
            self.active = false;
            self.started_at = None;
            return;
        }
        self.active = true;
        self.duration = duration;
        self.started_at = Some(now);
        self.expected = expected;
        self.reclaimed.clear();
        self.reclaim_complete.clear();
    }

    pub fn is_active(&self, now: SystemTime) -> bool {
        match (self.active, self.started_at) {
            (true, Some(start)) => now < start + self.duration,
            _ => false,
        }
    }

    /// `CheckGraceForNewState`: `GRACE` while active (callers must use
    /// `CLAIM_PREVIOUS` to make progress), `NO_GRACE` for a reclaim attempt
    /// made outside the window, `Ok(())` otherwise.
    pub fn check_for_new_state(&self, now: SystemTime, is_reclaim: bool) -> StateResult<()> {
        if self.is_active(now) {
            if is_reclaim {
                Ok(())
            } else {
                Err(NfsStat4::Grace)
            }
        } else if is_reclaim {
            Err(NfsStat4::NoGrace)
        } else {
            Ok(())
        }
    }

    /// Marks a client as having reclaimed its state. If this was the last
    /// expected client, ends grace early and returns `true` so the caller
    /// fires the registered `onGraceEnd` callback exactly once, outside the
    /// lock (§4.9).
    pub fn mark_reclaimed(&mut self, client: ClientId) -> bool {
        if !self.expected.contains(&client) {
            return false;
        }
        self.reclaimed.insert(client);
        if self.active && self.reclaimed == self.expected {
            self.active = false;
            return true;
        }
        false
    }

    /// `RECLAIM_COMPLETE`: idempotent-erroring, `COMPLETE_ALREADY` on a
    /// second attempt per client. Also ends grace early once every expected
    /// client has called it, returning `true` in that case (§4.9).
    pub fn reclaim_complete(&mut self, client: ClientId) -> StateResult<bool> {
        if !self.reclaim_complete.insert(client) {
            return Err(NfsStat4::CompleteAlready);
        }
        if self.active && !self.expected.is_empty() && self.reclaim_complete == self.expected {
            self.active = false;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn force_end(&mut self) {
        self.active = false;
    }

    pub fn status(&self, now: SystemTime) -> bool {
        self.is_active(now)
    }
}
