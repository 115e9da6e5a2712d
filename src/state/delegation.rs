//! Delegation engine (C6): grant policy, conflict detection, recall, and
//! revocation (RFC 8881 §10.2, §10.4).

use crate::error::StateResult;
use crate::ids::{ClientId, FileHandle, StateId, StateIdAllocator, StateKind};
use moka::sync::Cache;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// One accumulated directory change (§4.6 "Directory delegations").
#[derive(Debug, Clone)]
pub enum DirChangeEvent {
    AddEntry { name: Vec<u8> },
    RemoveEntry { name: Vec<u8> },
    RenameEntry { from: Vec<u8>, to: Vec<u8> },
    ChildAttrChange { name: Vec<u8> },
    DirAttrChange,
}

/// Pending `CB_NOTIFY` batch for one directory delegation. Guarded by its
/// own leaf lock (§5): the batch must be flushable without holding the
/// primary state-manager lock.
#[derive(Debug, Default)]
pub struct DirNotifyBatch {
    pending: Mutex<Vec<DirChangeEvent>>,
}

impl DirNotifyBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a change, unless `originating_client` is the delegation's
    /// own holder (self-caused changes are suppressed).
    pub fn record(&self, originating_client: ClientId, holder: ClientId, event: DirChangeEvent) {
        if originating_client == holder {
            return;
        }
        self.pending.lock().unwrap().push(event);
    }

    /// Drains the batch for a `CB_NOTIFY` flush; empty after this call.
    pub fn drain(&self) -> Vec<DirChangeEvent> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationType {
    Read,
    Write,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallTransport {
    BackChannel,
    DialOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecallStatus {
    NotRecalled,
    RecallSent { deadline: SystemTime },
}

#[derive(Debug)]
pub struct Delegation {
    pub stateid: StateId,
    pub client_id: ClientId,
    pub file: FileHandle,
    pub kind: DelegationType,
    recall: RecallStatus,
    pub revoked: bool,
    /// `NOTIFY4_*` bitmask the holder asked to be told about. Only
    /// meaningful for `DelegationType::Directory`.
    pub notify_mask: u32,
    /// Cookie verifier handed back with the delegation, echoed in
    /// `CB_NOTIFY` so the holder can tell it apart from a stale batch.
    pub cookie_verifier: [u8; 8],
    /// Accumulated, not-yet-flushed directory changes. Present (but unused)
    /// on non-directory delegations to keep the struct uniform.
    pub batch: DirNotifyBatch,
    next_flush_deadline: SystemTime,
}

/// Tracks delegations, the recently-recalled anti-storm cache, and enforces
/// `maxDelegations`. The recently-recalled cache uses `moka`'s sync `Cache`
/// with a fixed TTL and lazy (read-triggered) eviction, matching the
/// teacher's moka usage elsewhere for short-lived entries.
pub struct DelegationTable {
    by_other: HashMap<[u8; 12], Delegation>,
    by_file: HashMap<FileHandle, Vec<[u8; 12]>>,
    recently_recalled: Cache<FileHandle, ()>,
    max_delegations: usize,
    dir_notify_batch_interval: Duration,
}

/// One directory delegation's drained batch, ready for a `CB_NOTIFY` flush.
pub struct DueNotification {
    pub client_id: ClientId,
    pub stateid: StateId,
    pub events: Vec<DirChangeEvent>,
}

impl DelegationTable {
    pub fn new(recently_recalled_ttl: Duration, max_delegations: usize, dir_notify_batch_interval: Duration) -> Self {
        Self {
            by_other: HashMap::new(),
            by_file: HashMap::new(),
            recently_recalled: Cache::builder().time_to_live(recently_recalled_ttl).build(),
            max_delegations,
            dir_notify_batch_interval,
        }
    }

    fn non_revoked_count(&self) -> usize {
        self.by_other.values().filter(|d| !d.revoked).count()
    }

    fn existing_on_file(&self, file: &FileHandle) -> Vec<&Delegation> {
        self.by_file
            .get(file)
            .map(|ids| ids.iter().filter_map(|o| self.by_other.get(o)).filter(|d| !d.revoked).collect())
            .unwrap_or_default()
    }

    /// Decides whether to grant a delegation for a just-completed OPEN
    /// (§4.6 "Grant policy"). Returns `None` when the policy says no —
    /// this is not an error, the OPEN still succeeds without a delegation.
    #[allow(clippy::too_many_arguments)]
    pub fn try_grant(
        &mut self,
        alloc: &StateIdAllocator,
        delegations_enabled: bool,
        client_id: ClientId,
        cb_path_up: bool,
        file: FileHandle,
        is_write_open: bool,
        other_clients_have_opens: bool,
    ) -> Option<StateId> {
        if !delegations_enabled || !cb_path_up || other_clients_have_opens {
            return None;
        }
        if self.recently_recalled.contains_key(&file) {
            return None;
        }
        if !self.existing_on_file(&file).is_empty() {
            return None;
        }
        if self.non_revoked_count() >= self.max_delegations {
            return None;
        }

        let kind = if is_write_open { DelegationType::Write } else { DelegationType::Read };
        let stateid = alloc.alloc(StateKind::Delegation);
        let deleg = Delegation {
            stateid,
            client_id,
            file: file.clone(),
            kind,
            recall: RecallStatus::NotRecalled,
            revoked: false,
            notify_mask: 0,
            cookie_verifier: [0; 8],
            batch: DirNotifyBatch::new(),
            next_flush_deadline: SystemTime::UNIX_EPOCH,
        };
        self.by_other.insert(stateid.other, deleg);
        self.by_file.entry(file).or_default().push(stateid.other);
        Some(stateid)
    }

    /// Grants a directory delegation (§4.6 "Directory delegations"): unlike
    /// `try_grant`, not gated on conflicting opens, since it observes
    /// directory-entry changes rather than file data.
    pub fn grant_directory_delegation(
        &mut self,
        alloc: &StateIdAllocator,
        client_id: ClientId,
        file: FileHandle,
        notify_mask: u32,
        cookie_verifier: [u8; 8],
        now: SystemTime,
    ) -> StateId {
        let stateid = alloc.alloc(StateKind::Delegation);
        let deleg = Delegation {
            stateid,
            client_id,
            file: file.clone(),
            kind: DelegationType::Directory,
            recall: RecallStatus::NotRecalled,
            revoked: false,
            notify_mask,
            cookie_verifier,
            batch: DirNotifyBatch::new(),
            next_flush_deadline: now + self.dir_notify_batch_interval,
        };
        self.by_other.insert(stateid.other, deleg);
        self.by_file.entry(file).or_default().push(stateid.other);
        stateid
    }

    /// Accumulates a directory change into every directory delegation held
    /// on `file`, suppressing the batch entry for the client that caused it.
    pub fn record_dir_change(&self, file: &FileHandle, originating_client: ClientId, event: DirChangeEvent) {
        let Some(ids) = self.by_file.get(file) else { return };
        for other in ids {
            let Some(deleg) = self.by_other.get(other) else { continue };
            if deleg.revoked || deleg.kind != DelegationType::Directory {
                continue;
            }
            deleg.batch.record(originating_client, deleg.client_id, event.clone());
        }
    }

    /// Drains every directory delegation's batch whose flush deadline has
    /// passed, resetting the deadline for the next round (§4.6 "flushed
    /// when the batch timer fires or the delegation is returned").
    pub fn drain_due_notifications(&mut self, now: SystemTime) -> Vec<DueNotification> {
        let mut due = Vec::new();
        for deleg in self.by_other.values_mut() {
            if deleg.revoked || deleg.kind != DelegationType::Directory || now < deleg.next_flush_deadline {
                continue;
            }
            deleg.next_flush_deadline = now + self.dir_notify_batch_interval;
            if deleg.batch.is_empty() {
                continue;
            }
            due.push(DueNotification { client_id: deleg.client_id, stateid: deleg.stateid, events: deleg.batch.drain() });
        }
        due
    }

    /// Scans delegations on `file` held by clients other than `requester`
    /// for a conflict with the requested access (§4.6 "Conflict
    /// detection"). On conflict the delegation is marked recall-sent and the
    /// transport to use for the recall is returned to the caller, which
    /// must reply `DELAY` to the OPEN.
    pub fn check_conflict(
        &mut self,
        file: &FileHandle,
        requester: ClientId,
        requested_write: bool,
        now: SystemTime,
        holder_has_back_channel: impl Fn(ClientId) -> bool,
        revocation_timeout: Duration,
    ) -> Option<(StateId, ClientId, RecallTransport)> {
        let ids = self.by_file.get(file)?.clone();
        for other in ids {
            let deleg = self.by_other.get_mut(&other)?;
            if deleg.revoked || deleg.client_id == requester || deleg.kind == DelegationType::Directory {
                continue;
            }
            let conflicts = match deleg.kind {
                DelegationType::Write => true,
                DelegationType::Read => requested_write,
                DelegationType::Directory => false,
            };
            if !conflicts {
                continue;
            }
            deleg.recall = RecallStatus::RecallSent { deadline: now + revocation_timeout };
            let transport = if holder_has_back_channel(deleg.client_id) {
                RecallTransport::BackChannel
            } else {
                RecallTransport::DialOut
            };
            return Some((deleg.stateid, deleg.client_id, transport));
        }
        None
    }

    /// Starts (or restarts with a shortened window) the revocation timer
    /// after a recall attempt.
    pub fn mark_recall_outcome(&mut self, other: &[u8; 12], now: SystemTime, send_succeeded: bool, full_lease: Duration, shortened: Duration) {
        if let Some(deleg) = self.by_other.get_mut(other) {
            let timeout = if send_succeeded { full_lease } else { shortened };
            deleg.recall = RecallStatus::RecallSent { deadline: now + timeout };
        }
    }

    /// Revokes every delegation whose recall deadline has passed.
    pub fn revoke_expired(&mut self, now: SystemTime) -> Vec<StateId> {
        let mut revoked = Vec::new();
        for deleg in self.by_other.values_mut() {
            if deleg.revoked {
                continue;
            }
            if let RecallStatus::RecallSent { deadline } = deleg.recall {
                if now >= deadline {
                    deleg.revoked = true;
                    self.recently_recalled.insert(deleg.file.clone(), ());
                    revoked.push(deleg.stateid);
                }
            }
        }
        revoked
    }

    /// Voluntary DELEGRETURN. Returning an already-revoked delegation
    /// succeeds idempotently. Any directory delegation's unflushed batch is
    /// drained and handed back so the caller can flush it via `CB_NOTIFY`
    /// before the delegation disappears (§4.6).
    pub fn return_delegation(&mut self, other: &[u8; 12]) -> StateResult<Option<DueNotification>> {
        let deleg = match self.by_other.get(other) {
            Some(d) => d,
            None => return Ok(None),
        };
        let due = (!deleg.revoked && deleg.kind == DelegationType::Directory && !deleg.batch.is_empty()).then(|| {
            DueNotification { client_id: deleg.client_id, stateid: deleg.stateid, events: deleg.batch.drain() }
        });
        if deleg.revoked {
            self.by_other.remove(other);
            return Ok(None);
        }
        let file = deleg.file.clone();
        self.by_other.remove(other);
        if let Some(list) = self.by_file.get_mut(&file) {
            list.retain(|o| o != other);
            if list.is_empty() {
                self.by_file.remove(&file);
            }
        }
        Ok(due)
    }

    pub fn get(&self, other: &[u8; 12]) -> Option<&Delegation> {
        self.by_other.get(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(b: &[u8]) -> FileHandle {
        FileHandle(b.to_vec())
    }

    #[test]
    fn grant_denied_when_disabled() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        let granted = table.try_grant(&alloc, false, ClientId(1), true, file(b"f"), true, false);
        assert!(granted.is_none());
    }

    #[test]
    fn grant_denied_without_callback_path() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        let granted = table.try_grant(&alloc, true, ClientId(1), false, file(b"f"), true, false);
        assert!(granted.is_none());
    }

    #[test]
    fn write_open_grants_write_delegation() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        let sid = table.try_grant(&alloc, true, ClientId(1), true, file(b"f"), true, false).unwrap();
        assert_eq!(table.get(&sid.other).unwrap().kind, DelegationType::Write);
    }

    #[test]
    fn max_delegations_cap_enforced() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 1, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        table.try_grant(&alloc, true, ClientId(1), true, file(b"f1"), false, false).unwrap();
        let second = table.try_grant(&alloc, true, ClientId(2), true, file(b"f2"), false, false);
        assert!(second.is_none());
    }

    #[test]
    fn write_deleg_conflicts_with_any_other_access() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        table.try_grant(&alloc, true, ClientId(1), true, file(b"f"), true, false).unwrap();
        let t0 = SystemTime::UNIX_EPOCH;
        let conflict = table.check_conflict(&file(b"f"), ClientId(2), false, t0, |_| true, Duration::from_secs(90));
        assert!(conflict.is_some());
    }

    #[test]
    fn read_deleg_conflicts_only_with_write_access() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        table.try_grant(&alloc, true, ClientId(1), true, file(b"f"), false, false).unwrap();
        let t0 = SystemTime::UNIX_EPOCH;
        assert!(table.check_conflict(&file(b"f"), ClientId(2), false, t0, |_| true, Duration::from_secs(90)).is_none());
        assert!(table.check_conflict(&file(b"f"), ClientId(2), true, t0, |_| true, Duration::from_secs(90)).is_some());
    }

    #[test]
    fn recall_timeout_revokes_and_marks_recently_recalled() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        let sid = table.try_grant(&alloc, true, ClientId(1), true, file(b"f"), true, false).unwrap();
        let t0 = SystemTime::UNIX_EPOCH;
        table.mark_recall_outcome(&sid.other, t0, true, Duration::from_secs(90), Duration::from_secs(5));
        assert!(table.revoke_expired(t0 + Duration::from_secs(89)).is_empty());
        let revoked = table.revoke_expired(t0 + Duration::from_secs(90));
        assert_eq!(revoked, vec![sid]);
        assert!(table.get(&sid.other).unwrap().revoked);
    }

    #[test]
    fn dir_notify_batch_suppresses_self_caused_changes() {
        let batch = DirNotifyBatch::new();
        batch.record(ClientId(1), ClientId(1), DirChangeEvent::DirAttrChange);
        assert!(batch.is_empty());
        batch.record(ClientId(2), ClientId(1), DirChangeEvent::AddEntry { name: b"x".to_vec() });
        assert_eq!(batch.drain().len(), 1);
        assert!(batch.is_empty());
    }

    #[test]
    fn directory_delegation_accumulates_and_flushes_on_timer() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        let t0 = SystemTime::UNIX_EPOCH;
        let sid = table.grant_directory_delegation(&alloc, ClientId(1), file(b"dir"), 0xF, [9; 8], t0);

        // The holder's own change is suppressed; another client's is kept.
        table.record_dir_change(&file(b"dir"), ClientId(1), DirChangeEvent::AddEntry { name: b"mine".to_vec() });
        table.record_dir_change(&file(b"dir"), ClientId(2), DirChangeEvent::AddEntry { name: b"theirs".to_vec() });

        // Before the batch interval elapses, nothing is due.
        assert!(table.drain_due_notifications(t0 + Duration::from_millis(500)).is_empty());

        let due = table.drain_due_notifications(t0 + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].client_id, ClientId(1));
        assert_eq!(due[0].stateid, sid);
        assert!(matches!(&due[0].events[..], [DirChangeEvent::AddEntry { name }] if name == b"theirs"));

        // Drained; nothing left until the next change and deadline.
        assert!(table.drain_due_notifications(t0 + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn directory_delegation_never_conflicts_with_opens() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        table.grant_directory_delegation(&alloc, ClientId(1), file(b"dir"), 0, [0; 8], SystemTime::UNIX_EPOCH);
        let conflict = table.check_conflict(&file(b"dir"), ClientId(2), true, SystemTime::UNIX_EPOCH, |_| true, Duration::from_secs(90));
        assert!(conflict.is_none());
    }

    #[test]
    fn returning_directory_delegation_flushes_pending_batch() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        let sid = table.grant_directory_delegation(&alloc, ClientId(1), file(b"dir"), 0, [0; 8], SystemTime::UNIX_EPOCH);
        table.record_dir_change(&file(b"dir"), ClientId(2), DirChangeEvent::DirAttrChange);
        let due = table.return_delegation(&sid.other).unwrap().expect("pending batch should flush on return");
        assert_eq!(due.stateid, sid);
        assert_eq!(due.events.len(), 1);
    }

    #[test]
    fn returning_revoked_delegation_is_idempotent() {
        let mut table = DelegationTable::new(Duration::from_secs(30), 100, Duration::from_secs(1));
        let alloc = StateIdAllocator::new(1);
        let sid = table.try_grant(&alloc, true, ClientId(1), true, file(b"f"), true, false).unwrap();
        let t0 = SystemTime::UNIX_EPOCH;
        table.mark_recall_outcome(&sid.other, t0, true, Duration::from_secs(1), Duration::from_secs(1));
        table.revoke_expired(t0 + Duration::from_secs(1));
        table.return_delegation(&sid.other).unwrap();
        table.return_delegation(&sid.other).unwrap();
    }
}
