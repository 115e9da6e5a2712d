//! State manager: wires the client registry, lease engine, sessions,
//! connection binder, open/lock state, delegation engine, and grace period
//! behind one primary lock (§5).

pub mod client;
pub mod connection;
pub mod delegation;
pub mod grace;
pub mod lease;
pub mod lock;
pub mod open;
pub mod session;

use crate::callback::backchannel::BackChannelSender;
use crate::callback::dialout;
use crate::callback::rpc::{self, CbOp};
use crate::error::{NfsStat4, StateResult};
use crate::ids::{
    ClientId, ClientIdAllocator, FileHandle, OwnerId, SessionId, StateId, StateIdAllocator, StateKind,
};
use crate::traits::{Clock, Rng};
use client::{CallbackDescriptor, ClientRegistry};
use connection::{ConnectionBinder, GrantedDirection, RequestedDirection};
use delegation::{DelegationTable, DirChangeEvent, DueNotification, RecallTransport};
use grace::GracePeriod;
use lease::LeaseTable;
use lock::{LockConflict, LockRange, LockTable};
use open::{OpenTable, SeqidOutcome};
use session::{ChannelAttrs, Session};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use crate::config::StateManagerConfig;

/// Everything guarded by the single primary lock (§5 "One primary
/// state-manager lock (read/write) guards the top-level maps").
struct Inner {
    clients: ClientRegistry,
    leases: LeaseTable,
    sessions: std::collections::HashMap<SessionId, Session>,
    connections: ConnectionBinder,
    opens: OpenTable,
    locks: LockTable,
    delegations: DelegationTable,
    grace: GracePeriod,
}

/// The NFSv4 state manager core.
pub struct StateManager {
    config: StateManagerConfig,
    client_alloc: ClientIdAllocator,
    stateid_alloc: StateIdAllocator,
    clock: Box<dyn Clock>,
    rng: Box<dyn Rng>,
    inner: RwLock<Inner>,
    /// Live v4.1 back-channel senders, keyed by client (§4.6 recall
    /// transport selection, §6 `CB_NOTIFY` dispatch). Never held alongside
    /// the primary lock during I/O.
    back_channels: Mutex<HashMap<ClientId, Arc<BackChannelSender>>>,
    /// Fired exactly once, outside the primary lock, the moment grace ends
    /// early (§4.9 "onGraceEnd").
    on_grace_end: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl StateManager {
    pub fn new(
        config: StateManagerConfig,
        boot_epoch: u32,
        clock: Box<dyn Clock>,
        rng: Box<dyn Rng>,
    ) -> Self {
        let delegations =
            DelegationTable::new(config.recently_recalled_ttl, config.max_delegations, config.dir_notify_batch_interval);
        Self {
            client_alloc: ClientIdAllocator::new(boot_epoch),
            stateid_alloc: StateIdAllocator::new(boot_epoch),
            inner: RwLock::new(Inner {
                clients: ClientRegistry::new(),
                leases: LeaseTable::new(),
                sessions: std::collections::HashMap::new(),
                connections: ConnectionBinder::new(),
                opens: OpenTable::new(),
                locks: LockTable::new(),
                delegations,
                grace: GracePeriod::new(),
            }),
            config,
            clock,
            rng,
            back_channels: Mutex::new(HashMap::new()),
            on_grace_end: Mutex::new(None),
        }
    }

    /// Registers the callback invoked exactly once, outside the primary
    /// lock, the moment grace ends (whether by early-exit or timer-driven
    /// polling through the caller's own loop).
    pub fn set_on_grace_end(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.on_grace_end.lock().unwrap() = Some(callback);
    }

    fn fire_grace_end(&self) {
        if let Some(callback) = self.on_grace_end.lock().unwrap().as_ref() {
            callback();
        }
    }

    /// Registers a live v4.1 back-channel sender for `client`, used for
    /// delegation recalls and directory-delegation `CB_NOTIFY` dispatch.
    pub fn register_back_channel(&self, client: ClientId, sender: Arc<BackChannelSender>) {
        self.back_channels.lock().unwrap().insert(client, sender);
    }

    pub fn unregister_back_channel(&self, client: ClientId) {
        self.back_channels.lock().unwrap().remove(&client);
    }

    /// Dispatches a `CB_RECALL` for a conflicting delegation (§4.6 "an
    /// asynchronous recall is dispatched"): through the holder's live
    /// back-channel sender (C7) when one is registered, otherwise a
    /// best-effort v4.0 dial-out (C8). Called with the primary lock already
    /// released.
    fn dispatch_recall(&self, stateid: StateId, holder: ClientId, transport: RecallTransport, file: FileHandle) {
        let body = rpc::encode_cb_recall(&stateid, false, &file);
        match transport {
            RecallTransport::BackChannel => {
                let sender = self.back_channels.lock().unwrap().get(&holder).cloned();
                if let Some(sender) = sender {
                    let _ = sender.try_enqueue(CbOp { opcode: rpc::CB_RECALL_OPCODE, body });
                }
            }
            RecallTransport::DialOut => {
                let callback = {
                    let inner = self.inner.read().unwrap();
                    inner.clients.get(holder).map(|c| c.callback.clone())
                };
                let Some(callback) = callback else { return };
                let Some(addr) = dialout::parse_uaddr(&callback.net_id, &callback.uaddr) else { return };
                let program = callback.program;
                let deadline = self.config.dialout_timeout;
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = dialout::send_dialout_cb_compound(
                            addr,
                            program,
                            1,
                            &[CbOp { opcode: rpc::CB_RECALL_OPCODE, body }],
                            deadline,
                        )
                        .await;
                    });
                }
            }
        }
    }

    /// Dispatches drained directory-delegation batches as `CB_NOTIFY`,
    /// through the holder's back channel only — directory delegations are
    /// a v4.1-only feature and have no dial-out fallback. Called with the
    /// primary lock already released.
    fn dispatch_notifications(&self, due: Vec<DueNotification>) {
        for notif in due {
            let sender = self.back_channels.lock().unwrap().get(&notif.client_id).cloned();
            if let Some(sender) = sender {
                let body = rpc::encode_cb_notify(&notif.events);
                let _ = sender.try_enqueue(CbOp { opcode: rpc::CB_NOTIFY_OPCODE, body });
            }
        }
    }

    fn now(&self) -> SystemTime {
        self.clock.now()
    }

    // ---- C1 Client Registry / C2 Lease Engine ----

    pub fn set_client_id(&self, name: Vec<u8>, boot_verifier: [u8; 8]) -> ClientId {
        let mut inner = self.inner.write().unwrap();
        inner
            .clients
            .set_client_id(&self.client_alloc, || self.rng.verifier(), name, boot_verifier)
    }

    pub fn confirm_client_id(&self, id: ClientId, verifier: [u8; 8]) -> StateResult<()> {
        let now = self.now();
        let mut inner = self.inner.write().unwrap();
        let evicted = inner.clients.confirm_client_id(id, verifier)?;
        if let Some(old) = evicted {
            Self::drain_client_locked(&mut inner, old);
        }
        inner.leases.renew(id, now, self.config.lease_duration);
        Ok(())
    }

    pub fn exchange_id(&self, name: Vec<u8>, boot_verifier: [u8; 8]) -> ClientId {
        let now = self.now();
        let mut inner = self.inner.write().unwrap();
        let (id, superseded) =
            inner.clients.exchange_id(&self.client_alloc, || self.rng.verifier(), name, boot_verifier);
        inner.leases.renew(id, now, self.config.lease_duration);
        let _ = superseded; // scheduled for natural lease expiry, not evicted immediately
        id
    }

    pub fn renew(&self, client: ClientId) -> StateResult<()> {
        let now = self.now();
        let mut inner = self.inner.write().unwrap();
        if inner.clients.get(client).is_none() {
            return Err(NfsStat4::StaleClientId);
        }
        inner.leases.renew(client, now, self.config.lease_duration);
        Ok(())
    }

    pub fn set_callback(&self, client: ClientId, callback: CallbackDescriptor) -> StateResult<()> {
        let mut inner = self.inner.write().unwrap();
        let record = inner.clients.get_mut(client).ok_or(NfsStat4::StaleClientId)?;
        record.callback = callback;
        Ok(())
    }

    pub fn set_cb_path_up(&self, client: ClientId, up: bool) -> StateResult<()> {
        let mut inner = self.inner.write().unwrap();
        let record = inner.clients.get_mut(client).ok_or(NfsStat4::StaleClientId)?;
        record.cb_path_up = up;
        Ok(())
    }

    pub fn destroy_client_id(&self, client: ClientId) -> StateResult<()> {
        let mut inner = self.inner.write().unwrap();
        Self::drain_client_locked(&mut inner, client);
        Ok(())
    }

    fn drain_client_locked(inner: &mut Inner, client: ClientId) {
        inner.leases.remove(client);
        inner.clients.remove(client);
        let dead_sessions: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.client_id == client)
            .map(|(id, _)| *id)
            .collect();
        for sid in dead_sessions {
            inner.sessions.remove(&sid);
            inner.connections.destroy_session(sid);
        }
    }

    pub fn expire_leases(&self) -> Vec<ClientId> {
        let now = self.now();
        let expired = {
            let inner = self.inner.read().unwrap();
            inner.leases.expired_clients(now)
        };
        let mut inner = self.inner.write().unwrap();
        for client in &expired {
            Self::drain_client_locked(&mut inner, *client);
        }
        expired
    }

    // ---- C3 Session & Slot Table ----

    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &self,
        client_id: ClientId,
        seqid: u32,
        fore_attrs: ChannelAttrs,
        back_attrs: Option<ChannelAttrs>,
        callback_program: u32,
        session_id: SessionId,
    ) -> StateResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.clients.consume_session_seqid(client_id, seqid)?;
        let session = Session::new(
            session_id,
            client_id,
            self.config.max_slots_per_table,
            fore_attrs,
            back_attrs,
            callback_program,
            seqid,
        );
        inner.sessions.insert(session_id, session);
        Ok(())
    }

    pub fn destroy_session(&self, session_id: SessionId) -> StateResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.sessions.remove(&session_id).ok_or(NfsStat4::BadSession)?;
        inner.connections.destroy_session(session_id);
        Ok(())
    }

    pub fn sequence(
        &self,
        session_id: SessionId,
        slot_id: u32,
        seqid: u32,
    ) -> StateResult<session::SlotOutcome> {
        let now = self.now();
        let mut inner = self.inner.write().unwrap();
        let session = inner.sessions.get(&session_id).ok_or(NfsStat4::BadSession)?;
        let outcome = session.fore_channel.validate_sequence(slot_id, seqid)?;
        let client_id = session.client_id;
        inner.leases.renew(client_id, now, self.config.lease_duration);
        Ok(outcome)
    }

    pub fn complete_sequence(
        &self,
        session_id: SessionId,
        slot_id: u32,
        new_seqid: u32,
        cache_this: bool,
        reply: &[u8],
    ) -> StateResult<()> {
        let inner = self.inner.read().unwrap();
        let session = inner.sessions.get(&session_id).ok_or(NfsStat4::BadSession)?;
        session.fore_channel.complete_slot_request(slot_id, new_seqid, cache_this, reply)
    }

    // ---- C4 Connection Binder ----

    pub fn bind_conn_to_session(
        &self,
        session_id: SessionId,
        connection: u64,
        requested: RequestedDirection,
    ) -> StateResult<GrantedDirection> {
        let mut inner = self.inner.write().unwrap();
        let has_back = inner.sessions.get(&session_id).ok_or(NfsStat4::BadSession)?.has_back_channel();
        inner.connections.bind(session_id, has_back, connection, requested, self.config.max_connections_per_session)
    }

    // ---- C5 Open/Lock State ----

    pub fn validate_owner_seqid(
        &self,
        client: ClientId,
        owner: &OwnerId,
        seqid: u32,
    ) -> StateResult<SeqidOutcome> {
        let mut inner = self.inner.write().unwrap();
        inner.opens.validate_owner_seqid(client, owner, seqid)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open_file(
        &self,
        client_id: ClientId,
        owner: OwnerId,
        file: FileHandle,
        share_access: u32,
        share_deny: u32,
        is_reclaim: bool,
    ) -> StateResult<(StateId, Option<StateId>)> {
        let now = self.now();
        let mut inner = self.inner.write().unwrap();
        inner.grace.check_for_new_state(now, is_reclaim)?;

        let conflict = inner.delegations.check_conflict(
            &file,
            client_id,
            share_access & open::SHARE_ACCESS_WRITE != 0,
            now,
            |holder| self.back_channels.lock().unwrap().contains_key(&holder),
            self.config.revocation_send_failure_timeout,
        );
        if let Some((deleg_stateid, holder, transport)) = conflict {
            let file_for_recall = file.clone();
            drop(inner);
            self.dispatch_recall(deleg_stateid, holder, transport, file_for_recall);
            return Err(NfsStat4::Delay);
        }

        let stateid = inner.opens.open(&self.stateid_alloc, client_id, owner, file.clone(), share_access, share_deny)?;

        let grace_ended = if is_reclaim { inner.grace.mark_reclaimed(client_id) } else { false };

        let other_clients_have_opens = inner
            .opens
            .opens_on_file(&file)
            .iter()
            .any(|o| o.client_id != client_id);
        let cb_path_up = inner.clients.get(client_id).map(|c| c.cb_path_up).unwrap_or(false);
        let deleg = inner.delegations.try_grant(
            &self.stateid_alloc,
            self.config.delegations_enabled,
            client_id,
            cb_path_up,
            file,
            share_access & open::SHARE_ACCESS_WRITE != 0,
            other_clients_have_opens,
        );
        drop(inner);
        if grace_ended {
            self.fire_grace_end();
        }
        Ok((stateid, deleg))
    }

    pub fn close(&self, other: [u8; 12]) -> StateResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.opens.close(other)
    }

    pub fn open_downgrade(&self, other: [u8; 12], share_access: u32, share_deny: u32) -> StateResult<StateId> {
        let mut inner = self.inner.write().unwrap();
        inner.opens.downgrade(other, share_access, share_deny)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn lock(
        &self,
        client_id: ClientId,
        owner: OwnerId,
        file: FileHandle,
        range: LockRange,
        lock_type: u32,
        open_stateid_other: [u8; 12],
        new_lock_owner: bool,
    ) -> StateResult<StateId> {
        let mut inner = self.inner.write().unwrap();
        let open_share_access = inner
            .opens
            .get(&open_stateid_other)
            .ok_or(NfsStat4::BadStateid)?
            .share_access;
        inner.locks.lock(&self.stateid_alloc, client_id, owner, file, range, lock_type, open_share_access, new_lock_owner)
    }

    pub fn lock_t(&self, file: &FileHandle, range: LockRange, lock_type: u32, owner: &OwnerId) -> Option<LockConflict> {
        let inner = self.inner.read().unwrap();
        inner.locks.test(file, range, lock_type, owner)
    }

    pub fn lock_u(&self, file: &FileHandle, stateid_other: &[u8; 12], range: LockRange) -> StateResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.locks.unlock(file, stateid_other, range)
    }

    pub fn release_lock_owner(&self, client_id: ClientId, owner: &OwnerId) -> StateResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.locks.release_owner(client_id, owner)
    }

    pub fn validate_stateid(&self, stateid: &StateId) -> StateResult<()> {
        let current_epoch = self.stateid_alloc_epoch();
        let inner = self.inner.read().unwrap();
        match stateid.kind() {
            Some(StateKind::Open) | None => {
                inner.opens.validate_stateid(stateid, current_epoch)?;
            }
            Some(StateKind::Lock) => {
                if stateid.epoch() != current_epoch {
                    return Err(NfsStat4::StaleStateid);
                }
            }
            Some(StateKind::Delegation) => {
                if stateid.epoch() != current_epoch {
                    return Err(NfsStat4::StaleStateid);
                }
                let deleg = inner.delegations.get(&stateid.other).ok_or(NfsStat4::BadStateid)?;
                if deleg.revoked {
                    return Err(NfsStat4::DelegRevoked);
                }
            }
        }
        Ok(())
    }

    fn stateid_alloc_epoch(&self) -> u32 {
        self.client_alloc.boot_epoch()
    }

    // ---- C6 Delegation Engine ----

    pub fn return_delegation(&self, other: [u8; 12]) -> StateResult<()> {
        let due = {
            let mut inner = self.inner.write().unwrap();
            inner.delegations.return_delegation(&other)?
        };
        if let Some(due) = due {
            self.dispatch_notifications(vec![due]);
        }
        Ok(())
    }

    pub fn check_delegation_conflict(
        &self,
        file: &FileHandle,
        requester: ClientId,
        requested_write: bool,
    ) -> Option<(StateId, ClientId, RecallTransport)> {
        let now = self.now();
        let mut inner = self.inner.write().unwrap();
        inner.delegations.check_conflict(
            file,
            requester,
            requested_write,
            now,
            |holder| self.back_channels.lock().unwrap().contains_key(&holder),
            self.config.revocation_send_failure_timeout,
        )
    }

    pub fn revoke_expired_delegations(&self) -> Vec<StateId> {
        let now = self.now();
        let mut inner = self.inner.write().unwrap();
        inner.delegations.revoke_expired(now)
    }

    /// Grants a directory delegation (§4.6 "Directory delegations"), exposed
    /// independently of `open_file` since it isn't gated on an OPEN.
    pub fn grant_directory_delegation(
        &self,
        client_id: ClientId,
        file: FileHandle,
        notify_mask: u32,
        cookie_verifier: [u8; 8],
    ) -> StateId {
        let now = self.now();
        let mut inner = self.inner.write().unwrap();
        inner.delegations.grant_directory_delegation(&self.stateid_alloc, client_id, file, notify_mask, cookie_verifier, now)
    }

    /// `NotifyDirChange` (§6): records a directory-entry change against
    /// every directory delegation held on `file`, suppressing the entry for
    /// whichever client caused it. Accumulates only — flushed via
    /// `flush_dir_notifications` on the batch timer or delegation return
    /// (§4.6).
    pub fn notify_dir_change(&self, file: &FileHandle, originating_client: ClientId, event: DirChangeEvent) {
        let inner = self.inner.read().unwrap();
        inner.delegations.record_dir_change(file, originating_client, event);
    }

    /// Drains every directory delegation whose batch-flush deadline has
    /// passed and dispatches a `CB_NOTIFY` for each, outside the primary
    /// lock (§4.6).
    pub fn flush_dir_notifications(&self) {
        let now = self.now();
        let due = {
            let mut inner = self.inner.write().unwrap();
            inner.delegations.drain_due_notifications(now)
        };
        self.dispatch_notifications(due);
    }

    // ---- C9 Grace Period ----

    pub fn start_grace_period(&self, expected: HashSet<ClientId>) {
        let now = self.now();
        let mut inner = self.inner.write().unwrap();
        inner.grace.start(expected, self.config.grace_duration, now);
    }

    pub fn check_grace_for_new_state(&self, is_reclaim: bool) -> StateResult<()> {
        let now = self.now();
        let inner = self.inner.read().unwrap();
        inner.grace.check_for_new_state(now, is_reclaim)
    }

    pub fn force_end_grace(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.grace.force_end();
    }

    pub fn grace_status(&self) -> bool {
        let now = self.now();
        let inner = self.inner.read().unwrap();
        inner.grace.status(now)
    }

    pub fn reclaim_complete(&self, client: ClientId) -> StateResult<()> {
        let grace_ended = {
            let mut inner = self.inner.write().unwrap();
            inner.grace.reclaim_complete(client)?
        };
        if grace_ended {
            self.fire_grace_end();
        }
        Ok(())
    }

    // ---- Snapshot ----

    pub fn get_confirmed_client_ids(&self) -> Vec<ClientId> {
        let inner = self.inner.read().unwrap();
        inner.clients.confirmed_ids()
    }

    pub fn save_client_state(&self) -> Vec<crate::snapshot::SnapshotRecord> {
        let inner = self.inner.read().unwrap();
        inner
            .clients
            .confirmed_ids()
            .into_iter()
            .filter_map(|id| {
                let record = inner.clients.get(id)?;
                Some(crate::snapshot::SnapshotRecord {
                    client_id: record.id.0,
                    name: record.name.clone(),
                    verifier: record.boot_verifier,
                    addr: record.addr.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateManagerConfig;
    use crate::traits::fakes::{FakeClock, FakeRng};

    fn manager() -> StateManager {
        StateManager::new(StateManagerConfig::default(), 1, Box::new(FakeClock::new()), Box::new(FakeRng::new()))
    }

    #[test]
    fn set_client_id_then_confirm_then_renew() {
        let mgr = manager();
        let id = mgr.set_client_id(b"c1".to_vec(), [1; 8]);
        mgr.confirm_client_id(id, {
            let inner = mgr.inner.read().unwrap();
            inner.clients.get(id).unwrap().confirm_verifier
        })
        .unwrap();
        mgr.renew(id).unwrap();
        assert_eq!(mgr.get_confirmed_client_ids(), vec![id]);
    }

    #[test]
    fn destroy_client_id_removes_sessions() {
        let mgr = manager();
        let id = mgr.exchange_id(b"c1".to_vec(), [1; 8]);
        let attrs = ChannelAttrs { max_request_size: 4096, max_response_size: 4096, max_operations: 8, max_requests: 8 };
        mgr.create_session(id, 0, attrs, None, 0x4000_0001, SessionId([9; 16])).unwrap();
        mgr.destroy_client_id(id).unwrap();
        assert_eq!(mgr.sequence(SessionId([9; 16]), 0, 1), Err(NfsStat4::BadSession));
    }

    #[test]
    fn open_then_close_round_trip() {
        let mgr = manager();
        let id = mgr.exchange_id(b"c1".to_vec(), [1; 8]);
        let (sid, deleg) = mgr
            .open_file(id, OwnerId(b"o".to_vec()), FileHandle(b"f".to_vec()), open::SHARE_ACCESS_READ, open::SHARE_DENY_NONE, false)
            .unwrap();
        assert!(deleg.is_none()); // no callback path verified yet
        mgr.close(sid.other).unwrap();
    }

    #[test]
    fn grace_blocks_non_reclaim_open() {
        let mgr = manager();
        mgr.start_grace_period([ClientId(1)].into_iter().collect());
        let id = mgr.exchange_id(b"c1".to_vec(), [1; 8]);
        let err = mgr
            .open_file(id, OwnerId(b"o".to_vec()), FileHandle(b"f".to_vec()), open::SHARE_ACCESS_READ, open::SHARE_DENY_NONE, false)
            .unwrap_err();
        assert_eq!(err, NfsStat4::Grace);
    }
}
