//! Open-owner and open-state tracking (C5, open half): share reservations,
//! open-owner seqid validation, stateid validation ordering (RFC 7530
//! §9.9, §9.10; RFC 8881 §9.1, §9.8, §8.2.2).

use crate::error::{NfsStat4, StateResult};
use crate::ids::{ClientId, FileHandle, OwnerId, StateId, StateIdAllocator, StateKind};
use std::collections::HashMap;

pub const SHARE_ACCESS_READ: u32 = 1;
pub const SHARE_ACCESS_WRITE: u32 = 2;
pub const SHARE_ACCESS_BOTH: u32 = SHARE_ACCESS_READ | SHARE_ACCESS_WRITE;

pub const SHARE_DENY_NONE: u32 = 0;
pub const SHARE_DENY_READ: u32 = 1;
pub const SHARE_DENY_WRITE: u32 = 2;
pub const SHARE_DENY_BOTH: u32 = SHARE_DENY_READ | SHARE_DENY_WRITE;

/// An open-owner's seqid bookkeeping for v4.0 replay detection (§4.5
/// "Open-owner seqid").
#[derive(Debug, Clone, Default)]
struct OwnerSeqid {
    last_seqid: u32,
    cached_reply: Option<StateResult<StateId>>,
    seen: bool,
}

/// Outcome of validating a v4.0 open-owner seqid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqidOutcome {
    New,
    Replay(StateResult<StateId>),
}

/// One open (a (owner, file) share reservation).
#[derive(Debug, Clone)]
pub struct OpenState {
    pub stateid: StateId,
    pub client_id: ClientId,
    pub owner: OwnerId,
    pub file: FileHandle,
    pub share_access: u32,
    pub share_deny: u32,
}

/// Tracks open-owners (for v4.0 seqid replay) and open states (for share
/// reservation conflict detection and stateid validation).
#[derive(Default)]
pub struct OpenTable {
    owners: HashMap<(ClientId, OwnerId), OwnerSeqid>,
    opens: HashMap<[u8; 12], OpenState>,
    by_file: HashMap<FileHandle, Vec<[u8; 12]>>,
}

impl OpenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a v4.0 open-owner seqid per the wrap-that-skips-zero rule
    /// (0xFFFFFFFF -> 1, never 0).
    pub fn validate_owner_seqid(
        &mut self,
        client: ClientId,
        owner: &OwnerId,
        seqid: u32,
    ) -> StateResult<SeqidOutcome> {
        let key = (client, owner.clone());
        let entry = self.owners.entry(key).or_default();

        if !entry.seen {
            // First sight of an owner: whatever seqid it opens with becomes
            // the baseline for future wrap-aware comparisons.
            entry.seen = true;
            entry.last_seqid = seqid;
            return Ok(SeqidOutcome::New);
        }

        let expected = if entry.last_seqid == u32::MAX { 1 } else { entry.last_seqid + 1 };

        if seqid == entry.last_seqid {
            return Ok(SeqidOutcome::Replay(entry.cached_reply.unwrap_or(Err(NfsStat4::ServerFault))));
        }
        if seqid == expected {
            entry.last_seqid = seqid;
            return Ok(SeqidOutcome::New);
        }
        Err(NfsStat4::BadSeqid)
    }

    /// Records the result of a new-seqid operation for future replay.
    pub fn complete_owner_seqid(&mut self, client: ClientId, owner: &OwnerId, result: StateResult<StateId>) {
        if let Some(entry) = self.owners.get_mut(&(client, owner.clone())) {
            entry.cached_reply = Some(result);
        }
    }

    fn conflicts(a_access: u32, a_deny: u32, b_access: u32, b_deny: u32) -> bool {
        (a_access & b_deny) != 0 || (b_access & a_deny) != 0
    }

    /// Opens (or upgrades) a share reservation on `file` for `owner`,
    /// rejecting on conflict with any other owner's existing open on the
    /// same file (§4.5 "Share reservations").
    pub fn open(
        &mut self,
        alloc: &StateIdAllocator,
        client_id: ClientId,
        owner: OwnerId,
        file: FileHandle,
        share_access: u32,
        share_deny: u32,
    ) -> StateResult<StateId> {
        let existing_ids = self.by_file.get(&file).cloned().unwrap_or_default();
        for other_other in &existing_ids {
            let other = &self.opens[other_other];
            if other.owner == owner && other.client_id == client_id {
                continue;
            }
            if Self::conflicts(share_access, share_deny, other.share_access, other.share_deny) {
                return Err(NfsStat4::ShareDenied);
            }
        }

        if let Some(existing_other) = existing_ids.iter().find(|o| {
            let e = &self.opens[*o];
            e.owner == owner && e.client_id == client_id
        }) {
            let state = self.opens.get_mut(existing_other).unwrap();
            state.share_access |= share_access;
            state.share_deny |= share_deny;
            let mut sid = state.stateid;
            sid.seqid = sid.seqid.wrapping_add(1);
            state.stateid = sid;
            return Ok(sid);
        }

        let stateid = alloc.alloc(StateKind::Open);
        let state = OpenState {
            stateid,
            client_id,
            owner,
            file: file.clone(),
            share_access,
            share_deny,
        };
        self.opens.insert(stateid.other, state);
        self.by_file.entry(file).or_default().push(stateid.other);
        Ok(stateid)
    }

    /// Closes an open state, removing it from all indexes.
    pub fn close(&mut self, other: [u8; 12]) -> StateResult<()> {
        let state = self.opens.remove(&other).ok_or(NfsStat4::BadStateid)?;
        if let Some(list) = self.by_file.get_mut(&state.file) {
            list.retain(|o| *o != other);
            if list.is_empty() {
                self.by_file.remove(&state.file);
            }
        }
        Ok(())
    }

    pub fn downgrade(&mut self, other: [u8; 12], share_access: u32, share_deny: u32) -> StateResult<StateId> {
        let state = self.opens.get_mut(&other).ok_or(NfsStat4::BadStateid)?;
        state.share_access = share_access;
        state.share_deny = share_deny;
        state.stateid.seqid = state.stateid.seqid.wrapping_add(1);
        Ok(state.stateid)
    }

    pub fn get(&self, other: &[u8; 12]) -> Option<&OpenState> {
        self.opens.get(other)
    }

    pub fn opens_on_file(&self, file: &FileHandle) -> Vec<&OpenState> {
        self.by_file
            .get(file)
            .map(|ids| ids.iter().map(|o| &self.opens[o]).collect())
            .unwrap_or_default()
    }

    /// Validates a stateid against the open table per the three-stage
    /// ordering of §4.5: stale epoch, then unknown-other, then old seqid.
    pub fn validate_stateid(&self, stateid: &StateId, current_epoch: u32) -> StateResult<&OpenState> {
        if stateid.epoch() != current_epoch {
            return Err(NfsStat4::StaleStateid);
        }
        let state = self.opens.get(&stateid.other).ok_or(NfsStat4::BadStateid)?;
        if !stateid.is_special_seqid() && stateid.seqid < state.stateid.seqid {
            return Err(NfsStat4::OldStateid);
        }
        Ok(state)
    }
}
