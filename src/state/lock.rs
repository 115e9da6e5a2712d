//! Lock-owner and byte-range lock tracking (C5, lock half): RFC 8881 §9.4,
//! §18.10-§18.12.

use crate::error::{NfsStat4, StateResult};
use crate::ids::{ClientId, FileHandle, OwnerId, StateId, StateIdAllocator, StateKind};
use std::collections::HashMap;

pub const READ_LOCK_TYPE: u32 = 1;
pub const WRITE_LOCK_TYPE: u32 = 2;

/// One byte range, `length == u64::MAX` meaning "to infinity" (RFC 8881
/// §18.10 `length4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    pub offset: u64,
    pub length: u64,
}

impl LockRange {
    pub fn end(&self) -> Option<u64> {
        if self.length == u64::MAX {
            None
        } else {
            Some(self.offset.saturating_add(self.length))
        }
    }

    pub fn overlaps(&self, other: &LockRange) -> bool {
        let self_end = self.end();
        let other_end = other.end();
        let starts_before_other_ends = match other_end {
            Some(e) => self.offset < e,
            None => true,
        };
        let other_starts_before_self_ends = match self_end {
            Some(e) => other.offset < e,
            None => true,
        };
        starts_before_other_ends && other_starts_before_self_ends
    }
}

#[derive(Debug, Clone)]
struct HeldLock {
    range: LockRange,
    lock_type: u32,
    owner: OwnerId,
    client_id: ClientId,
}

/// A conflicting lock, returned to the caller so it can build a `DENIED`
/// response (§4.5 "Conflicts return DENIED carrying the conflicting range,
/// type, and owner").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub range: LockRange,
    pub lock_type: u32,
    pub owner: OwnerId,
}

#[derive(Debug, Clone, Default)]
struct LockOwnerEntry {
    stateid: Option<StateId>,
}

/// Tracks lock-owners and the byte-range locks they hold, per file.
#[derive(Default)]
pub struct LockTable {
    owners: HashMap<(ClientId, OwnerId), LockOwnerEntry>,
    locks_by_file: HashMap<FileHandle, Vec<HeldLock>>,
    stateid_to_owner: HashMap<[u8; 12], (ClientId, OwnerId)>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_conflict(
        &self,
        file: &FileHandle,
        range: LockRange,
        lock_type: u32,
        requester_owner: &OwnerId,
    ) -> Option<LockConflict> {
        let held = self.locks_by_file.get(file)?;
        for lock in held {
            if &lock.owner == requester_owner {
                continue;
            }
            let conflicting_types = lock_type == WRITE_LOCK_TYPE || lock.lock_type == WRITE_LOCK_TYPE;
            if conflicting_types && lock.range.overlaps(&range) {
                return Some(LockConflict {
                    range: lock.range,
                    lock_type: lock.lock_type,
                    owner: lock.owner.clone(),
                });
            }
        }
        None
    }

    /// Acquires a lock, creating the lock-owner first if `new_lock_owner` is
    /// set (§4.5 "LOCK with new_lock_owner=true creates a lock-owner").
    /// `open_share_access` gates lock-type compatibility: a write lock
    /// requires `SHARE_ACCESS_WRITE` on the associated open, a read lock
    /// requires `SHARE_ACCESS_READ`.
    #[allow(clippy::too_many_arguments)]
    pub fn lock(
        &mut self,
        alloc: &StateIdAllocator,
        client_id: ClientId,
        owner: OwnerId,
        file: FileHandle,
        range: LockRange,
        lock_type: u32,
        open_share_access: u32,
        new_lock_owner: bool,
    ) -> StateResult<StateId> {
        let needs_write = lock_type == WRITE_LOCK_TYPE;
        let needs_read = lock_type == READ_LOCK_TYPE;
        if (needs_write && open_share_access & super::open::SHARE_ACCESS_WRITE == 0)
            || (needs_read && open_share_access & super::open::SHARE_ACCESS_READ == 0)
        {
            return Err(NfsStat4::OpenMode);
        }

        if let Some(conflict) = self.find_conflict(&file, range, lock_type, &owner) {
            return Err(locked_or_denied(conflict));
        }

        let key = (client_id, owner.clone());
        if new_lock_owner && !self.owners.contains_key(&key) {
            self.owners.insert(key.clone(), LockOwnerEntry::default());
        }
        if !self.owners.contains_key(&key) {
            return Err(NfsStat4::BadStateid);
        }

        let stateid = alloc.alloc(StateKind::Lock);
        self.owners.get_mut(&key).unwrap().stateid = Some(stateid);
        self.stateid_to_owner.insert(stateid.other, key);
        self.locks_by_file.entry(file).or_default().push(HeldLock {
            range,
            lock_type,
            owner,
            client_id,
        });
        Ok(stateid)
    }

    /// Checks for a conflict without taking the lock (LOCKT).
    pub fn test(
        &self,
        file: &FileHandle,
        range: LockRange,
        lock_type: u32,
        owner: &OwnerId,
    ) -> Option<LockConflict> {
        self.find_conflict(file, range, lock_type, owner)
    }

    /// Releases a byte range previously held under `stateid`'s owner
    /// (LOCKU).
    pub fn unlock(&mut self, file: &FileHandle, stateid_other: &[u8; 12], range: LockRange) -> StateResult<()> {
        let (_, owner) = self
            .stateid_to_owner
            .get(stateid_other)
            .cloned()
            .ok_or(NfsStat4::BadStateid)?;
        let held = self.locks_by_file.get_mut(file).ok_or(NfsStat4::LockRange)?;
        let before = held.len();
        held.retain(|l| !(l.owner == owner && l.range == range));
        if held.len() == before {
            return Err(NfsStat4::LockRange);
        }
        if held.is_empty() {
            self.locks_by_file.remove(file);
        }
        Ok(())
    }

    /// Discards a lock-owner once it holds no locks anywhere (RELEASE_LOCKOWNER).
    pub fn release_owner(&mut self, client_id: ClientId, owner: &OwnerId) -> StateResult<()> {
        let still_holds_locks = self
            .locks_by_file
            .values()
            .flatten()
            .any(|l| l.client_id == client_id && &l.owner == owner);
        if still_holds_locks {
            return Err(NfsStat4::LocksHeld);
        }
        if let Some(entry) = self.owners.remove(&(client_id, owner.clone())) {
            if let Some(sid) = entry.stateid {
                self.stateid_to_owner.remove(&sid.other);
            }
        }
        Ok(())
    }
}

fn locked_or_denied(_conflict: LockConflict) -> NfsStat4 {
    NfsStat4::Denied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::open::{SHARE_ACCESS_BOTH, SHARE_ACCESS_READ};

    fn owner(b: &[u8]) -> OwnerId {
        OwnerId(b.to_vec())
    }

    fn file(b: &[u8]) -> FileHandle {
        FileHandle(b.to_vec())
    }

    fn range(offset: u64, length: u64) -> LockRange {
        LockRange { offset, length }
    }

    #[test]
    fn write_lock_requires_write_share() {
        let mut table = LockTable::new();
        let alloc = StateIdAllocator::new(1);
        let err = table
            .lock(&alloc, ClientId(1), owner(b"o"), file(b"f"), range(0, 10), WRITE_LOCK_TYPE, SHARE_ACCESS_READ, true)
            .unwrap_err();
        assert_eq!(err, NfsStat4::OpenMode);
    }

    #[test]
    fn overlapping_write_locks_conflict() {
        let mut table = LockTable::new();
        let alloc = StateIdAllocator::new(1);
        table
            .lock(&alloc, ClientId(1), owner(b"a"), file(b"f"), range(0, 10), WRITE_LOCK_TYPE, SHARE_ACCESS_BOTH, true)
            .unwrap();
        let err = table
            .lock(&alloc, ClientId(2), owner(b"b"), file(b"f"), range(5, 10), WRITE_LOCK_TYPE, SHARE_ACCESS_BOTH, true)
            .unwrap_err();
        assert_eq!(err, NfsStat4::Denied);
    }

    #[test]
    fn non_overlapping_locks_do_not_conflict() {
        let mut table = LockTable::new();
        let alloc = StateIdAllocator::new(1);
        table
            .lock(&alloc, ClientId(1), owner(b"a"), file(b"f"), range(0, 10), WRITE_LOCK_TYPE, SHARE_ACCESS_BOTH, true)
            .unwrap();
        table
            .lock(&alloc, ClientId(2), owner(b"b"), file(b"f"), range(10, 10), WRITE_LOCK_TYPE, SHARE_ACCESS_BOTH, true)
            .unwrap();
    }

    #[test]
    fn two_read_locks_do_not_conflict() {
        let mut table = LockTable::new();
        let alloc = StateIdAllocator::new(1);
        table
            .lock(&alloc, ClientId(1), owner(b"a"), file(b"f"), range(0, 10), READ_LOCK_TYPE, SHARE_ACCESS_READ, true)
            .unwrap();
        table
            .lock(&alloc, ClientId(2), owner(b"b"), file(b"f"), range(0, 10), READ_LOCK_TYPE, SHARE_ACCESS_READ, true)
            .unwrap();
    }

    #[test]
    fn unlock_then_release_owner() {
        let mut table = LockTable::new();
        let alloc = StateIdAllocator::new(1);
        let sid = table
            .lock(&alloc, ClientId(1), owner(b"a"), file(b"f"), range(0, 10), WRITE_LOCK_TYPE, SHARE_ACCESS_BOTH, true)
            .unwrap();
        table.unlock(&file(b"f"), &sid.other, range(0, 10)).unwrap();
        table.release_owner(ClientId(1), &owner(b"a")).unwrap();
    }

    #[test]
    fn release_owner_with_locks_held_fails() {
        let mut table = LockTable::new();
        let alloc = StateIdAllocator::new(1);
        table
            .lock(&alloc, ClientId(1), owner(b"a"), file(b"f"), range(0, 10), WRITE_LOCK_TYPE, SHARE_ACCESS_BOTH, true)
            .unwrap();
        assert_eq!(table.release_owner(ClientId(1), &owner(b"a")), Err(NfsStat4::LocksHeld));
    }

    #[test]
    fn infinite_range_overlaps_anything_after_offset() {
        let a = range(0, u64::MAX);
        let b = range(100, 1);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }
}
