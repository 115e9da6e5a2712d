//! Client registry (C1): v4.0 SETCLIENTID five-case algorithm and v4.1
//! EXCHANGE_ID, keyed by client-supplied identity (RFC 7530 §8.1, RFC 8881
//! §18.35).

use crate::error::{NfsStat4, StateResult};
use crate::ids::{ClientId, ClientIdAllocator};
use std::collections::HashMap;

/// Callback program/address the client registered for dial-out or
/// back-channel delivery.
#[derive(Debug, Clone, Default)]
pub struct CallbackDescriptor {
    pub program: u32,
    pub net_id: String,
    pub uaddr: String,
}

/// One client record (§3 "Client record").
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub name: Vec<u8>,
    pub boot_verifier: [u8; 8],
    pub confirm_verifier: [u8; 8],
    pub callback: CallbackDescriptor,
    pub confirmed: bool,
    pub cb_path_up: bool,
    pub addr: String,
    pub reclaim_complete: bool,
    /// v4.1 only: sequence ID expected on the immediately-following
    /// CREATE_SESSION.
    pub next_session_seqid: u32,
}

impl ClientRecord {
    fn new(id: ClientId, name: Vec<u8>, boot_verifier: [u8; 8], confirm_verifier: [u8; 8]) -> Self {
        Self {
            id,
            name,
            boot_verifier,
            confirm_verifier,
            callback: CallbackDescriptor::default(),
            confirmed: false,
            cb_path_up: false,
            addr: String::new(),
            reclaim_complete: false,
            next_session_seqid: 0,
        }
    }
}

/// Registry of client records, indexed by ID and by name (§3 "Client
/// record"). Not `Send`-shared on its own: it lives inside the primary
/// state-manager lock (§5).
#[derive(Default)]
pub struct ClientRegistry {
    by_id: HashMap<ClientId, ClientRecord>,
    /// At most one confirmed record per name.
    confirmed_by_name: HashMap<Vec<u8>, ClientId>,
    /// An unconfirmed record may coexist with a confirmed one of the same
    /// name but a different verifier.
    unconfirmed_by_name: HashMap<Vec<u8>, ClientId>,
    /// v4.1 EXCHANGE_ID dedup key: (owner name, boot verifier) -> id.
    exchange_by_key: HashMap<(Vec<u8>, [u8; 8]), ClientId>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.by_id.get_mut(&id)
    }

    pub fn is_confirmed(&self, id: ClientId) -> bool {
        self.by_id.get(&id).map(|c| c.confirmed).unwrap_or(false)
    }

    pub fn confirmed_ids(&self) -> Vec<ClientId> {
        self.confirmed_by_name.values().copied().collect()
    }

    /// v4.0 SETCLIENTID, implementing the five-case table of §4.1.
    pub fn set_client_id(
        &mut self,
        alloc: &ClientIdAllocator,
        verifier_gen: impl FnOnce() -> [u8; 8],
        name: Vec<u8>,
        boot_verifier: [u8; 8],
    ) -> ClientId {
        let confirmed_id = self.confirmed_by_name.get(&name).copied();
        let confirm_verifier = verifier_gen();

        let reuse_confirmed_id = match confirmed_id {
            Some(cid) => {
                let rec = self.by_id.get(&cid).expect("confirmed index dangling");
                rec.boot_verifier == boot_verifier
            }
            None => false,
        };

        let new_id = if reuse_confirmed_id {
            confirmed_id.unwrap()
        } else {
            alloc.alloc()
        };

        // Case: confirmed exists, verifier matches -> reuse id, new confirm
        // verifier (callback info refresh). The existing confirmed record
        // is updated in place; no unconfirmed record is created.
        if reuse_confirmed_id {
            let rec = self.by_id.get_mut(&new_id).unwrap();
            rec.confirm_verifier = confirm_verifier;
            rec.boot_verifier = boot_verifier;
            return new_id;
        }

        // Every other case replaces any existing unconfirmed record for this
        // name with a fresh one; the confirmed record (if any, verifier
        // mismatch = reboot case) is left untouched.
        if let Some(old_unconfirmed) = self.unconfirmed_by_name.remove(&name) {
            self.by_id.remove(&old_unconfirmed);
        }
        let record = ClientRecord::new(new_id, name.clone(), boot_verifier, confirm_verifier);
        self.by_id.insert(new_id, record);
        self.unconfirmed_by_name.insert(name, new_id);
        new_id
    }

    /// v4.0 SETCLIENTID_CONFIRM. On a reboot-case confirm, atomically evicts
    /// the prior confirmed record together with all its state — the caller
    /// is responsible for draining that record's leases/opens/locks/
    /// delegations using the returned evicted ID before this call returns
    /// control to the wire.
    pub fn confirm_client_id(
        &mut self,
        id: ClientId,
        verifier: [u8; 8],
    ) -> StateResult<Option<ClientId>> {
        let record = self.by_id.get(&id).ok_or(NfsStat4::StaleClientId)?;
        if record.confirm_verifier != verifier {
            return Err(NfsStat4::StaleClientId);
        }
        let name = record.name.clone();

        let evicted = self.confirmed_by_name.get(&name).copied().filter(|&cid| cid != id);

        if let Some(old_confirmed) = evicted {
            self.by_id.remove(&old_confirmed);
        }
        self.unconfirmed_by_name.remove(&name);
        self.confirmed_by_name.insert(name, id);
        self.by_id.get_mut(&id).unwrap().confirmed = true;
        Ok(evicted)
    }

    /// v4.1 EXCHANGE_ID, keyed by (owner name, boot verifier). Returns the
    /// client ID and, if a prior record for this name existed with a
    /// different verifier, that prior ID (scheduled for expiry after its
    /// lease by the caller).
    pub fn exchange_id(
        &mut self,
        alloc: &ClientIdAllocator,
        verifier_gen: impl FnOnce() -> [u8; 8],
        name: Vec<u8>,
        boot_verifier: [u8; 8],
    ) -> (ClientId, Option<ClientId>) {
        let key = (name.clone(), boot_verifier);
        if let Some(&existing) = self.exchange_by_key.get(&key) {
            return (existing, None);
        }

        let superseded = self
            .confirmed_by_name
            .get(&name)
            .copied()
            .or_else(|| self.unconfirmed_by_name.get(&name).copied());

        let id = alloc.alloc();
        let confirm_verifier = verifier_gen();
        let mut record = ClientRecord::new(id, name.clone(), boot_verifier, confirm_verifier);
        record.confirmed = true;
        self.by_id.insert(id, record);
        self.exchange_by_key.insert(key, id);
        self.confirmed_by_name.insert(name, id);

        (id, superseded)
    }

    /// Validates and advances the CREATE_SESSION sequence ID for a v4.1
    /// client (§4.1 "reuse or skew fails with SEQ_MISORDERED").
    pub fn consume_session_seqid(&mut self, id: ClientId, seqid: u32) -> StateResult<()> {
        let record = self.by_id.get_mut(&id).ok_or(NfsStat4::StaleClientId)?;
        if seqid != record.next_session_seqid {
            return Err(NfsStat4::SeqMisordered);
        }
        record.next_session_seqid = record.next_session_seqid.wrapping_add(1);
        Ok(())
    }

    /// Removes a client record outright (lease expiry, DESTROY_CLIENTID, or
    /// cascaded eviction).
    pub fn remove(&mut self, id: ClientId) -> Option<ClientRecord> {
        let record = self.by_id.remove(&id)?;
        if self.confirmed_by_name.get(&record.name) == Some(&id) {
            self.confirmed_by_name.remove(&record.name);
        }
        if self.unconfirmed_by_name.get(&record.name) == Some(&id) {
            self.unconfirmed_by_name.remove(&record.name);
        }
        self.exchange_by_key.retain(|_, v| *v != id);
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(n: u8) -> [u8; 8] {
        [n; 8]
    }

    #[test]
    fn e1_v40_reboot_scenario() {
        let alloc = ClientIdAllocator::new(1);
        let mut registry = ClientRegistry::new();

        let a = registry.set_client_id(&alloc, || verifier(0xA1), b"c1".to_vec(), verifier(1));
        registry.confirm_client_id(a, registry.get(a).unwrap().confirm_verifier).unwrap();
        assert!(registry.is_confirmed(a));

        let b = registry.set_client_id(&alloc, || verifier(0xB2), b"c1".to_vec(), verifier(2));
        assert_ne!(a, b);
        // Before confirming B, A is still confirmed.
        assert!(registry.is_confirmed(a));

        let evicted = registry
            .confirm_client_id(b, registry.get(b).unwrap().confirm_verifier)
            .unwrap();
        assert_eq!(evicted, Some(a));
        assert!(registry.get(a).is_none());
        assert!(registry.is_confirmed(b));
    }

    #[test]
    fn confirmed_verifier_match_reuses_id() {
        let alloc = ClientIdAllocator::new(1);
        let mut registry = ClientRegistry::new();
        let a = registry.set_client_id(&alloc, || verifier(1), b"c1".to_vec(), verifier(9));
        registry.confirm_client_id(a, registry.get(a).unwrap().confirm_verifier).unwrap();

        let a2 = registry.set_client_id(&alloc, || verifier(2), b"c1".to_vec(), verifier(9));
        assert_eq!(a, a2);
        assert_eq!(registry.get(a).unwrap().confirm_verifier, verifier(2));
    }

    #[test]
    fn confirm_mismatch_is_stale_clientid() {
        let alloc = ClientIdAllocator::new(1);
        let mut registry = ClientRegistry::new();
        let a = registry.set_client_id(&alloc, || verifier(1), b"c1".to_vec(), verifier(9));
        assert_eq!(registry.confirm_client_id(a, verifier(0xFF)), Err(NfsStat4::StaleClientId));
    }

    #[test]
    fn exchange_id_same_verifier_returns_existing() {
        let alloc = ClientIdAllocator::new(1);
        let mut registry = ClientRegistry::new();
        let (a, sup) = registry.exchange_id(&alloc, || verifier(1), b"c1".to_vec(), verifier(5));
        assert!(sup.is_none());
        let (a2, sup2) = registry.exchange_id(&alloc, || verifier(2), b"c1".to_vec(), verifier(5));
        assert_eq!(a, a2);
        assert!(sup2.is_none());
    }

    #[test]
    fn exchange_id_different_verifier_supersedes() {
        let alloc = ClientIdAllocator::new(1);
        let mut registry = ClientRegistry::new();
        let (a, _) = registry.exchange_id(&alloc, || verifier(1), b"c1".to_vec(), verifier(5));
        let (b, sup) = registry.exchange_id(&alloc, || verifier(2), b"c1".to_vec(), verifier(6));
        assert_ne!(a, b);
        assert_eq!(sup, Some(a));
    }

    #[test]
    fn session_seqid_reuse_fails() {
        let alloc = ClientIdAllocator::new(1);
        let mut registry = ClientRegistry::new();
        let (a, _) = registry.exchange_id(&alloc, || verifier(1), b"c1".to_vec(), verifier(5));
        registry.consume_session_seqid(a, 0).unwrap();
        assert_eq!(registry.consume_session_seqid(a, 0), Err(NfsStat4::SeqMisordered));
        registry.consume_session_seqid(a, 1).unwrap();
    }
}
