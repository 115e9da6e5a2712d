//! NFSv4.1 sessions and slot tables (C3): per-request exact-once replay
//! detection per RFC 8881 §2.10.6.1.

use crate::error::{NfsStat4, StateResult};
use crate::ids::{ClientId, SessionId};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// One entry of a session's slot table (§3 "Slot table").
#[derive(Debug, Clone)]
struct Slot {
    /// Last completed sequence ID; starts at 0.
    cached_seqid: u32,
    in_use: bool,
    cached_reply: Option<Vec<u8>>,
}

impl Slot {
    fn new() -> Self {
        Self { cached_seqid: 0, in_use: false, cached_reply: None }
    }
}

/// Outcome of [`SlotTable::validate_sequence`] that the caller must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// A genuinely new request; the slot is now marked in-use.
    New,
    /// A retransmission of the last completed request; replay this reply
    /// byte-for-byte.
    Retry(Vec<u8>),
    /// A retransmission of the last completed request, but no reply was
    /// cached for it (`cache_this` was false last time).
    RetryUncachedRep,
}

/// Fixed-size slot table shared by a session's fore or back channel.
///
/// The whole table is guarded by one lock: RFC 8881 requires
/// `ValidateSequence`/`CompleteSlotRequest` to be linearizable per slot, and
/// the table is small enough that a single lock is simpler than per-slot
/// locks without sacrificing the required atomicity (§5 "per-slot-table
/// locks are leaf locks").
pub struct SlotTable {
    slots: Mutex<Vec<Slot>>,
    target_highest_slotid: AtomicU32,
}

impl SlotTable {
    pub fn new(num_slots: u32) -> Self {
        let num_slots = num_slots.max(1);
        Self {
            slots: Mutex::new(vec![Slot::new(); num_slots as usize]),
            target_highest_slotid: AtomicU32::new(num_slots.saturating_sub(1)),
        }
    }

    pub fn len(&self) -> u32 {
        self.slots.lock().unwrap().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advisory flow-control value returned in every SEQUENCE reply; the
    /// server may lower it under pressure.
    pub fn target_highest_slotid(&self) -> u32 {
        self.target_highest_slotid.load(Ordering::Relaxed)
    }

    pub fn set_target_highest_slotid(&self, target: u32) {
        self.target_highest_slotid.store(target, Ordering::Relaxed);
    }

    /// Runs the RFC 8881 §2.10.6.1 algorithm atomically for one slot.
    pub fn validate_sequence(&self, slot_id: u32, seqid: u32) -> StateResult<SlotOutcome> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(slot_id as usize)
            .ok_or(NfsStat4::BadSlot)?;

        if slot.in_use {
            return Err(NfsStat4::Delay);
        }
        let expected = slot.cached_seqid.wrapping_add(1);
        if seqid == expected {
            slot.in_use = true;
            Ok(SlotOutcome::New)
        } else if seqid == slot.cached_seqid {
            match &slot.cached_reply {
                Some(reply) => Ok(SlotOutcome::Retry(reply.clone())),
                None => Ok(SlotOutcome::RetryUncachedRep),
            }
        } else {
            Err(NfsStat4::SeqMisordered)
        }
    }

    /// The seqid `validate_sequence` would accept as `New` right now. Used
    /// by a sender that issues its own `CB_SEQUENCE` numbers rather than
    /// validating ones a peer sent (§4.7 step 1 "next seqid").
    pub fn next_seqid(&self, slot_id: u32) -> StateResult<u32> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(slot_id as usize).ok_or(NfsStat4::BadSlot)?;
        Ok(slot.cached_seqid.wrapping_add(1))
    }

    /// Releases a slot claimed by `validate_sequence` without completing it
    /// — the send failed before a reply arrived, so the same seqid is valid
    /// on the next attempt.
    pub fn abort_slot_request(&self, slot_id: u32) -> StateResult<()> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(slot_id as usize).ok_or(NfsStat4::BadSlot)?;
        slot.in_use = false;
        Ok(())
    }

    /// Stores the completed seqid, clears `in_use`, and (if `cache_this`)
    /// copies `reply` into the slot cache.
    pub fn complete_slot_request(
        &self,
        slot_id: u32,
        new_seqid: u32,
        cache_this: bool,
        reply: &[u8],
    ) -> StateResult<()> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(slot_id as usize)
            .ok_or(NfsStat4::BadSlot)?;
        slot.cached_seqid = new_seqid;
        slot.in_use = false;
        slot.cached_reply = if cache_this { Some(reply.to_vec()) } else { None };
        Ok(())
    }
}

/// Negotiated channel attributes for a session's fore or back direction
/// (RFC 8881 §18.36, `channel_attrs4`).
#[derive(Debug, Clone, Copy)]
pub struct ChannelAttrs {
    pub max_request_size: u32,
    pub max_response_size: u32,
    pub max_operations: u32,
    pub max_requests: u32,
}

/// A v4.1 session: fore-channel slot table always present, back-channel
/// slot table only if `CONN_BACK_CHAN` was negotiated (§3 "Session").
pub struct Session {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub fore_channel: SlotTable,
    pub back_channel: Option<SlotTable>,
    pub fore_attrs: ChannelAttrs,
    pub back_attrs: Option<ChannelAttrs>,
    pub callback_program: u32,
    pub creation_seqid: u32,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        client_id: ClientId,
        max_slots_clamp: u32,
        fore_attrs: ChannelAttrs,
        back_attrs: Option<ChannelAttrs>,
        callback_program: u32,
        creation_seqid: u32,
    ) -> Self {
        let fore_slots = fore_attrs.max_requests.min(max_slots_clamp);
        let back_channel = back_attrs
            .map(|attrs| SlotTable::new(attrs.max_requests.min(max_slots_clamp)));
        Self {
            session_id,
            client_id,
            fore_channel: SlotTable::new(fore_slots),
            back_channel,
            fore_attrs,
            back_attrs,
            callback_program,
            creation_seqid,
        }
    }

    pub fn has_back_channel(&self) -> bool {
        self.back_channel.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(max_requests: u32) -> ChannelAttrs {
        ChannelAttrs {
            max_request_size: 4096,
            max_response_size: 4096,
            max_operations: 8,
            max_requests,
        }
    }

    #[test]
    fn bad_slot_out_of_range() {
        let table = SlotTable::new(4);
        assert_eq!(table.validate_sequence(4, 1), Err(NfsStat4::BadSlot));
    }

    #[test]
    fn e2_slot_retry_scenario() {
        let table = SlotTable::new(4);
        assert_eq!(table.validate_sequence(0, 1), Ok(SlotOutcome::New));
        table.complete_slot_request(0, 1, true, &[0xAA]).unwrap();
        assert_eq!(table.validate_sequence(0, 1), Ok(SlotOutcome::Retry(vec![0xAA])));
        assert_eq!(table.validate_sequence(0, 3), Err(NfsStat4::SeqMisordered));
    }

    #[test]
    fn retry_uncached_when_not_cached() {
        let table = SlotTable::new(4);
        table.validate_sequence(0, 1).unwrap();
        table.complete_slot_request(0, 1, false, &[]).unwrap();
        assert_eq!(table.validate_sequence(0, 1), Ok(SlotOutcome::RetryUncachedRep));
    }

    #[test]
    fn busy_slot_delays_both_new_and_replay() {
        let table = SlotTable::new(1);
        assert_eq!(table.validate_sequence(0, 1), Ok(SlotOutcome::New));
        // Still in flight: a duplicate of the in-flight request delays.
        assert_eq!(table.validate_sequence(0, 1), Err(NfsStat4::Delay));
        // So does a premature next request.
        assert_eq!(table.validate_sequence(0, 2), Err(NfsStat4::Delay));
    }

    #[test]
    fn seqid_wraps_without_skipping_zero() {
        let table = SlotTable::new(1);
        table.validate_sequence(0, 1).unwrap();
        table.complete_slot_request(0, u32::MAX, true, &[1]).unwrap();
        assert_eq!(table.validate_sequence(0, 0), Ok(SlotOutcome::New));
    }

    #[test]
    fn session_without_back_chan_negotiation_has_none() {
        let session = Session::new(
            SessionId([0; 16]),
            ClientId(1),
            64,
            attrs(8),
            None,
            0x4000_0001,
            0,
        );
        assert!(!session.has_back_channel());
    }

    #[test]
    fn session_clamps_slot_count_to_implementation_max() {
        let session = Session::new(
            SessionId([1; 16]),
            ClientId(1),
            4,
            attrs(64),
            Some(attrs(64)),
            0x4000_0001,
            0,
        );
        assert_eq!(session.fore_channel.len(), 4);
        assert_eq!(session.back_channel.as_ref().unwrap().len(), 4);
    }
}
