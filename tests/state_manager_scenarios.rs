//! Integration tests exercising `StateManager` and the callback subsystem
//! together, end to end rather than through one module's unit tests.

use dittofs_nfs4_state::callback::backchannel::{BackChannelSender, BoundWriter};
use dittofs_nfs4_state::callback::rpc::CbOp;
use dittofs_nfs4_state::config::StateManagerConfig;
use dittofs_nfs4_state::error::NfsStat4;
use dittofs_nfs4_state::ids::{FileHandle, OwnerId, SessionId};
use dittofs_nfs4_state::state::client::CallbackDescriptor;
use dittofs_nfs4_state::state::open::{SHARE_ACCESS_READ, SHARE_ACCESS_WRITE, SHARE_DENY_NONE};
use dittofs_nfs4_state::state::session::ChannelAttrs;
use dittofs_nfs4_state::traits::{Clock, ConnWriter, Rng};
use dittofs_nfs4_state::StateManager;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime};

/// Deterministic clock, local to this test binary (the lib's own fake
/// doubles are `#[cfg(test)]`-only and not visible across the crate
/// boundary).
struct FakeClock {
    wall: Mutex<SystemTime>,
}

impl FakeClock {
    fn new() -> Self {
        Self { wall: Mutex::new(SystemTime::UNIX_EPOCH) }
    }

    fn advance(&self, d: Duration) {
        *self.wall.lock().unwrap() += d;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.wall.lock().unwrap()
    }

    fn monotonic_now(&self) -> Duration {
        self.wall.lock().unwrap().duration_since(SystemTime::UNIX_EPOCH).unwrap()
    }
}

struct CountingRng(AtomicU64);

impl Rng for CountingRng {
    fn fill_bytes(&self, buf: &mut [u8]) {
        let n = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = n.to_be_bytes();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = bytes[i % bytes.len()];
        }
    }
}

fn attrs() -> ChannelAttrs {
    ChannelAttrs { max_request_size: 4096, max_response_size: 4096, max_operations: 8, max_requests: 8 }
}

/// E3 — a write delegation held by one client conflicts with another
/// client's open, gets a recall marked, and is revoked if the holder never
/// returns it within the lease.
#[test]
fn e3_delegation_conflict_blocks_open_then_revokes_on_timeout() {
    let clock = Arc::new(FakeClock::new());
    let mgr = StateManager::new(
        StateManagerConfig::default(),
        1,
        Box::new(ClockHandle(clock.clone())),
        Box::new(CountingRng(AtomicU64::new(0))),
    );

    let holder = mgr.exchange_id(b"holder".to_vec(), [1; 8]);
    mgr.set_callback(
        holder,
        CallbackDescriptor { program: 0x4000_0001, net_id: "tcp".into(), uaddr: "127.0.0.1.8.1".into() },
    )
    .unwrap();
    mgr.set_cb_path_up(holder, true).unwrap();

    let file = FileHandle(b"shared-file".to_vec());
    let (_open_stateid, deleg) = mgr
        .open_file(holder, OwnerId(b"holder-owner".to_vec()), file.clone(), SHARE_ACCESS_WRITE, SHARE_DENY_NONE, false)
        .unwrap();
    let deleg = deleg.expect("write open with an up callback path should be granted a delegation");

    let other = mgr.exchange_id(b"other".to_vec(), [2; 8]);
    let err = mgr
        .open_file(other, OwnerId(b"other-owner".to_vec()), file, SHARE_ACCESS_READ, SHARE_DENY_NONE, false)
        .unwrap_err();
    assert_eq!(err, NfsStat4::Delay);

    // The holder never returns the delegation; once the lease-length
    // revocation timer elapses it's revoked outright.
    clock.advance(StateManagerConfig::default().lease_duration + Duration::from_secs(1));
    let revoked = mgr.revoke_expired_delegations();
    assert_eq!(revoked, vec![deleg]);
    assert_eq!(mgr.validate_stateid(&deleg), Err(NfsStat4::DelegRevoked));
}

struct ClockHandle(Arc<FakeClock>);

impl Clock for ClockHandle {
    fn now(&self) -> SystemTime {
        self.0.now()
    }

    fn monotonic_now(&self) -> Duration {
        self.0.monotonic_now()
    }
}

/// A writer that loops a `CB_COMPOUND` call straight back to the sender's
/// own completion path, standing in for a peer that always answers
/// `NFS4_OK` (E4's mock peer). Also records each frame it was handed so the
/// test can inspect the `CB_SEQUENCE` seqid it carried.
struct LoopbackWriter {
    sender: OnceLock<Weak<BackChannelSender>>,
    frames: Mutex<Vec<Vec<u8>>>,
}

#[async_trait::async_trait]
impl ConnWriter for LoopbackWriter {
    async fn write_framed(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.frames.lock().unwrap().push(bytes.to_vec());
        let xid = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        if let Some(sender) = self.sender.get().and_then(Weak::upgrade) {
            tokio::spawn(async move {
                sender.complete(xid, Ok(vec![0x00, 0x00, 0x00, 0x00])).await;
            });
        }
        Ok(())
    }
}

/// Pulls the `CB_SEQUENCE` `sequenceid` field out of a framed `CB_COMPOUND`
/// call: record mark(4) + RPC CALL header(24) + two `opaque_auth`(16) = 44
/// bytes of envelope, then tag(4) + minorversion(4) + opcount(4) +
/// opcode(4) + session_id(16) puts the seqid at byte 76.
fn sequenceid_of(frame: &[u8]) -> u32 {
    u32::from_be_bytes(frame[76..80].try_into().unwrap())
}

/// E4 — a back-channel send through a connected peer completes
/// successfully once the peer's reply is routed back by XID, and each send
/// carries a monotonically increasing `CB_SEQUENCE` seqid for the slot.
#[tokio::test]
async fn e4_back_channel_round_trip_through_connected_peer() {
    let writer = Arc::new(LoopbackWriter { sender: OnceLock::new(), frames: Mutex::new(Vec::new()) });
    let bound: BoundWriter = writer.clone();

    let sender = Arc::new(BackChannelSender::new(
        SessionId([7; 16]),
        0x4000_0001,
        Arc::new(dittofs_nfs4_state::state::session::SlotTable::new(attrs().max_requests)),
        8,
        vec![bound],
        Duration::from_secs(1),
    ));
    writer.sender.set(Arc::downgrade(&sender)).ok().unwrap();
    let handle = sender.clone().spawn();

    let rx = sender
        .try_enqueue(CbOp { opcode: 4, body: vec![0xDE, 0xAD, 0xBE, 0xEF] })
        .expect("queue has room");
    let result = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert_eq!(result, Ok(vec![0x00, 0x00, 0x00, 0x00]));

    let rx2 = sender
        .try_enqueue(CbOp { opcode: 4, body: vec![0xDE, 0xAD, 0xBE, 0xEF] })
        .expect("queue has room");
    let result2 = tokio::time::timeout(Duration::from_secs(2), rx2).await.unwrap().unwrap();
    assert_eq!(result2, Ok(vec![0x00, 0x00, 0x00, 0x00]));

    let frames = writer.frames.lock().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(sequenceid_of(&frames[0]), 1);
    assert_eq!(sequenceid_of(&frames[1]), 2);
    handle.abort();
}

/// A delegation conflict dispatches a real `CB_RECALL` through the holder's
/// registered back-channel sender rather than just marking the recall timer
/// (§4.6 "an asynchronous recall is dispatched").
#[tokio::test]
async fn conflicting_open_dispatches_cb_recall_over_back_channel() {
    let clock = Arc::new(FakeClock::new());
    let mgr = Arc::new(StateManager::new(
        StateManagerConfig::default(),
        1,
        Box::new(ClockHandle(clock.clone())),
        Box::new(CountingRng(AtomicU64::new(0))),
    ));

    let holder = mgr.exchange_id(b"holder".to_vec(), [1; 8]);
    mgr.set_cb_path_up(holder, true).unwrap();

    let file = FileHandle(b"shared-file".to_vec());
    let (_open_stateid, deleg) = mgr
        .open_file(holder, OwnerId(b"holder-owner".to_vec()), file.clone(), SHARE_ACCESS_WRITE, SHARE_DENY_NONE, false)
        .unwrap();
    assert!(deleg.is_some());

    let writer = Arc::new(LoopbackWriter { sender: OnceLock::new(), frames: Mutex::new(Vec::new()) });
    let bound: BoundWriter = writer.clone();
    let sender = Arc::new(BackChannelSender::new(
        SessionId([8; 16]),
        0x4000_0001,
        Arc::new(dittofs_nfs4_state::state::session::SlotTable::new(attrs().max_requests)),
        8,
        vec![bound],
        Duration::from_secs(1),
    ));
    writer.sender.set(Arc::downgrade(&sender)).ok().unwrap();
    let handle = sender.clone().spawn();
    mgr.register_back_channel(holder, sender);

    let other = mgr.exchange_id(b"other".to_vec(), [2; 8]);
    let err = mgr
        .open_file(other, OwnerId(b"other-owner".to_vec()), file, SHARE_ACCESS_READ, SHARE_DENY_NONE, false)
        .unwrap_err();
    assert_eq!(err, NfsStat4::Delay);

    // dispatch_recall fires synchronously but the send itself runs on the
    // sender's own task; give it a moment to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(writer.frames.lock().unwrap().len(), 1);
    handle.abort();
}

/// E5 — once the last expected client reclaims, grace ends immediately
/// (not at the timer) and the registered `onGraceEnd` callback fires
/// exactly once.
#[test]
fn e5_grace_ends_early_when_last_expected_client_reclaims() {
    let clock = Arc::new(FakeClock::new());
    let mgr = StateManager::new(
        StateManagerConfig::default(),
        1,
        Box::new(ClockHandle(clock.clone())),
        Box::new(CountingRng(AtomicU64::new(0))),
    );

    let a = mgr.exchange_id(b"a".to_vec(), [1; 8]);
    let b = mgr.exchange_id(b"b".to_vec(), [2; 8]);
    mgr.start_grace_period(HashSet::from([a, b]));
    assert!(mgr.grace_status());

    let fired = Arc::new(AtomicBool::new(false));
    let fired_cb = fired.clone();
    mgr.set_on_grace_end(Box::new(move || {
        fired_cb.store(true, Ordering::SeqCst);
    }));

    mgr.open_file(a, OwnerId(b"a-owner".to_vec()), FileHandle(b"fa".to_vec()), SHARE_ACCESS_READ, SHARE_DENY_NONE, true).unwrap();
    assert!(!fired.load(Ordering::SeqCst));
    assert!(mgr.grace_status());

    mgr.open_file(b, OwnerId(b"b-owner".to_vec()), FileHandle(b"fb".to_vec()), SHARE_ACCESS_READ, SHARE_DENY_NONE, true).unwrap();
    assert!(fired.load(Ordering::SeqCst));
    assert!(!mgr.grace_status());
}
