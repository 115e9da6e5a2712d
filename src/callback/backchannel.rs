//! Back-channel sender (C7): one per v4.1 client that negotiated a
//! back-channel, delivering `CB_COMPOUND` requests over an existing
//! connection (RFC 8881 §2.10.4, §20).

use super::rpc::{self, CbOp};
use crate::error::{NfsStat4, StateResult};
use crate::ids::SessionId;
use crate::state::session::{SlotOutcome, SlotTable};
use crate::traits::ConnWriter;
use async_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use whirlwind::ShardMap;

/// One queued callback request: the payload op, and the channel its result
/// is delivered on.
struct PendingSend {
    op: CbOp,
    result_tx: oneshot::Sender<StateResult<Vec<u8>>>,
}

/// Routes in-flight XIDs to the oneshot sender awaiting their reply. Kept
/// out of the primary state-manager lock entirely: the sender only ever
/// touches its own queue, slot table, and this router while I/O is in
/// flight (§5 "Back-channel sends acquire no state-manager lock during I/O").
type PendingReplies = ShardMap<u32, oneshot::Sender<StateResult<Vec<u8>>>>;

/// A single connection bound back-direction to this session, used for
/// writing framed callback messages.
pub type BoundWriter = Arc<dyn ConnWriter>;

/// Back-channel sender for one session. Spawned as its own task, matching
/// the teacher's `struct { fields }; spawn() -> JoinHandle; run(self)`
/// worker idiom.
pub struct BackChannelSender {
    session_id: SessionId,
    callback_program: u32,
    slot_table: Arc<SlotTable>,
    xid_counter: AtomicU32,
    pending: Arc<PendingReplies>,
    queue_tx: Sender<PendingSend>,
    queue_rx: Receiver<PendingSend>,
    writers: Vec<BoundWriter>,
    callback_timeout: Duration,
}

impl BackChannelSender {
    pub fn new(
        session_id: SessionId,
        callback_program: u32,
        slot_table: Arc<SlotTable>,
        queue_depth: usize,
        writers: Vec<BoundWriter>,
        callback_timeout: Duration,
    ) -> Self {
        let (queue_tx, queue_rx) = async_channel::bounded(queue_depth);
        Self {
            session_id,
            callback_program,
            slot_table,
            xid_counter: AtomicU32::new(1),
            pending: Arc::new(ShardMap::new()),
            queue_tx,
            queue_rx,
            writers,
            callback_timeout,
        }
    }

    /// Enqueues a callback op; returns `false` (queue full) so the caller
    /// falls back to the shortened revocation timer (§4.7 "Queue-full
    /// Enqueue returns false").
    pub fn try_enqueue(&self, op: CbOp) -> Option<oneshot::Receiver<StateResult<Vec<u8>>>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.queue_tx.try_send(PendingSend { op, result_tx }).ok()?;
        Some(result_rx)
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        while let Ok(pending) = self.queue_rx.recv().await {
            self.send_one(pending).await;
        }
    }

    async fn send_one(&self, pending: PendingSend) {
        let result = self.send_and_await(pending.op).await;
        let _ = pending.result_tx.send(result);
    }

    /// Steps 1-7 of §4.7: acquire a slot, build `CB_SEQUENCE` + payload into
    /// one `CB_COMPOUND`, frame as an RPC `CALL`, write through a
    /// back-bound connection (retrying on failure/timeout across the
    /// available writers), register the XID, await the reply.
    async fn send_and_await(&self, op: CbOp) -> StateResult<Vec<u8>> {
        let slot_id = 0u32; // single-slot back channel in this implementation
        let seqid = self.slot_table.next_seqid(slot_id)?;
        match self.slot_table.validate_sequence(slot_id, seqid).map_err(|_| NfsStat4::Delay)? {
            SlotOutcome::New => {}
            // The sender mints its own seqids, so a busy/out-of-order
            // outcome here means a concurrent send is already in flight.
            SlotOutcome::Retry(_) | SlotOutcome::RetryUncachedRep => return Err(NfsStat4::Delay),
        }

        let xid = self.xid_counter.fetch_add(1, Ordering::Relaxed);

        let seq_op = CbOp {
            opcode: CB_SEQUENCE_OPCODE,
            body: self.encode_cb_sequence(slot_id, seqid),
        };
        let compound = rpc::encode_cb_compound(1, 0, &[seq_op, op]);
        let framed = rpc::frame_call(xid, self.callback_program, 1, rpc::CB_COMPOUND_PROC, &compound);

        if self.writers.is_empty() {
            self.slot_table.abort_slot_request(slot_id).ok();
            return Err(NfsStat4::CbPathDown);
        }

        let mut last_err = NfsStat4::CbPathDown;
        for writer in &self.writers {
            let (tx, rx) = oneshot::channel();
            self.pending.insert(xid, tx).await;

            if writer.write_framed(&framed).await.is_err() {
                self.pending.remove(&xid).await;
                last_err = NfsStat4::CbPathDown;
                continue;
            }

            match tokio::time::timeout(self.callback_timeout, rx).await {
                Ok(Ok(Ok(reply))) => {
                    self.slot_table.complete_slot_request(slot_id, seqid, true, &reply).ok();
                    return Ok(reply);
                }
                Ok(Ok(Err(e))) => {
                    self.slot_table.abort_slot_request(slot_id).ok();
                    return Err(e);
                }
                _ => {
                    self.pending.remove(&xid).await;
                    last_err = NfsStat4::CbPathDown;
                }
            }
        }
        self.slot_table.abort_slot_request(slot_id).ok();
        Err(last_err)
    }

    fn encode_cb_sequence(&self, slot_id: u32, seqid: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        super::xdr::write_fixed(&mut buf, &self.session_id.0).unwrap();
        super::xdr::write_u32(&mut buf, seqid).unwrap();
        super::xdr::write_u32(&mut buf, slot_id).unwrap();
        super::xdr::write_u32(&mut buf, self.slot_table.target_highest_slotid()).unwrap();
        super::xdr::write_bool(&mut buf, false).unwrap(); // cachethis
        buf
    }

    /// Completes an in-flight send with a parsed reply, called by the
    /// connection's read loop when a framed message arrives on this
    /// session's back channel.
    pub async fn complete(&self, xid: u32, result: StateResult<Vec<u8>>) {
        if let Some(sender) = self.pending.remove(&xid).await {
            let _ = sender.send(result);
        }
    }

    /// Drains any still-queued sends and in-flight waiters with failure,
    /// then stops accepting new work.
    pub async fn stop(&self) {
        self.queue_tx.close();
        while let Ok(pending) = self.queue_rx.try_recv() {
            let _ = pending.result_tx.send(Err(NfsStat4::CbPathDown));
        }
    }
}

const CB_SEQUENCE_OPCODE: u32 = 11;
