//! RPC CALL/REPLY framing for callback traffic: `rpc_msg`, `call_body`,
//! `accepted_reply`, `opaque_auth` (RFC 5531 §8-9), and `CB_COMPOUND`
//! (§4.7, §4.8).

use super::xdr::{
    parse_record_mark, read_bool, read_fixed, read_opaque, read_u32, record_mark, write_bool,
    write_fixed, write_opaque, write_u32,
};
use crate::ids::{FileHandle, StateId};
use crate::state::delegation::DirChangeEvent;
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};

pub const CB_COMPOUND_PROC: u32 = 1;
pub const CB_NULL_PROC: u32 = 0;

/// Callback opcodes this core emits (RFC 8881 §20).
pub const CB_RECALL_OPCODE: u32 = 4;
pub const CB_NOTIFY_OPCODE: u32 = 6;

/// `opaque_auth` with flavor `AUTH_NONE`: the core never authenticates
/// callback traffic (§4.7 "AUTH_NULL credentials").
pub fn write_auth_none(dst: &mut impl Write) -> io::Result<()> {
    write_u32(dst, 0)?; // AUTH_NONE
    write_opaque(dst, &[])
}

fn read_auth(src: &mut impl Read) -> io::Result<()> {
    read_u32(src)?;
    read_opaque(src)?;
    Ok(())
}

/// One operation inside a `CB_COMPOUND`: an opcode plus its already-encoded
/// XDR argument/result body.
#[derive(Debug, Clone)]
pub struct CbOp {
    pub opcode: u32,
    pub body: Vec<u8>,
}

/// Builds a `CB_COMPOUND` argument list (tag empty, given minor version,
/// ops in order; §6 "CB_COMPOUND args").
pub fn encode_cb_compound(minorversion: u32, callback_ident: u32, ops: &[CbOp]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_opaque(&mut buf, &[]).unwrap(); // tag
    write_u32(&mut buf, minorversion).unwrap();
    if minorversion == 0 {
        write_u32(&mut buf, callback_ident).unwrap();
    }
    write_u32(&mut buf, ops.len() as u32).unwrap();
    for op in ops {
        write_u32(&mut buf, op.opcode).unwrap();
        buf.extend_from_slice(&op.body);
    }
    buf
}

/// Wraps a CB_COMPOUND body in a full RPC `CALL` message and a record-mark
/// framed fragment with the last-fragment bit set (§4.7 steps 2-3).
pub fn frame_call(xid: u32, program: u32, version: u32, procedure: u32, args: &[u8]) -> Vec<u8> {
    let mut msg = Vec::new();
    write_u32(&mut msg, xid).unwrap();
    write_u32(&mut msg, 0).unwrap(); // CALL
    write_u32(&mut msg, 2).unwrap(); // rpcvers
    write_u32(&mut msg, program).unwrap();
    write_u32(&mut msg, version).unwrap();
    write_u32(&mut msg, procedure).unwrap();
    write_auth_none(&mut msg).unwrap(); // credential
    write_auth_none(&mut msg).unwrap(); // verifier
    msg.extend_from_slice(args);

    let mut framed = Vec::with_capacity(msg.len() + 4);
    write_u32(&mut framed, record_mark(msg.len() as u32, true)).unwrap();
    framed.extend_from_slice(&msg);
    framed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptStat {
    Success,
    ProgUnavail,
    ProgMismatch,
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    Other(u32),
}

impl From<u32> for AcceptStat {
    fn from(v: u32) -> Self {
        match v {
            0 => AcceptStat::Success,
            1 => AcceptStat::ProgUnavail,
            2 => AcceptStat::ProgMismatch,
            3 => AcceptStat::ProcUnavail,
            4 => AcceptStat::GarbageArgs,
            5 => AcceptStat::SystemErr,
            other => AcceptStat::Other(other),
        }
    }
}

/// A parsed RPC reply: the XID it answers, the accept status, and (on
/// success) the remaining payload — the CB_COMPOUND result, left unparsed
/// for the caller to interpret per-opcode.
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub xid: u32,
    pub accept_stat: AcceptStat,
    pub payload: Vec<u8>,
}

/// Reads one complete record-marked fragment and parses it as an RPC
/// `REPLY` (§4.7 step 6: "fragment header -> RPC reply header -> accept
/// stat -> nfsstat4"). Only single-fragment replies are supported; callback
/// replies are always small enough to fit one fragment.
pub fn parse_reply(framed: &[u8]) -> io::Result<RpcReply> {
    let mut cursor = Cursor::new(framed);
    let mark = read_u32(&mut cursor)?;
    let (len, last) = parse_record_mark(mark);
    if !last {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "multi-fragment callback reply unsupported"));
    }
    let body_start = cursor.position() as usize;
    let body_end = body_start + len as usize;
    let body = framed
        .get(body_start..body_end)
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "short reply fragment"))?;
    let mut body_cursor = Cursor::new(body);

    let xid = read_u32(&mut body_cursor)?;
    let msg_type = read_u32(&mut body_cursor)?;
    if msg_type != 1 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "expected REPLY message"));
    }
    let reply_stat = read_u32(&mut body_cursor)?;
    if reply_stat != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "MSG_DENIED"));
    }
    read_auth(&mut body_cursor)?; // verifier
    let accept_stat = AcceptStat::from(read_u32(&mut body_cursor)?);

    let mut payload = Vec::new();
    body_cursor.read_to_end(&mut payload)?;
    Ok(RpcReply { xid, accept_stat, payload })
}

/// `CB_NULL`: no args, status-only reply (§4.8).
pub fn encode_cb_null_call(xid: u32, program: u32) -> Vec<u8> {
    frame_call(xid, program, 1, CB_NULL_PROC, &[])
}

pub fn read_bool_from(bytes: &[u8]) -> io::Result<bool> {
    let mut cursor = Cursor::new(bytes);
    read_bool(&mut cursor)
}

pub fn read_stateid_other(bytes: &[u8]) -> io::Result<[u8; 12]> {
    let mut cursor = Cursor::new(bytes);
    read_fixed::<12>(&mut cursor)
}

/// Writes a `stateid4`: 4-byte seqid + 12-byte `other`, with no length
/// prefix (it's a fixed-size XDR struct, not an `opaque<>`).
fn write_stateid(dst: &mut impl Write, stateid: &StateId) -> io::Result<()> {
    write_u32(dst, stateid.seqid)?;
    write_fixed(dst, &stateid.other)
}

/// `CB_RECALL` op body: stateid, truncate, filehandle (§4.6 "an asynchronous
/// recall is dispatched").
pub fn encode_cb_recall(stateid: &StateId, truncate: bool, fh: &FileHandle) -> Vec<u8> {
    let mut buf = Vec::new();
    write_stateid(&mut buf, stateid).unwrap();
    write_bool(&mut buf, truncate).unwrap();
    write_opaque(&mut buf, &fh.0).unwrap();
    buf
}

fn dir_change_type_tag(event: &DirChangeEvent) -> u32 {
    match event {
        DirChangeEvent::AddEntry { .. } => 1,
        DirChangeEvent::RemoveEntry { .. } => 2,
        DirChangeEvent::RenameEntry { .. } => 3,
        DirChangeEvent::ChildAttrChange { .. } => 4,
        DirChangeEvent::DirAttrChange => 5,
    }
}

fn dir_change_value(event: &DirChangeEvent) -> Vec<u8> {
    let mut buf = Vec::new();
    match event {
        DirChangeEvent::AddEntry { name }
        | DirChangeEvent::RemoveEntry { name }
        | DirChangeEvent::ChildAttrChange { name } => {
            write_opaque(&mut buf, name).unwrap();
        }
        DirChangeEvent::RenameEntry { from, to } => {
            write_opaque(&mut buf, from).unwrap();
            write_opaque(&mut buf, to).unwrap();
        }
        DirChangeEvent::DirAttrChange => {}
    }
    buf
}

/// `CB_NOTIFY` op body: entries grouped by type, each group a `{mask:
/// bitmap, values: opaque<>[]}`, groups sorted by type for deterministic
/// emission (§6). A `bitmap` is the XDR `4-byte count + count * uint32`
/// form; each group's mask is a single-word bitmap naming its type tag.
pub fn encode_cb_notify(events: &[DirChangeEvent]) -> Vec<u8> {
    let mut groups: BTreeMap<u32, Vec<&DirChangeEvent>> = BTreeMap::new();
    for event in events {
        groups.entry(dir_change_type_tag(event)).or_default().push(event);
    }

    let mut buf = Vec::new();
    write_u32(&mut buf, groups.len() as u32).unwrap();
    for (tag, members) in groups {
        write_u32(&mut buf, 1).unwrap(); // bitmap word count
        write_u32(&mut buf, tag).unwrap();
        write_u32(&mut buf, members.len() as u32).unwrap();
        for member in members {
            write_opaque(&mut buf, &dir_change_value(member)).unwrap();
        }
    }
    buf
}
