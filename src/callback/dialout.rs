//! v4.0 dial-out callback (C8): per-call connection to the client's
//! registered callback address, used only when no v4.1 back-channel sender
//! exists (RFC 7530 §18.36, §20.4).

use super::rpc::{self, AcceptStat};
use crate::error::{NfsStat4, StateResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Parses an RFC 5665 universal address for `tcp`/`tcp6` network IDs (§4.8):
/// `h1.h2.h3.h4.p1.p2` for IPv4; for `tcp6` the same trailing `.p1.p2`
/// appended to a colon-separated IPv6 literal (so splitting on `.` yields
/// the address as a single leading part, then the two port octets).
pub fn parse_uaddr(net_id: &str, uaddr: &str) -> Option<SocketAddr> {
    let parts: Vec<&str> = uaddr.split('.').collect();
    if parts.len() < 2 {
        return None;
    }
    let (head, port_octets) = parts.split_at(parts.len() - 2);
    let p1: u16 = port_octets[0].parse().ok()?;
    let p2: u16 = port_octets[1].parse().ok()?;
    let port = p1 * 256 + p2;

    match net_id {
        "tcp" => {
            if head.len() != 4 {
                return None;
            }
            let octets: Vec<u8> = head.iter().map(|s| s.parse().ok()).collect::<Option<_>>()?;
            Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])),
                port,
            ))
        }
        "tcp6" => {
            if head.len() != 1 {
                return None;
            }
            let ip: Ipv6Addr = head[0].parse().ok()?;
            Some(SocketAddr::new(IpAddr::V6(ip), port))
        }
        _ => None,
    }
}

/// Dials the holder, sends a single-fragment `CB_COMPOUND`, and returns the
/// parsed `nfsstat4` from the reply (§4.8). `callback_ident` is always 0 in
/// this implementation (single callback channel per client).
pub async fn send_dialout_cb_compound(
    addr: SocketAddr,
    program: u32,
    xid: u32,
    ops: &[super::rpc::CbOp],
    deadline: Duration,
) -> StateResult<Vec<u8>> {
    let compound = rpc::encode_cb_compound(0, 0, ops);
    let framed = rpc::frame_call(xid, program, 1, rpc::CB_COMPOUND_PROC, &compound);

    let mut stream = tokio::time::timeout(deadline, TcpStream::connect(addr))
        .await
        .map_err(|_| NfsStat4::CbPathDown)?
        .map_err(|_| NfsStat4::CbPathDown)?;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    tokio::time::timeout(deadline, stream.write_all(&framed))
        .await
        .map_err(|_| NfsStat4::CbPathDown)?
        .map_err(|_| NfsStat4::CbPathDown)?;

    let mut mark_buf = [0u8; 4];
    tokio::time::timeout(deadline, stream.read_exact(&mut mark_buf))
        .await
        .map_err(|_| NfsStat4::CbPathDown)?
        .map_err(|_| NfsStat4::CbPathDown)?;
    let mark = u32::from_be_bytes(mark_buf);
    let (len, _last) = super::xdr::parse_record_mark(mark);

    let mut body = vec![0u8; len as usize];
    tokio::time::timeout(deadline, stream.read_exact(&mut body))
        .await
        .map_err(|_| NfsStat4::CbPathDown)?
        .map_err(|_| NfsStat4::CbPathDown)?;

    let mut full = Vec::with_capacity(4 + body.len());
    full.extend_from_slice(&mark_buf);
    full.extend_from_slice(&body);
    let reply = rpc::parse_reply(&full).map_err(|_| NfsStat4::CbPathDown)?;
    if reply.accept_stat != AcceptStat::Success {
        return Err(NfsStat4::CbPathDown);
    }
    Ok(reply.payload)
}

/// Verifies the callback path with `CB_NULL` (no args, status-only reply).
/// Success sets `cb_path_up` on the caller's client record.
pub async fn verify_cb_null(addr: SocketAddr, program: u32, deadline: Duration) -> bool {
    tokio::time::timeout(deadline, async {
        let mut stream = TcpStream::connect(addr).await.ok()?;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let framed = rpc::encode_cb_null_call(1, program);
        stream.write_all(&framed).await.ok()?;

        let mut mark_buf = [0u8; 4];
        stream.read_exact(&mut mark_buf).await.ok()?;
        let mark = u32::from_be_bytes(mark_buf);
        let (len, _) = super::xdr::parse_record_mark(mark);
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await.ok()?;

        let mut full = Vec::with_capacity(4 + body.len());
        full.extend_from_slice(&mark_buf);
        full.extend_from_slice(&body);
        let reply = rpc::parse_reply(&full).ok()?;
        Some(reply.accept_stat == AcceptStat::Success)
    })
    .await
    .ok()
    .flatten()
    .unwrap_or(false)
}
