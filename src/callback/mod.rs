//! Callback subsystem: the core's own narrow XDR/RPC surface for
//! `CB_COMPOUND` traffic (§1), the v4.1 back-channel sender (C7), and the
//! v4.0 dial-out fallback (C8).

pub mod backchannel;
pub mod dialout;
pub mod rpc;
pub mod xdr;
