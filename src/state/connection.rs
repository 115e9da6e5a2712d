//! Connection binder (C4): BIND_CONN_TO_SESSION direction negotiation and
//! per-session connection bookkeeping (RFC 8881 §18.34).

use crate::error::{NfsStat4, StateResult};
use crate::ids::SessionId;
use std::collections::{HashMap, HashSet};

/// Direction a connection asks to be bound for (RFC 8881 `channel_dir_from_client4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedDirection {
    Fore,
    Back,
    ForeOrBoth,
    BackOrBoth,
}

/// Direction actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantedDirection {
    Fore,
    Back,
    Both,
}

/// One connection's binding state for one session.
#[derive(Debug, Clone, Copy)]
struct Binding {
    direction: GrantedDirection,
}

/// Tracks which connections are bound to which session and in which
/// direction, and enforces the per-session connection cap (§3a
/// `max_connections_per_session`).
#[derive(Default)]
pub struct ConnectionBinder {
    /// session -> (connection id -> binding)
    by_session: HashMap<SessionId, HashMap<u64, Binding>>,
    /// connection -> session it is currently bound to, for fast unbind on
    /// rebind-elsewhere (§4.4 "rebind to a different session silently
    /// unbinds from the first", E6).
    by_connection: HashMap<u64, SessionId>,
}

impl ConnectionBinder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fore_count(session_conns: &HashMap<u64, Binding>, exclude: Option<u64>) -> usize {
        session_conns
            .iter()
            .filter(|(id, b)| {
                Some(**id) != exclude
                    && matches!(b.direction, GrantedDirection::Fore | GrantedDirection::Both)
            })
            .count()
    }

    /// Binds `connection` to `session` in the requested direction, applying
    /// the grant policy (§4.4):
    /// - `FORE` / `BACK` are granted as asked.
    /// - `FORE_OR_BOTH` / `BACK_OR_BOTH` grant `BOTH` if the session has a
    ///   back channel, else fall back to the non-"both" half.
    /// - Rebinding the same connection to a session it's already bound to
    ///   just updates the direction.
    /// - Rebinding to a different session silently unbinds the connection
    ///   from wherever it was.
    /// - Would this be the session's last fore-channel connection turned
    ///   back-only, the bind is rejected with `INVAL` (unconfirmed by RFC
    ///   text but matches widely deployed server behavior; see DESIGN.md).
    pub fn bind(
        &mut self,
        session: SessionId,
        session_has_back_channel: bool,
        connection: u64,
        requested: RequestedDirection,
        max_connections_per_session: u32,
    ) -> StateResult<GrantedDirection> {
        if let Some(prev_session) = self.by_connection.get(&connection).copied() {
            if prev_session != session {
                self.unbind(prev_session, connection);
            }
        }

        let granted = match requested {
            RequestedDirection::Fore => GrantedDirection::Fore,
            RequestedDirection::Back => GrantedDirection::Back,
            RequestedDirection::ForeOrBoth => {
                if session_has_back_channel {
                    GrantedDirection::Both
                } else {
                    GrantedDirection::Fore
                }
            }
            RequestedDirection::BackOrBoth => {
                if session_has_back_channel {
                    GrantedDirection::Both
                } else {
                    GrantedDirection::Back
                }
            }
        };

        let conns = self.by_session.entry(session).or_default();
        let already_bound_here = conns.contains_key(&connection);

        if matches!(granted, GrantedDirection::Back) {
            let remaining_fore = Self::fore_count(conns, Some(connection));
            if remaining_fore == 0 {
                return Err(NfsStat4::InvalidArgument);
            }
        }

        if !already_bound_here
            && max_connections_per_session != 0
            && conns.len() as u32 >= max_connections_per_session
        {
            return Err(NfsStat4::ResourceExhausted);
        }

        conns.insert(connection, Binding { direction: granted });
        self.by_connection.insert(connection, session);
        Ok(granted)
    }

    /// Unbinds one connection from one session (no-op if not bound there).
    pub fn unbind(&mut self, session: SessionId, connection: u64) {
        if let Some(conns) = self.by_session.get_mut(&session) {
            conns.remove(&connection);
            if conns.is_empty() {
                self.by_session.remove(&session);
            }
        }
        if self.by_connection.get(&connection) == Some(&session) {
            self.by_connection.remove(&connection);
        }
    }

    /// Unbinds every connection from a destroyed session.
    pub fn destroy_session(&mut self, session: SessionId) {
        if let Some(conns) = self.by_session.remove(&session) {
            for conn in conns.keys() {
                self.by_connection.remove(conn);
            }
        }
    }

    pub fn connections_for(&self, session: SessionId) -> HashSet<u64> {
        self.by_session
            .get(&session)
            .map(|conns| conns.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn direction_of(&self, session: SessionId, connection: u64) -> Option<GrantedDirection> {
        self.by_session.get(&session)?.get(&connection).map(|b| b.direction)
    }
}
