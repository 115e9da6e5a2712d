//! NFSv4.0/4.1 state manager and callback subsystem: client registry,
//! leases, sessions, open/lock state, delegations, and grace recovery.

pub mod callback;
pub mod config;
pub mod error;
pub mod ids;
pub mod snapshot;
pub mod state;
pub mod traits;

pub use error::{NfsStat4, StateResult};
pub use state::StateManager;
