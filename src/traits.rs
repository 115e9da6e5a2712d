//! Narrow capability traits for the state manager's external collaborators
//! (§6, §9 "Dynamic dispatch"). Each trait's method set is restricted to what
//! the core actually invokes, so test doubles never implement unused
//! methods.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

/// Writes framed bytes to the transport that owns a connection (§6
/// `ConnWriter`). The state manager never touches sockets directly; the
/// back-channel sender and dial-out callback both go through this.
#[async_trait]
pub trait ConnWriter: Send + Sync {
    /// Writes one already-framed message (record mark included).
    async fn write_framed(&self, bytes: &[u8]) -> std::io::Result<()>;
}

/// Principal-to-user identity mapping (out of core scope beyond this
/// narrow lookup; §1).
pub trait IdMapper: Send + Sync {
    fn map_principal(&self, principal: &str) -> Option<u32>;
}

/// Monotonic and wall clock, injectable so lease/recall/grace timers are
/// deterministic in tests (§6 `Clock`).
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn monotonic_now(&self) -> Duration;
}

/// Production [`Clock`] backed by `std::time`.
#[derive(Default)]
pub struct SystemClock {
    start: std::sync::OnceLock<std::time::Instant>,
}

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> Duration {
        let start = self.start.get_or_init(std::time::Instant::now);
        start.elapsed()
    }
}

/// Cryptographic randomness for confirm verifiers and stateid counters (§6
/// `Rng`, §4.1 "drawn from a cryptographically strong RNG; zero verifiers
/// are forbidden").
pub trait Rng: Send + Sync {
    fn fill_bytes(&self, buf: &mut [u8]);

    /// An 8-byte verifier, guaranteed non-zero.
    fn verifier(&self) -> [u8; 8] {
        loop {
            let mut buf = [0u8; 8];
            self.fill_bytes(&mut buf);
            if buf != [0u8; 8] {
                return buf;
            }
        }
    }
}

/// Production [`Rng`] backed by the OS CSPRNG.
#[derive(Default)]
pub struct OsRng;

impl Rng for OsRng {
    fn fill_bytes(&self, buf: &mut [u8]) {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(buf);
    }
}
