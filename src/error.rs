//! `nfsstat4` error taxonomy (RFC 7530 §13.1, RFC 8881 §15.1).
//!
//! The state manager never panics or unwinds across protocol logic; every
//! fallible operation returns one of these codes. Numeric values are part of
//! the wire and must not be renumbered.

use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;

/// Result alias used throughout the state manager.
pub type StateResult<T> = Result<T, NfsStat4>;

/// Typed `nfsstat4` error code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum NfsStat4 {
    Ok = 0,
    Perm = 1,
    NoEnt = 2,
    Io = 5,
    NxIo = 6,
    Access = 13,
    Exist = 17,
    XDev = 18,
    NotDir = 20,
    IsDir = 21,
    InvalidArgument = 22,
    FileTooLarge = 27,
    NoSpace = 28,
    ReadOnlyFs = 30,
    TooManyLinks = 31,
    NameTooLong = 63,
    NotEmpty = 66,
    DQuot = 69,
    Stale = 70,
    BadHandle = 10001,
    BadCookie = 10003,
    NotSupp = 10004,
    TooSmall = 10005,
    ServerFault = 10006,
    BadType = 10007,
    Delay = 10008,
    Same = 10009,
    Denied = 10010,
    Expired = 10011,
    Locked = 10012,
    Grace = 10013,
    FhExpired = 10014,
    ShareDenied = 10015,
    WrongSec = 10016,
    ClidInUse = 10017,
    ResourceExhausted = 10018,
    MoveD = 10019,
    NoFileHandle = 10020,
    MinorVerMismatch = 10021,
    StaleClientId = 10022,
    StaleStateid = 10023,
    OldStateid = 10024,
    BadStateid = 10025,
    BadSeqid = 10026,
    NotSame = 10027,
    LockRange = 10028,
    SymLink = 10029,
    ReadDirOnly = 10030,
    LeaseMoved = 10031,
    NoGrace = 10033,
    ReclaimBad = 10034,
    ReclaimConflict = 10035,
    BadXdr = 10036,
    LocksHeld = 10037,
    OpenMode = 10038,
    BadOwner = 10039,
    BadChar = 10040,
    BadName = 10041,
    BadRange = 10042,
    LockNotSupp = 10043,
    OpIllegal = 10044,
    LockDeadlock = 10045,
    FileOpen = 10046,
    AdminRevoked = 10047,
    CbPathDown = 10048,
    BadSession = 10052,
    BadSlot = 10053,
    CompleteAlready = 10054,
    NotBoundToSession = 10055,
    DelegAlreadyWanted = 10056,
    BackChanBusy = 10057,
    ClientIdBusy = 10059,
    SeqMisordered = 10063,
    DelegRevoked = 10087,
    RetryUncachedRep = 10111,
    TooMany = 10110,
}

impl NfsStat4 {
    /// Whether this code indicates success.
    pub fn is_ok(self) -> bool {
        matches!(self, NfsStat4::Ok)
    }
}

impl fmt::Display for NfsStat4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for NfsStat4 {}

/// Maps an externally-sourced store error onto the 1:1 subset of `nfsstat4`
/// codes reserved for not-found/conflict propagation (§7).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    Stale,
    BadHandle,
}

impl From<StoreError> for NfsStat4 {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => NfsStat4::NoEnt,
            StoreError::AlreadyExists => NfsStat4::Exist,
            StoreError::NotADirectory => NfsStat4::NotDir,
            StoreError::IsADirectory => NfsStat4::IsDir,
            StoreError::DirectoryNotEmpty => NfsStat4::NotEmpty,
            StoreError::Stale => NfsStat4::Stale,
            StoreError::BadHandle => NfsStat4::BadHandle,
        }
    }
}
