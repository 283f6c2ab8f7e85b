//! The kernel-wide return-code taxonomy (§6).
//!
//! Errors fall into two classes, per §7: *programmer errors*
//! ([`Error::WrongParameter`], [`Error::IllegalUse`], [`Error::InvalidObject`],
//! [`Error::InterruptContext`]) are reported at the service boundary without
//! mutating kernel state, while *runtime events* ([`Error::Timeout`],
//! [`Error::Overflow`], [`Error::Deleted`], [`Error::Forced`]) are the normal
//! way a waiting service reports something other than success.
use core::fmt;

/// A kernel service result.
pub type Result<T> = core::result::Result<T, Error>;

/// The flat return-code taxonomy shared by every kernel service (§6).
///
/// There is deliberately one enum for the whole kernel rather than one
/// subtype per service, unlike the per-call error unions some desktop-class
/// kernels use — §6 asks for a single taxonomy.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The wait timed out before the condition was satisfied.
    Timeout,
    /// A counting primitive would exceed its configured maximum.
    Overflow,
    /// An argument is out of range or otherwise malformed.
    WrongParameter,
    /// The operation is not legal in the object's current state (e.g.
    /// recursively locking a non-recursive mutex).
    IllegalUse,
    /// The object handle does not refer to a live object (identity tag
    /// mismatch or the object was never created).
    InvalidObject,
    /// The caller does not hold the object it tried to release.
    NotOwned,
    /// The waited-for object was deleted while the caller was blocked on it.
    Deleted,
    /// The wait was cancelled by an explicit `release_wait`/task deletion.
    Forced,
    /// The service was called from ISR context but requires task context
    /// (or vice versa).
    InterruptContext,
    /// An invariant the kernel relies on was violated; this indicates a
    /// kernel bug rather than caller misuse.
    Internal,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Timeout => "wait timed out",
            Error::Overflow => "value would overflow its maximum",
            Error::WrongParameter => "wrong parameter",
            Error::IllegalUse => "illegal use of the object in its current state",
            Error::InvalidObject => "invalid or stale object handle",
            Error::NotOwned => "caller does not own the object",
            Error::Deleted => "the object was deleted while the caller waited on it",
            Error::Forced => "the wait was forcibly released",
            Error::InterruptContext => "service not callable from this execution context",
            Error::Internal => "internal kernel error",
        };
        f.write_str(s)
    }
}

/// The outcome of a completed wait, stashed in [`crate::task::Task::wait_result`]
/// by whoever completes the wait and read back by the primitive that blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ok,
    Timeout,
    Deleted,
    Forced,
}

impl WaitResult {
    /// Convert to the [`Error`] a blocking service should return, or `Ok(())`
    /// on success.
    pub fn into_result(self) -> Result<()> {
        match self {
            WaitResult::Ok => Ok(()),
            WaitResult::Timeout => Err(Error::Timeout),
            WaitResult::Deleted => Err(Error::Deleted),
            WaitResult::Forced => Err(Error::Forced),
        }
    }
}
