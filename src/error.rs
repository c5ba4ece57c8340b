use std::io;
use std::result;

/// Custom result type for store operations
pub type Result<T> = result::Result<T, Error>;

/// Result code for success.
pub const SUCCESS: i32 = 0;
/// Result code for the benign "true" outcome (e.g. inexact match).
pub const RESULT_TRUE: i32 = -1;

/// Store error codes
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("no matching key/data pair found")]
    NotFound,
    /// Requested page not found
    #[error("requested page not found")]
    PageNotFound,
    /// Database file is corrupted
    #[error("database file is corrupted")]
    Corrupted,
    /// Unrecoverable problem, the environment must be closed
    #[error("environment had fatal error")]
    Panic,
    /// Database version mismatch
    #[error("database file version mismatch")]
    VersionMismatch,
    /// File is not a valid data file
    #[error("file is not a valid data file")]
    Invalid,
    /// Environment upper size limit reached
    #[error("environment mapsize limit reached")]
    MapFull,
    /// Environment max tables limit reached
    #[error("environment maxdbs limit reached")]
    DbsFull,
    /// Environment max readers limit reached
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// Transaction has too many dirty pages
    #[error("transaction has too many dirty pages")]
    TxnFull,
    /// Cursor stack too deep
    #[error("cursor stack too deep")]
    CursorFull,
    /// Page has not enough space
    #[error("page has not enough space")]
    PageFull,
    /// The file could not be grown to the requested size
    #[error("unable to extend map size")]
    UnableExtendMapSize,
    /// Operation and table incompatible
    #[error("operation and table incompatible, or table flags mismatch")]
    Incompatible,
    /// Invalid reuse of reader slot
    #[error("invalid reuse of reader locktable slot")]
    BadRslot,
    /// Transaction must abort, or is otherwise invalid
    #[error("transaction must abort or is invalid")]
    BadTxn,
    /// Unsupported size of key, table name or data
    #[error("unsupported size of key/table name/data, or wrong DUPFIXED size")]
    BadValSize,
    /// The table handle was closed or changed unexpectedly
    #[error("the specified table handle is invalid or was changed")]
    BadDbi,
    /// Unexpected internal problem
    #[error("unexpected internal problem")]
    Problem,
    /// Another writer holds the lock, or the resource is in use
    #[error("resource busy")]
    Busy,
    /// The key has more than one value where one was expected
    #[error("key has multiple associated values")]
    MultiVal,
    /// Handle signature check failed
    #[error("bad signature of a runtime object")]
    BadSign,
    /// The file needs a write-mode consistency pass before it can be opened
    #[error("database should be recovered, but this could not be done in read-only mode")]
    WannaRecovery,
    /// Key does not match the cursor position, or append order is violated
    #[error("the given key value is mismatched to the current cursor position")]
    KeyMismatch,
    /// Value is too large for the current geometry
    #[error("database is too large for current system")]
    TooLarge,
    /// Transaction used from a thread other than its owner
    #[error("thread attempted to use a transaction owned by another thread")]
    ThreadMismatch,
    /// Overlapping transactions on one thread
    #[error("overlapping read and write transactions for the current thread")]
    TxnOverlapping,
    /// Invalid argument, or a cursor bound to a different transaction
    #[error("invalid argument")]
    InvalidArgument,
    /// Write attempted on a read-only transaction or environment
    #[error("permission denied")]
    Access,
    #[error("out of memory")]
    NoMemory,
    #[error("read-only file system")]
    ReadOnlyFs,
    #[error("operation not supported")]
    NotSupported,
    #[error("operation not permitted")]
    Permission,
    #[error("interrupted")]
    Interrupted,
    /// Requested data is not available in the current state
    #[error("no data available")]
    NoData,
    #[error("no such file or directory")]
    NotExists,
    /// Caller buffer cannot hold the value; nothing was changed
    #[error("output buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    /// The store or environment has been closed
    #[error("handle already closed")]
    Closed,
    /// A transaction callback panicked and the transaction was aborted
    #[error("transaction callback panicked: {0}")]
    Panicked(String),
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Key absent. Expected and non-fatal.
    NotFound,
    /// A limit was hit. Recoverable by caller policy.
    Capacity,
    /// Retryable contention.
    Busy,
    /// Programmer error: wrong thread, bad handle, bad arguments.
    Misuse,
    /// The environment must be closed and not reused.
    Fatal,
    /// Write attempted where only reads are allowed.
    ReadOnly,
    /// Operating system failure.
    System,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound | Error::NoData => ErrorKind::NotFound,
            Error::MapFull
            | Error::DbsFull
            | Error::ReadersFull
            | Error::TxnFull
            | Error::CursorFull
            | Error::PageFull
            | Error::UnableExtendMapSize
            | Error::TooLarge
            | Error::NoMemory => ErrorKind::Capacity,
            Error::Busy | Error::Interrupted => ErrorKind::Busy,
            Error::Panic
            | Error::Corrupted
            | Error::PageNotFound
            | Error::BadSign
            | Error::VersionMismatch
            | Error::Invalid
            | Error::WannaRecovery
            | Error::Problem => ErrorKind::Fatal,
            Error::Access | Error::ReadOnlyFs | Error::Permission => ErrorKind::ReadOnly,
            Error::Io(_) | Error::NotExists | Error::NotSupported => ErrorKind::System,
            Error::KeyExist
            | Error::Incompatible
            | Error::BadRslot
            | Error::BadTxn
            | Error::BadValSize
            | Error::BadDbi
            | Error::MultiVal
            | Error::KeyMismatch
            | Error::ThreadMismatch
            | Error::TxnOverlapping
            | Error::InvalidArgument
            | Error::BufferTooSmall { .. }
            | Error::Closed
            | Error::Panicked(_) => ErrorKind::Misuse,
        }
    }

    /// The environment must be closed (and possibly recovered) before reuse.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }

    /// Numeric status code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::KeyExist => -30799,
            Error::NotFound => -30798,
            Error::PageNotFound => -30797,
            Error::Corrupted => -30796,
            Error::Panic => -30795,
            Error::VersionMismatch => -30794,
            Error::Invalid => -30793,
            Error::MapFull => -30792,
            Error::DbsFull => -30791,
            Error::ReadersFull => -30790,
            Error::TxnFull => -30788,
            Error::CursorFull => -30787,
            Error::PageFull => -30786,
            Error::UnableExtendMapSize => -30785,
            Error::Incompatible => -30784,
            Error::BadRslot => -30783,
            Error::BadTxn => -30782,
            Error::BadValSize => -30781,
            Error::BadDbi => -30780,
            Error::Problem => -30779,
            Error::Busy => -30778,
            Error::MultiVal => -30421,
            Error::BadSign => -30420,
            Error::WannaRecovery => -30419,
            Error::KeyMismatch => -30418,
            Error::TooLarge => -30417,
            Error::ThreadMismatch => -30416,
            Error::TxnOverlapping => -30415,
            Error::Permission => 1,
            Error::NotExists => 2,
            Error::Interrupted => 4,
            Error::NoMemory => 12,
            Error::Access => 13,
            Error::InvalidArgument => 22,
            Error::ReadOnlyFs => 30,
            Error::NotSupported => 38,
            Error::NoData => 61,
            Error::BufferTooSmall { .. } => RESULT_TRUE,
            Error::Io(err) => err.raw_os_error().unwrap_or(5),
            Error::Closed | Error::Panicked(_) => 5,
        }
    }

    /// Maps a numeric status code back to an error. `SUCCESS` maps to `None`.
    pub fn from_code(code: i32) -> Option<Error> {
        let err = match code {
            SUCCESS => return None,
            -30799 => Error::KeyExist,
            -30798 => Error::NotFound,
            -30797 => Error::PageNotFound,
            -30796 => Error::Corrupted,
            -30795 => Error::Panic,
            -30794 => Error::VersionMismatch,
            -30793 => Error::Invalid,
            -30792 => Error::MapFull,
            -30791 => Error::DbsFull,
            -30790 => Error::ReadersFull,
            -30788 => Error::TxnFull,
            -30787 => Error::CursorFull,
            -30786 => Error::PageFull,
            -30785 => Error::UnableExtendMapSize,
            -30784 => Error::Incompatible,
            -30783 => Error::BadRslot,
            -30782 => Error::BadTxn,
            -30781 => Error::BadValSize,
            -30780 => Error::BadDbi,
            -30779 => Error::Problem,
            -30778 => Error::Busy,
            -30421 => Error::MultiVal,
            -30420 => Error::BadSign,
            -30419 => Error::WannaRecovery,
            -30418 => Error::KeyMismatch,
            -30417 => Error::TooLarge,
            -30416 => Error::ThreadMismatch,
            -30415 => Error::TxnOverlapping,
            1 => Error::Permission,
            2 => Error::NotExists,
            4 => Error::Interrupted,
            12 => Error::NoMemory,
            13 => Error::Access,
            22 => Error::InvalidArgument,
            30 => Error::ReadOnlyFs,
            38 => Error::NotSupported,
            61 => Error::NoData,
            other => Error::Io(io::Error::from_raw_os_error(other)),
        };
        Some(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotExists,
            io::ErrorKind::PermissionDenied => Error::Access,
            io::ErrorKind::Interrupted => Error::Interrupted,
            io::ErrorKind::OutOfMemory => Error::NoMemory,
            io::ErrorKind::Unsupported => Error::NotSupported,
            _ => Error::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_back() {
        for err in [
            Error::KeyExist,
            Error::NotFound,
            Error::MapFull,
            Error::Busy,
            Error::WannaRecovery,
            Error::ThreadMismatch,
            Error::Access,
            Error::InvalidArgument,
        ] {
            let code = err.code();
            let back = Error::from_code(code).map(|e| e.code());
            assert_eq!(back, Some(code), "{err}");
        }
        assert!(Error::from_code(SUCCESS).is_none());
    }

    #[test]
    fn classification() {
        assert_eq!(Error::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(Error::ReadersFull.kind(), ErrorKind::Capacity);
        assert!(Error::Busy.is_retryable());
        assert!(Error::Corrupted.is_fatal());
        assert!(!Error::KeyExist.is_fatal());
        assert_eq!(Error::ThreadMismatch.kind(), ErrorKind::Misuse);
        assert_eq!(Error::Access.kind(), ErrorKind::ReadOnly);
    }

    #[test]
    fn io_errors_are_classified() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::NotExists));
        let err: Error = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert_eq!(err.kind(), ErrorKind::System);
    }
}
