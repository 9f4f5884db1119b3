//! Mapping from engine errors to the wire status codes.

use gv_core::status;
use rocksdb::ErrorKind;

pub fn code_for(err: &rocksdb::Error) -> i32 {
    match err.kind() {
        ErrorKind::NotFound => status::NOT_FOUND,
        ErrorKind::Corruption => status::CORRUPTION,
        ErrorKind::NotSupported => status::NOT_SUPPORTED,
        ErrorKind::InvalidArgument => status::INVALID_ARGUMENT,
        ErrorKind::IOError => status::IO_ERROR,
        ErrorKind::MergeInProgress => status::MERGE_IN_PROGRESS,
        ErrorKind::Incomplete => status::INCOMPLETE,
        ErrorKind::ShutdownInProgress => status::SHUTDOWN_IN_PROGRESS,
        ErrorKind::TimedOut => status::TIMED_OUT,
        ErrorKind::Aborted => status::ABORTED,
        ErrorKind::Busy => status::BUSY,
        ErrorKind::Expired => status::EXPIRED,
        ErrorKind::TryAgain => status::TRY_AGAIN,
        _ => status::IO_ERROR,
    }
}
