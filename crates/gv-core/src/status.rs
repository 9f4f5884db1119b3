//! Storage-engine status codes carried over the wire.
//!
//! The engine's native codes pass through the RPC layer opaquely; both sides
//! only need to agree on the integers.

pub const OK: i32 = 0;
pub const NOT_FOUND: i32 = 1;
pub const CORRUPTION: i32 = 2;
pub const NOT_SUPPORTED: i32 = 3;
pub const INVALID_ARGUMENT: i32 = 4;
pub const IO_ERROR: i32 = 5;
pub const MERGE_IN_PROGRESS: i32 = 6;
pub const INCOMPLETE: i32 = 7;
pub const SHUTDOWN_IN_PROGRESS: i32 = 8;
pub const TIMED_OUT: i32 = 9;
pub const ABORTED: i32 = 10;
pub const BUSY: i32 = 11;
pub const EXPIRED: i32 = 12;
pub const TRY_AGAIN: i32 = 13;

pub fn name(code: i32) -> &'static str {
    match code {
        OK => "ok",
        NOT_FOUND => "not found",
        CORRUPTION => "corruption",
        NOT_SUPPORTED => "not supported",
        INVALID_ARGUMENT => "invalid argument",
        IO_ERROR => "io error",
        MERGE_IN_PROGRESS => "merge in progress",
        INCOMPLETE => "incomplete",
        SHUTDOWN_IN_PROGRESS => "shutdown in progress",
        TIMED_OUT => "timed out",
        ABORTED => "aborted",
        BUSY => "busy",
        EXPIRED => "expired",
        TRY_AGAIN => "try again",
        _ => "unknown",
    }
}
