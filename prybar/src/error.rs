use snafu::prelude::*;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure taxonomy shared by every subsystem.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("No target process is bound"))]
    NotOpen,

    #[snafu(display("The debug loop is not paused"))]
    NotPaused,

    #[snafu(display("The operating system denied access"))]
    AccessDenied,

    #[snafu(display(
        "Transferred {transferred} of {requested} bytes at {address:#x}"
    ))]
    PartialTransfer {
        address: u64,
        requested: usize,
        transferred: usize,
    },

    #[snafu(display("No instruction could be decoded at {address:#x}"))]
    DecodeFailure { address: u64 },

    #[snafu(display("No record exists for address {address:#x}"))]
    NotFound { address: u64 },

    #[snafu(display("No process named {name} is running"))]
    ProcessNotFound { name: String },

    #[snafu(display("No PE image header at {address:#x}"))]
    BadImage { address: u64 },

    #[snafu(display("The target terminated while the operation was in flight"))]
    Terminated,

    #[snafu(display("Engine invariant violated: {reason}"))]
    Internal { reason: &'static str },

    #[snafu(display("{call} failed with OS error {code}"))]
    Os { call: &'static str, code: u32 },
}

impl Error {
    /// Maps raw OS failures onto the taxonomy. Access-denied codes are folded
    /// into their own variant so callers can react to missing rights.
    pub fn from_os(call: &'static str, code: u32) -> Self {
        // ERROR_ACCESS_DENIED
        if code == 5 {
            Error::AccessDenied
        } else {
            Error::Os { call, code }
        }
    }
}
