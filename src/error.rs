//! Errors that abort a harness run.
//!
//! Control-write failures are deliberately absent: those are logged and the
//! trial loop carries on (see `orchestrator`).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Console output contained a byte the Windows-1252 code page leaves
    /// undefined. The transcript is no longer trustworthy.
    #[error("console byte 0x{byte:02X} at stream offset {offset} is undefined in Windows-1252")]
    Decode { byte: u8, offset: u64 },

    /// Reading from the device session failed outright.
    #[error("failed to read from device session: {0}")]
    Read(#[source] io::Error),

    /// Opening, writing or renaming a trial log failed.
    #[error("trial log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_names_byte_and_offset() {
        let err = HarnessError::Decode {
            byte: 0x81,
            offset: 4100,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x81"), "{msg}");
        assert!(msg.contains("4100"), "{msg}");
    }

    #[test]
    fn log_error_keeps_io_source() {
        use std::error::Error as _;

        let err = HarnessError::Log {
            path: PathBuf::from("log_0_SUCCESS.txt"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("log_0_SUCCESS.txt"));
        assert!(err.source().is_some());
    }
}
