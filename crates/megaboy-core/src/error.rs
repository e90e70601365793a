use std::io;

use thiserror::Error;

/// Error kinds surfaced by load operations.
///
/// Mid-emulation there are no recoverable errors: malformed guest accesses
/// produce defined values (usually 0xFF), never an `Err`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Size out of bounds, unknown MBC code, or header bank count
    /// inconsistent with the file size.
    #[error("invalid ROM: {0}")]
    InvalidRom(&'static str),

    /// Battery file length inconsistent with the cartridge RAM size.
    #[error("battery file does not match cartridge RAM size")]
    InvalidBattery,

    /// Save-state magic/version mismatch or truncated sub-state record.
    #[error("corrupt save state: {0}")]
    CorruptSaveState(&'static str),

    /// Save state references a ROM checksum other than the loaded ROM's.
    #[error("save state does not belong to the loaded ROM")]
    RomNotFound,

    /// I/O failure from the host.
    #[error("file error: {0}")]
    FileError(#[from] io::Error),
}
