//! Host-level errors: conditions where the emulator itself cannot proceed.
//!
//! These are distinct from architectural faults (see [`crate::exception`]),
//! which are delivered to emulated firmware through CFSR/HFSR/SFSR and never
//! surface as a Rust `Result`.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum EmulatorError {
    #[error(
        "flash image {path} ({size} bytes) does not fit at offset {offset:#x} in a {flash_size}-byte flash"
    )]
    ImageTooLarge {
        path: PathBuf,
        size: usize,
        offset: u32,
        flash_size: usize,
    },

    #[error("failed to read image {path}: {source}")]
    ImageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("MMIO region {new:?} overlaps already-registered region {existing:?}")]
    OverlappingMmioRegion {
        new: (u32, u32),
        existing: (u32, u32),
    },

    #[error("decoder diverged from capstone at pc={pc:#010x}: ours={ours} capstone={capstone}")]
    DecoderDivergence {
        pc: u32,
        ours: String,
        capstone: String,
    },

    #[error("invalid SoC configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, EmulatorError>;
