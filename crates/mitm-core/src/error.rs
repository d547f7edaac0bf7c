use thiserror::Error;

/// Why a buffer could not be decoded.
///
/// Any of these stops the decode pass at the failing record; records before
/// it are still reported. The relay forwards the original bytes untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error(
        "truncated record opcode=0x{opcode:04x} offset={offset} needed={needed} remaining={remaining}"
    )]
    TruncatedRecord {
        opcode: u16,
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("invalid length prefix opcode=0x{opcode:04x} offset={offset} length={length}")]
    InvalidLength {
        opcode: u16,
        offset: usize,
        length: i64,
    },

    #[error("string is not utf-8 opcode=0x{opcode:04x} offset={offset}")]
    InvalidString { opcode: u16, offset: usize },
}

/// Rejected opcode table.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("opcode 0x{opcode:04x} bound twice for {direction}")]
    Duplicate {
        opcode: u16,
        direction: crate::Direction,
    },

    #[error("layout {layout} cannot decode {direction} traffic (opcode 0x{opcode:04x})")]
    WrongDirection {
        opcode: u16,
        layout: crate::protocol::Layout,
        direction: crate::Direction,
    },

    #[error("no opcode bound for {0} traffic")]
    Empty(crate::Direction),

    #[error("invalid opcode {0:?}")]
    InvalidOpcode(String),

    #[error("failed to parse opcode table: {0}")]
    Parse(#[from] toml::de::Error),
}
