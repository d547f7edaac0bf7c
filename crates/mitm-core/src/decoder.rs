//! Segments a captured buffer into protocol records.
//!
//! The protocol has no frame length: records are `opcode:u16le` followed by
//! an opcode-specific payload, packed back to back. When the opcode at the
//! cursor is not bound for the buffer's direction the decoder cannot know
//! where the next record starts, so it gives up one byte at a time until an
//! opcode it knows lines up again.

use std::fmt::Write as _;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::error::{DecodeError, TableError};
use crate::hex::{escape_bytes, hex_all};
use crate::injection::InjectionEntry;
use crate::protocol::reader::FieldReader;
use crate::protocol::{
    Direction, DispatchTable, Layout, Record, SERVER_TRAILER_LEN, item_pickup_packet,
};

/// Entities whose name contains this marker are lootable drops.
const LOOT_MARKER: &str = "Drop";

/// Bytes that did not line up with any bound opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecognizedRun {
    /// Offset of the first byte in the decoded (trailer-stripped) buffer.
    pub offset: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Record(Record),
    Unrecognized(UnrecognizedRun),
}

/// Result of one decode pass over one buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub direction: Direction,
    pub table_version: u64,
    pub events: Vec<DecodeEvent>,
    /// Trailing byte left when fewer than two remain and no run was open.
    pub residual: Vec<u8>,
    /// Pickup packets to queue toward the server.
    pub auto_loot: Vec<InjectionEntry>,
}

impl Decoded {
    fn empty(direction: Direction, table_version: u64) -> Self {
        Self {
            direction,
            table_version,
            events: Vec::new(),
            residual: Vec::new(),
            auto_loot: Vec::new(),
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.events.iter().filter_map(|event| match event {
            DecodeEvent::Record(record) => Some(record),
            DecodeEvent::Unrecognized(_) => None,
        })
    }

    pub fn unrecognized(&self) -> impl Iterator<Item = &UnrecognizedRun> {
        self.events.iter().filter_map(|event| match event {
            DecodeEvent::Unrecognized(run) => Some(run),
            DecodeEvent::Record(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.residual.is_empty()
    }

    /// Worth showing at info level: contains unknown bytes, a notable record
    /// or triggered auto-loot.
    pub fn is_notable(&self) -> bool {
        !self.auto_loot.is_empty()
            || self.events.iter().any(|event| match event {
                DecodeEvent::Record(record) => record.layout.is_notable(),
                DecodeEvent::Unrecognized(_) => true,
            })
    }

    /// Multi-line operator trace. The raw buffer is appended whenever unknown
    /// bytes were seen so the capture can be studied offline.
    pub fn trace(&self, port: u16, raw: &[u8]) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "[{}({})] table=v{}",
            self.direction.origin(),
            port,
            self.table_version
        );
        let mut show_raw = false;
        for event in &self.events {
            match event {
                DecodeEvent::Record(record) => {
                    let _ = write!(out, "{record}");
                }
                DecodeEvent::Unrecognized(run) => {
                    show_raw = true;
                    let _ = writeln!(out, "  |-> Unknown @{} ---> Hex: {}", run.offset, hex_all(&run.bytes));
                    let _ = writeln!(out, "  |-> Unknown ---> Raw: {}", escape_bytes(&run.bytes));
                    let _ = writeln!(out, "  |-> -----------------");
                }
            }
        }
        if !self.residual.is_empty() {
            let _ = writeln!(out, "  |-> Residual ---> Hex: {}", hex_all(&self.residual));
        }
        if show_raw {
            let _ = writeln!(out, "|-> Hex: {}", hex_all(raw));
            let _ = writeln!(out, "|-> Raw: {}", escape_bytes(raw));
        }
        out
    }
}

/// A decode pass that stopped on a malformed record.
///
/// `decoded` holds every event and auto-loot entry gathered before the
/// failing record, so callers can still act on them.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error} after {} event(s)", .decoded.events.len())]
pub struct PartialDecode {
    pub error: DecodeError,
    pub decoded: Decoded,
}

enum DecodeStep {
    Record(Record),
    Unrecognized(u8),
}

/// Decoder with a hot-swappable opcode table.
///
/// Each pass takes one snapshot of the table, so a reload never changes the
/// bindings halfway through a buffer.
pub struct Decoder {
    table: ArcSwap<DispatchTable>,
    /// Serializes reloads so each one publishes a distinct version.
    reload_lock: Mutex<()>,
    auto_loot: bool,
}

impl Decoder {
    pub fn new(table: DispatchTable, auto_loot: bool) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            reload_lock: Mutex::new(()),
            auto_loot,
        }
    }

    pub fn with_builtin_table(auto_loot: bool) -> Self {
        Self::new(DispatchTable::builtin(1), auto_loot)
    }

    pub fn table(&self) -> Arc<DispatchTable> {
        self.table.load_full()
    }

    pub fn version(&self) -> u64 {
        self.table.load().version()
    }

    pub fn next_version(&self) -> u64 {
        self.version() + 1
    }

    /// Replaces the active table; returns the version now in effect.
    pub fn reload(&self, table: DispatchTable) -> u64 {
        let version = table.version();
        self.table.store(Arc::new(table));
        version
    }

    /// Builds a table under the next version and publishes it. The version
    /// is computed and stored under one lock.
    pub fn reload_with<F, E>(&self, build: F) -> Result<u64, E>
    where
        F: FnOnce(u64) -> Result<DispatchTable, E>,
    {
        let _guard = self.reload_lock.lock();
        let table = build(self.next_version())?;
        Ok(self.reload(table))
    }

    pub fn reload_from_toml(&self, text: &str) -> Result<u64, TableError> {
        self.reload_with(|version| DispatchTable::from_toml_str(version, text))
    }

    pub fn decode(&self, buffer: &[u8], direction: Direction) -> Result<Decoded, PartialDecode> {
        let table = self.table.load();
        let mut decoded = Decoded::empty(direction, table.version());

        let data = match direction {
            Direction::Upstream => buffer,
            Direction::Downstream => {
                if buffer.len() <= SERVER_TRAILER_LEN {
                    return Ok(decoded);
                }
                &buffer[..buffer.len() - SERVER_TRAILER_LEN]
            }
        };

        let mut run: Option<UnrecognizedRun> = None;
        let mut cursor = 0usize;
        while data.len() - cursor >= 2 {
            let step = match step(&table, data, cursor, direction) {
                Ok(step) => step,
                Err(error) => {
                    if let Some(run) = run.take() {
                        decoded.events.push(DecodeEvent::Unrecognized(run));
                    }
                    return Err(PartialDecode { error, decoded });
                }
            };
            match step {
                DecodeStep::Record(record) => {
                    if let Some(run) = run.take() {
                        decoded.events.push(DecodeEvent::Unrecognized(run));
                    }
                    cursor += record.raw_length;
                    if let Some(entry) = self.auto_loot_entry(&record) {
                        decoded.auto_loot.push(entry);
                    }
                    decoded.events.push(DecodeEvent::Record(record));
                }
                DecodeStep::Unrecognized(byte) => {
                    run.get_or_insert_with(|| UnrecognizedRun {
                        offset: cursor,
                        bytes: Vec::new(),
                    })
                    .bytes
                    .push(byte);
                    cursor += 1;
                }
            }
        }

        let tail = &data[cursor..];
        match run {
            Some(mut run) => {
                run.bytes.extend_from_slice(tail);
                decoded.events.push(DecodeEvent::Unrecognized(run));
            }
            None => decoded.residual = tail.to_vec(),
        }
        Ok(decoded)
    }

    fn auto_loot_entry(&self, record: &Record) -> Option<InjectionEntry> {
        if !self.auto_loot
            || record.layout != Layout::EntityInit
            || record.direction != Direction::Downstream
        {
            return None;
        }
        let name = record.text("name")?;
        if !name.contains(LOOT_MARKER) {
            return None;
        }
        let id = record.u32("id")?;
        Some(InjectionEntry::new(
            Direction::Upstream,
            item_pickup_packet(id),
        ))
    }
}

fn step(
    table: &DispatchTable,
    data: &[u8],
    cursor: usize,
    direction: Direction,
) -> Result<DecodeStep, DecodeError> {
    let opcode = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
    let Some(layout) = table.lookup(direction, opcode) else {
        return Ok(DecodeStep::Unrecognized(data[cursor]));
    };

    let payload_start = cursor + 2;
    let mut reader = FieldReader::new(&data[payload_start..], opcode, payload_start);
    let fields = layout.decode(&mut reader)?;
    Ok(DecodeStep::Record(Record {
        opcode,
        direction,
        layout,
        fields,
        raw_length: 2 + reader.consumed(),
    }))
}
