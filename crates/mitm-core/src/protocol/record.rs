use std::fmt;

use binrw::BinRead;

use super::{Direction, Layout};
use crate::hex::hex_all;

#[derive(BinRead, PartialEq, Copy, Clone, Default, Debug)]
#[br(little)]
pub struct Point3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// The 20-byte position block shared by client and server movement records.
#[derive(BinRead, PartialEq, Copy, Clone, Default, Debug)]
#[br(little)]
pub struct Position {
    pub point: Point3D,
    pub view: [u8; 4],
    pub view_limit: i16,
    pub dy: i8,
    pub dx: i8,
}

impl Position {
    pub const SIZE: usize = 20;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    U32(u32),
    Vec3([f32; 3]),
    Text(String),
    Blob(Vec<u8>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::I8(v) => write!(f, "{v}"),
            FieldValue::I16(v) => write!(f, "{v}"),
            FieldValue::I32(v) => write!(f, "{v}"),
            FieldValue::U32(v) => write!(f, "{v}"),
            FieldValue::Vec3([x, y, z]) => write!(f, "{x:10.2} X | {y:10.2} Y | {z:10.2} Z"),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Blob(v) => f.write_str(&hex_all(v)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub value: FieldValue,
}

impl Field {
    pub fn new(name: &'static str, value: FieldValue) -> Self {
        Self { name, value }
    }
}

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub opcode: u16,
    pub direction: Direction,
    pub layout: Layout,
    pub fields: Vec<Field>,
    /// Opcode bytes plus everything the layout consumed.
    pub raw_length: usize,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.value)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.field(name)? {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn u32(&self, name: &str) -> Option<u32> {
        match self.field(name)? {
            FieldValue::U32(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  |-> {} (0x{:04x})", self.layout.title(), self.opcode)?;
        for field in &self.fields {
            writeln!(f, "    |-> {}: {}", field.name, field.value)?;
        }
        Ok(())
    }
}
