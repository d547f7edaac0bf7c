//! Wire vocabulary of the game protocol: directions, opcodes, record layouts
//! and the dispatch table binding one to the other.

pub mod layout;
pub mod reader;
pub mod record;
pub mod table;

use std::fmt;

use serde::Deserialize;

pub use layout::Layout;
pub use record::{Field, FieldValue, Point3D, Position, Record};
pub use table::{Binding, BindingScope, DispatchTable};

/// Which way a buffer travels through the relay.
///
/// `Upstream` traffic originates at the game client and is delivered to the
/// server; `Downstream` traffic originates at the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Upstream => Direction::Downstream,
            Direction::Downstream => Direction::Upstream,
        }
    }

    /// Name of the peer that receives traffic going this way.
    pub fn destination(self) -> &'static str {
        match self {
            Direction::Upstream => "server",
            Direction::Downstream => "client",
        }
    }

    /// Name of the peer that produced traffic going this way.
    pub fn origin(self) -> &'static str {
        match self {
            Direction::Upstream => "client",
            Direction::Downstream => "server",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("upstream"),
            Direction::Downstream => f.write_str("downstream"),
        }
    }
}

/// Opcode values as read little-endian from the wire. The comment after each
/// constant is the on-wire byte order, which is how captures show them.
pub struct Opcode;

impl Opcode {
    // Client-origin.
    pub const QUEST_SELECTED: u16 = 0x3D71; // 71 3d
    pub const WEAPON_SLOT: u16 = 0x3D73; // 73 3d
    pub const ITEM_PICKUP: u16 = 0x6565; // 65 65
    pub const SHOOT: u16 = 0x692A; // 2a 69
    pub const WEAPON_RELOAD: u16 = 0x6C72; // 72 6c
    pub const JUMP: u16 = 0x706A; // 6a 70
    pub const SHOOTING: u16 = 0x7266; // 66 72
    pub const POSITION: u16 = 0x766D; // 6d 76

    // Shared "constant information" blocks.
    pub const CONSTANT_INFORMATION: [u16; 4] = [0x0314, 0x0315, 0x0316, 0x0317];

    // Server-origin.
    pub const HEALTH: u16 = 0x2B2B; // 2b 2b
    pub const GUN_SHOOT: u16 = 0x616C; // 6c 61
    pub const MAGIC_SHOOT: u16 = 0x616D; // 6d 61
    pub const ENTITY_INIT: u16 = 0x6B6D; // 6d 6b
    pub const SERVER_CONSTANT_INFORMATION: u16 = 0x7070; // 70 70
    pub const CHARACTER_POSITION: u16 = 0x7370; // 70 73
    pub const MY_POSITION: u16 = 0x766D; // 6d 76
    pub const MONSTER_LIST: u16 = 0x7878; // 78 78
}

/// Server-origin buffers end with a 2-byte terminator that is not part of any
/// record.
pub const SERVER_TRAILER_LEN: usize = 2;

/// Builds the pickup packet the client would send for entity `entity_id`.
pub fn item_pickup_packet(entity_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(&Opcode::ITEM_PICKUP.to_le_bytes());
    out.extend_from_slice(&entity_id.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_constants_match_wire_bytes() {
        assert_eq!(Opcode::POSITION.to_le_bytes(), [0x6d, 0x76]);
        assert_eq!(Opcode::ENTITY_INIT.to_le_bytes(), [0x6d, 0x6b]);
        assert_eq!(Opcode::SHOOT.to_le_bytes(), [0x2a, 0x69]);
        assert_eq!(Opcode::CONSTANT_INFORMATION[0].to_le_bytes(), [0x14, 0x03]);
    }

    #[test]
    fn item_pickup_packet_layout() {
        assert_eq!(
            item_pickup_packet(0x0102_0304),
            vec![0x65, 0x65, 0x04, 0x03, 0x02, 0x01]
        );
    }
}
