use std::fmt;

use serde::Deserialize;

use super::Opcode;
use super::reader::FieldReader;
use super::record::{Field, FieldValue, Position};
use super::table::BindingScope;
use crate::error::DecodeError;

/// Closed set of record layouts the decoder knows how to read.
///
/// Which opcode maps to which layout is configuration (see
/// [`DispatchTable`](super::DispatchTable)); the byte layout of each variant
/// is code. Layouts are best-effort reconstructions from captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    // Client-origin.
    ClientPosition,
    Shoot,
    Shooting,
    Jump,
    ItemPickup,
    WeaponSlot,
    WeaponReload,
    QuestSelected,
    // Either direction.
    ConstantInformation,
    // Server-origin.
    MyPosition,
    CharacterPosition,
    MonsterList,
    GunShoot,
    MagicShoot,
    ServerConstantInformation,
    EntityInit,
    Health,
}

impl Layout {
    pub fn title(self) -> &'static str {
        match self {
            Layout::ClientPosition => "My Position",
            Layout::Shoot => "Shoot",
            Layout::Shooting => "Shooting",
            Layout::Jump => "Jump",
            Layout::ItemPickup => "Item",
            Layout::WeaponSlot => "Weapon",
            Layout::WeaponReload => "Weapon Reload",
            Layout::QuestSelected => "Quest Selected",
            Layout::ConstantInformation => "Constant Information",
            Layout::MyPosition => "My Character",
            Layout::CharacterPosition => "Character Position",
            Layout::MonsterList => "Monster List",
            Layout::GunShoot => "Gun Shoot",
            Layout::MagicShoot => "Magic Shoot",
            Layout::ServerConstantInformation => "Server Constant Information",
            Layout::EntityInit => "Init Information",
            Layout::Health => "Health",
        }
    }

    /// Directions this layout may be bound for.
    pub fn scope(self) -> BindingScope {
        match self {
            Layout::ClientPosition
            | Layout::Shoot
            | Layout::Shooting
            | Layout::Jump
            | Layout::ItemPickup
            | Layout::WeaponSlot
            | Layout::WeaponReload
            | Layout::QuestSelected => BindingScope::Upstream,
            Layout::ConstantInformation => BindingScope::Both,
            Layout::MyPosition
            | Layout::CharacterPosition
            | Layout::MonsterList
            | Layout::GunShoot
            | Layout::MagicShoot
            | Layout::ServerConstantInformation
            | Layout::EntityInit
            | Layout::Health => BindingScope::Downstream,
        }
    }

    /// Records worth surfacing at info level rather than debug.
    pub fn is_notable(self) -> bool {
        matches!(self, Layout::ItemPickup)
    }

    /// Reads this layout's fields; the opcode has already been consumed.
    pub fn decode(self, r: &mut FieldReader<'_>) -> Result<Vec<Field>, DecodeError> {
        match self {
            Layout::ClientPosition => position_fields(r),
            Layout::Shoot => {
                let name = r.string_i16()?;
                let at = r.vec3()?;
                Ok(vec![
                    Field::new("name", FieldValue::Text(name)),
                    Field::new("position", FieldValue::Vec3(at)),
                ])
            }
            Layout::Shooting => Ok(vec![Field::new("automatic", FieldValue::Bool(r.bool()?))]),
            Layout::Jump => Ok(vec![Field::new("ready", FieldValue::Bool(r.bool()?))]),
            Layout::ItemPickup => Ok(vec![Field::new("id", FieldValue::I32(r.i32()?))]),
            Layout::WeaponSlot => {
                // Slots are zero-based on the wire, one-based in the game UI.
                let slot = r.i8()?.saturating_add(1);
                Ok(vec![Field::new("slot", FieldValue::I8(slot))])
            }
            Layout::WeaponReload => {
                // A bare reload is immediately followed by a position record.
                if r.peek(2) == Some(&Opcode::POSITION.to_le_bytes()[..]) {
                    return Ok(Vec::new());
                }
                let weapon = r.string_i16()?;
                let ammo = r.string_i16()?;
                let bullets = r.i32()?;
                Ok(vec![
                    Field::new("name", FieldValue::Text(weapon)),
                    Field::new("ammo", FieldValue::Text(ammo)),
                    Field::new("bullets", FieldValue::I32(bullets)),
                ])
            }
            Layout::QuestSelected => Ok(vec![Field::new(
                "name",
                FieldValue::Text(r.string_i16()?),
            )]),
            Layout::ConstantInformation => {
                let unknown_1 = r.bytes(2)?.to_vec();
                let unknown_2 = r.blob_i8()?.to_vec();
                Ok(vec![
                    Field::new("unknown_1", FieldValue::Blob(unknown_1)),
                    Field::new("unknown_2", FieldValue::Blob(unknown_2)),
                ])
            }
            Layout::MyPosition | Layout::CharacterPosition => {
                let id = r.u32()?;
                let mut fields = vec![Field::new("id", FieldValue::U32(id))];
                fields.extend(position_fields(r)?);
                fields.push(Field::new("unknown_1", FieldValue::Blob(r.bytes(4)?.to_vec())));
                Ok(fields)
            }
            Layout::MonsterList => Ok(vec![Field::new("id", FieldValue::I32(r.i32()?))]),
            Layout::GunShoot => {
                let weapon = r.string_i16()?;
                let bullets = r.i32()?;
                Ok(vec![
                    Field::new("name", FieldValue::Text(weapon)),
                    Field::new("bullets", FieldValue::I32(bullets)),
                ])
            }
            Layout::MagicShoot => Ok(vec![Field::new("counter", FieldValue::I32(r.i32()?))]),
            Layout::ServerConstantInformation => Ok(vec![Field::new(
                "counter",
                FieldValue::Blob(r.bytes(32)?.to_vec()),
            )]),
            Layout::EntityInit => {
                let id = r.u32()?;
                let unknown_1 = r.bytes(4)?.to_vec();
                let flag = r.i8()?;
                let name = r.string_i16()?;
                let at = r.vec3()?;
                let facing = r.bytes(4)?.to_vec();
                let unknown_2 = r.bytes(2)?.to_vec();
                let kind = r.i32()?;
                Ok(vec![
                    Field::new("id", FieldValue::U32(id)),
                    Field::new("unknown_1", FieldValue::Blob(unknown_1)),
                    Field::new("flag", FieldValue::I8(flag)),
                    Field::new("name", FieldValue::Text(name)),
                    Field::new("position", FieldValue::Vec3(at)),
                    Field::new("direction", FieldValue::Blob(facing)),
                    Field::new("unknown_2", FieldValue::Blob(unknown_2)),
                    Field::new("type", FieldValue::I32(kind)),
                ])
            }
            Layout::Health => {
                let id = r.u32()?;
                let health = r.i32()?;
                Ok(vec![
                    Field::new("character", FieldValue::U32(id)),
                    Field::new("health", FieldValue::I32(health)),
                ])
            }
        }
    }
}

fn position_fields(r: &mut FieldReader<'_>) -> Result<Vec<Field>, DecodeError> {
    let Position {
        point,
        view,
        view_limit,
        dy,
        dx,
    } = r.position()?;
    Ok(vec![
        Field::new("position", FieldValue::Vec3([point.x, point.y, point.z])),
        Field::new("view", FieldValue::Blob(view.to_vec())),
        Field::new("view_limit", FieldValue::I16(view_limit)),
        Field::new("dy", FieldValue::I8(dy)),
        Field::new("dx", FieldValue::I8(dx)),
    ])
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
