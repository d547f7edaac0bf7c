use std::collections::HashMap;

use serde::Deserialize;

use super::{Direction, Layout, Opcode};
use crate::error::TableError;

/// Which direction(s) a binding applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingScope {
    Upstream,
    Downstream,
    Both,
}

impl BindingScope {
    pub fn includes(self, direction: Direction) -> bool {
        match self {
            BindingScope::Both => true,
            BindingScope::Upstream => direction == Direction::Upstream,
            BindingScope::Downstream => direction == Direction::Downstream,
        }
    }

    fn directions(self) -> &'static [Direction] {
        match self {
            BindingScope::Upstream => &[Direction::Upstream],
            BindingScope::Downstream => &[Direction::Downstream],
            BindingScope::Both => &[Direction::Upstream, Direction::Downstream],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub opcode: u16,
    pub scope: BindingScope,
    pub layout: Layout,
}

impl Binding {
    pub const fn new(opcode: u16, scope: BindingScope, layout: Layout) -> Self {
        Self {
            opcode,
            scope,
            layout,
        }
    }
}

/// Direction-scoped opcode → layout map.
///
/// Immutable once built; a reload builds a fresh table with the next version
/// number and swaps it in whole.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    version: u64,
    upstream: HashMap<u16, Layout>,
    downstream: HashMap<u16, Layout>,
}

impl DispatchTable {
    pub fn new(
        version: u64,
        bindings: impl IntoIterator<Item = Binding>,
    ) -> Result<Self, TableError> {
        let mut table = Self {
            version,
            upstream: HashMap::new(),
            downstream: HashMap::new(),
        };

        for binding in bindings {
            for &direction in binding.scope.directions() {
                if !binding.layout.scope().includes(direction) {
                    return Err(TableError::WrongDirection {
                        opcode: binding.opcode,
                        layout: binding.layout,
                        direction,
                    });
                }
                let map = table.map_mut(direction);
                if map.insert(binding.opcode, binding.layout).is_some() {
                    return Err(TableError::Duplicate {
                        opcode: binding.opcode,
                        direction,
                    });
                }
            }
        }

        for direction in [Direction::Upstream, Direction::Downstream] {
            if table.len(direction) == 0 {
                return Err(TableError::Empty(direction));
            }
        }
        Ok(table)
    }

    /// The opcode map observed in live captures.
    pub fn builtin(version: u64) -> Self {
        // The built-in bindings are static and satisfy every load-time check.
        match Self::new(version, builtin_bindings()) {
            Ok(table) => table,
            Err(err) => unreachable!("built-in opcode table rejected: {err}"),
        }
    }

    /// Parses a `[[binding]]` list:
    ///
    /// ```toml
    /// [[binding]]
    /// opcode = "0x766D"
    /// scope = "upstream"
    /// layout = "client_position"
    /// ```
    pub fn from_toml_str(version: u64, text: &str) -> Result<Self, TableError> {
        let file: BindingFile = toml::from_str(text)?;
        let bindings = file
            .binding
            .into_iter()
            .map(|raw| {
                Ok(Binding {
                    opcode: raw.opcode.value()?,
                    scope: raw.scope,
                    layout: raw.layout,
                })
            })
            .collect::<Result<Vec<_>, TableError>>()?;
        Self::new(version, bindings)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn lookup(&self, direction: Direction, opcode: u16) -> Option<Layout> {
        self.map(direction).get(&opcode).copied()
    }

    pub fn len(&self, direction: Direction) -> usize {
        self.map(direction).len()
    }

    fn map(&self, direction: Direction) -> &HashMap<u16, Layout> {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }

    fn map_mut(&mut self, direction: Direction) -> &mut HashMap<u16, Layout> {
        match direction {
            Direction::Upstream => &mut self.upstream,
            Direction::Downstream => &mut self.downstream,
        }
    }
}

pub fn builtin_bindings() -> Vec<Binding> {
    use BindingScope::{Both, Downstream, Upstream};

    let mut bindings = vec![
        Binding::new(Opcode::QUEST_SELECTED, Upstream, Layout::QuestSelected),
        Binding::new(Opcode::WEAPON_SLOT, Upstream, Layout::WeaponSlot),
        Binding::new(Opcode::ITEM_PICKUP, Upstream, Layout::ItemPickup),
        Binding::new(Opcode::SHOOT, Upstream, Layout::Shoot),
        Binding::new(Opcode::WEAPON_RELOAD, Upstream, Layout::WeaponReload),
        Binding::new(Opcode::JUMP, Upstream, Layout::Jump),
        Binding::new(Opcode::SHOOTING, Upstream, Layout::Shooting),
        Binding::new(Opcode::POSITION, Upstream, Layout::ClientPosition),
        Binding::new(Opcode::HEALTH, Downstream, Layout::Health),
        Binding::new(Opcode::GUN_SHOOT, Downstream, Layout::GunShoot),
        Binding::new(Opcode::MAGIC_SHOOT, Downstream, Layout::MagicShoot),
        Binding::new(Opcode::ENTITY_INIT, Downstream, Layout::EntityInit),
        Binding::new(
            Opcode::SERVER_CONSTANT_INFORMATION,
            Downstream,
            Layout::ServerConstantInformation,
        ),
        Binding::new(
            Opcode::CHARACTER_POSITION,
            Downstream,
            Layout::CharacterPosition,
        ),
        Binding::new(Opcode::MY_POSITION, Downstream, Layout::MyPosition),
        Binding::new(Opcode::MONSTER_LIST, Downstream, Layout::MonsterList),
    ];
    bindings.extend(
        Opcode::CONSTANT_INFORMATION
            .iter()
            .map(|&opcode| Binding::new(opcode, Both, Layout::ConstantInformation)),
    );
    bindings
}

#[derive(Debug, Deserialize)]
struct BindingFile {
    #[serde(default)]
    binding: Vec<RawBinding>,
}

#[derive(Debug, Deserialize)]
struct RawBinding {
    opcode: OpcodeRepr,
    scope: BindingScope,
    layout: Layout,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OpcodeRepr {
    Number(u16),
    Text(String),
}

impl OpcodeRepr {
    fn value(&self) -> Result<u16, TableError> {
        match self {
            OpcodeRepr::Number(v) => Ok(*v),
            OpcodeRepr::Text(text) => parse_opcode_u16(text),
        }
    }
}

/// Accepts `0x766d`, `0X766D` or decimal `30317`.
pub fn parse_opcode_u16(opcode: &str) -> Result<u16, TableError> {
    let opcode = opcode.trim();
    let parsed = match opcode
        .strip_prefix("0x")
        .or_else(|| opcode.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => opcode.parse::<u16>(),
    };
    parsed.map_err(|_| TableError::InvalidOpcode(opcode.to_string()))
}
