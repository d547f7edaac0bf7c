//! Retrying packet-forgery automaton.
//!
//! The server is authoritative and may silently drop a forged packet, so a
//! hack keeps rewriting every matching outgoing packet until the opposite
//! direction carries its validation signature or the retry budget runs out.
//!
//! ```text
//! Idle --arm--> Armed --first observe--> Active --signature--> Succeeded --> Idle
//!                                          \----budget spent--> Exhausted --> Idle
//! ```

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::hex::hex_all;
use crate::protocol::{Direction, Opcode, item_pickup_packet};

/// Coordinates (three f32 LE) the fire-balls hack writes into the player's
/// position record: the spot where the reward is handed out.
const FIRE_BALLS_POSITION: [u8; 12] = [
    0x34, 0x97, 0x2a, 0xc7, 0xf2, 0x6a, 0x5a, 0xc7, 0x66, 0xbc, 0xa1, 0x43,
];

/// Achievement + item grant the server sends once the pickup is accepted.
const FIRE_BALLS_SIGNATURE: &[u8] =
    b"\x70\x75\x1c\x00Achievement_GreatBallsOfFire\x70\x75\x10\x00GreatBallsOfFire";

const FIRE_BALLS_ITEM: u32 = 1;

pub const DEFAULT_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HackKind {
    FireBalls,
}

impl HackKind {
    pub const ALL: [HackKind; 1] = [HackKind::FireBalls];

    pub fn name(self) -> &'static str {
        match self {
            HackKind::FireBalls => "fire_balls",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "fireballs" | "fb" => Some(HackKind::FireBalls),
            _ => None,
        }
    }

    /// The arming parameters for this hack with the given retry budget.
    pub fn spec(self, retries: u32) -> HackSpec {
        match self {
            HackKind::FireBalls => HackSpec {
                kind: self,
                trigger_opcode: Opcode::POSITION,
                trigger_direction: Direction::Upstream,
                retries,
                overwrite: Some(FixedOverwrite {
                    offset: 2,
                    bytes: FIRE_BALLS_POSITION.to_vec(),
                }),
                validation: Some(FIRE_BALLS_SIGNATURE.to_vec()),
            },
        }
    }

    fn apply_payload(self, mut buffer: Vec<u8>) -> Vec<u8> {
        match self {
            HackKind::FireBalls => {
                // Forged pickup record in front of the (relocated) position.
                let mut out = item_pickup_packet(FIRE_BALLS_ITEM);
                out.append(&mut buffer);
                out
            }
        }
    }
}

impl fmt::Display for HackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Replacement bytes written at a fixed offset of the trigger packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedOverwrite {
    pub offset: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HackSpec {
    pub kind: HackKind,
    pub trigger_opcode: u16,
    pub trigger_direction: Direction,
    pub retries: u32,
    pub overwrite: Option<FixedOverwrite>,
    pub validation: Option<Vec<u8>>,
}

impl HackSpec {
    fn matches(&self, buffer: &[u8], direction: Direction) -> bool {
        direction == self.trigger_direction
            && buffer.len() >= 2
            && u16::from_le_bytes([buffer[0], buffer[1]]) == self.trigger_opcode
    }

    fn is_confirmed_by(&self, buffer: &[u8]) -> bool {
        match self.validation.as_deref() {
            Some(signature) if !signature.is_empty() => buffer
                .windows(signature.len())
                .any(|window| window == signature),
            _ => false,
        }
    }

    fn forge(&self, buffer: &[u8]) -> Vec<u8> {
        let mut out = buffer.to_vec();
        if let Some(overwrite) = &self.overwrite {
            let end = overwrite.offset + overwrite.bytes.len();
            if end <= out.len() {
                out[overwrite.offset..end].copy_from_slice(&overwrite.bytes);
            } else {
                warn!(
                    hack = %self.kind,
                    offset = overwrite.offset,
                    len = out.len(),
                    "hack.overwrite_skipped packet too short"
                );
            }
        }
        self.kind.apply_payload(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HackPhase {
    Idle,
    Armed,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HackOutcome {
    Succeeded(HackKind),
    Exhausted(HackKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HackStatus {
    pub phase: HackPhase,
    pub current: Option<HackKind>,
    pub retries_remaining: Option<u32>,
    pub pending: usize,
    pub last_outcome: Option<HackOutcome>,
}

impl fmt::Display for HackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase={:?} pending={}", self.phase, self.pending)?;
        if let (Some(kind), Some(retries)) = (self.current, self.retries_remaining) {
            write!(f, " current={kind} retries_remaining={retries}")?;
        }
        if let Some(outcome) = self.last_outcome {
            write!(f, " last_outcome={outcome:?}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ActiveHack {
    spec: HackSpec,
    retries_remaining: u32,
}

#[derive(Debug, Default)]
struct HackState {
    pending: VecDeque<HackSpec>,
    current: Option<ActiveHack>,
    last_outcome: Option<HackOutcome>,
}

impl HackState {
    fn armed(&self) -> bool {
        self.current.is_some() || !self.pending.is_empty()
    }

    fn finish(&mut self, outcome: HackOutcome) {
        match outcome {
            HackOutcome::Succeeded(kind) => info!(hack = %kind, "hack.succeeded hacked"),
            HackOutcome::Exhausted(kind) => warn!(hack = %kind, "hack.exhausted not successful"),
        }
        self.current = None;
        self.last_outcome = Some(outcome);
    }
}

/// Shared by every pump; all transitions happen under one lock.
#[derive(Debug, Default)]
pub struct HackEngine {
    state: Mutex<HackState>,
}

impl HackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a hack. Hacks run one at a time in arm order.
    pub fn arm(&self, spec: HackSpec) {
        let mut state = self.state.lock();
        info!(
            hack = %spec.kind,
            trigger = format_args!("0x{:04x}", spec.trigger_opcode),
            direction = %spec.trigger_direction,
            retries = spec.retries,
            "hack.armed"
        );
        state.pending.push_back(spec);
    }

    /// Drops the active hack and everything pending.
    pub fn cancel(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.pending.len() + usize::from(state.current.is_some());
        state.pending.clear();
        state.current = None;
        dropped
    }

    pub fn phase(&self) -> HackPhase {
        let state = self.state.lock();
        if state.current.is_some() {
            HackPhase::Active
        } else if state.armed() {
            HackPhase::Armed
        } else {
            HackPhase::Idle
        }
    }

    pub fn status(&self) -> HackStatus {
        let phase = self.phase();
        let state = self.state.lock();
        HackStatus {
            phase,
            current: state.current.as_ref().map(|active| active.spec.kind),
            retries_remaining: state.current.as_ref().map(|active| active.retries_remaining),
            pending: state.pending.len(),
            last_outcome: state.last_outcome,
        }
    }

    /// Looks at a buffer about to be forwarded in `direction` and returns
    /// what should be forwarded instead.
    pub fn observe<'a>(&self, buffer: &'a [u8], direction: Direction) -> Cow<'a, [u8]> {
        let mut state = self.state.lock();
        if !state.armed() {
            return Cow::Borrowed(buffer);
        }

        if let Some(active) = &state.current {
            if active.retries_remaining < 1 {
                let kind = active.spec.kind;
                state.finish(HackOutcome::Exhausted(kind));
                return Cow::Borrowed(buffer);
            }
        }

        if state.current.is_none() {
            let Some(spec) = state.pending.pop_front() else {
                return Cow::Borrowed(buffer);
            };
            info!(hack = %spec.kind, retries = spec.retries, "hack.active");
            state.current = Some(ActiveHack {
                retries_remaining: spec.retries,
                spec,
            });
        }

        let Some(active) = state.current.as_mut() else {
            return Cow::Borrowed(buffer);
        };
        if active.retries_remaining < 1 || !active.spec.matches(buffer, direction) {
            return Cow::Borrowed(buffer);
        }

        active.retries_remaining -= 1;
        let forged = active.spec.forge(buffer);
        info!(
            hack = %active.spec.kind,
            retries_remaining = active.retries_remaining,
            forged = %hex_all(&forged),
            "hack.injecting"
        );
        Cow::Owned(forged)
    }

    /// Checks traffic flowing against the trigger direction for the active
    /// hack's validation signature.
    pub fn observe_inbound(&self, buffer: &[u8], direction: Direction) -> Option<HackOutcome> {
        let mut state = self.state.lock();
        let active = state.current.as_ref()?;
        if direction == active.spec.trigger_direction || !active.spec.is_confirmed_by(buffer) {
            return None;
        }
        let outcome = HackOutcome::Succeeded(active.spec.kind);
        state.finish(outcome);
        Some(outcome)
    }
}
