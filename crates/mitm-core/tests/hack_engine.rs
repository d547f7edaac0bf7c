//! Fire-balls hack driven the way a relay drives it: every buffer goes
//! through `observe`, server traffic also through `observe_inbound`.

use mitm_core::protocol::Opcode;
use mitm_core::{Direction, HackEngine, HackKind, HackOutcome, HackPhase};

const SIGNATURE_HEX: &str = "70751c00416368696576656d656e745f477265617442616c6c734f6646697265\
                             70751000477265617442616c6c734f6646697265";

fn position_packet() -> Vec<u8> {
    let mut out = Opcode::POSITION.to_le_bytes().to_vec();
    out.extend_from_slice(&[0x11; 20]);
    out
}

fn grant_packet() -> anyhow::Result<Vec<u8>> {
    let mut out = vec![0x00, 0x01];
    out.extend(mitm_core::hex::decode_hex(SIGNATURE_HEX)?);
    out.extend_from_slice(&[0x00, 0x00]);
    Ok(out)
}

#[test]
fn exhausts_after_budget_and_stops_mutating() {
    let engine = HackEngine::new();
    engine.arm(HackKind::FireBalls.spec(2));
    let packet = position_packet();

    for _ in 0..2 {
        let out = engine.observe(&packet, Direction::Upstream);
        assert_eq!(&out[..2], &[0x65, 0x65]);
        assert_eq!(out.len(), packet.len() + 6);
    }

    assert_eq!(engine.status().retries_remaining, Some(0));
    assert_eq!(
        engine.observe(&packet, Direction::Upstream).as_ref(),
        &packet[..]
    );

    let status = engine.status();
    assert_eq!(status.phase, HackPhase::Idle);
    assert_eq!(
        status.last_outcome,
        Some(HackOutcome::Exhausted(HackKind::FireBalls))
    );
}

#[test]
fn single_attempt_is_confirmed_by_the_server() -> anyhow::Result<()> {
    let engine = HackEngine::new();
    engine.arm(HackKind::FireBalls.spec(1));
    let packet = position_packet();
    assert_ne!(engine.observe(&packet, Direction::Upstream).as_ref(), &packet[..]);

    let grant = grant_packet()?;
    assert_eq!(
        engine.observe_inbound(&grant, Direction::Downstream),
        Some(HackOutcome::Succeeded(HackKind::FireBalls))
    );
    assert_eq!(
        engine.status().last_outcome,
        Some(HackOutcome::Succeeded(HackKind::FireBalls))
    );
    Ok(())
}

#[test]
fn server_grant_confirms_success() -> anyhow::Result<()> {
    let engine = HackEngine::new();
    engine.arm(HackKind::FireBalls.spec(5));
    let packet = position_packet();

    let out = engine.observe(&packet, Direction::Upstream);
    assert_ne!(out.as_ref(), &packet[..]);

    let grant = grant_packet()?;
    assert_eq!(engine.observe(&grant, Direction::Downstream).as_ref(), &grant[..]);
    assert_eq!(
        engine.observe_inbound(&grant, Direction::Downstream),
        Some(HackOutcome::Succeeded(HackKind::FireBalls))
    );
    assert_eq!(engine.phase(), HackPhase::Idle);
    assert_eq!(
        engine.observe(&packet, Direction::Upstream).as_ref(),
        &packet[..]
    );
    Ok(())
}

#[test]
fn unrelated_client_traffic_leaves_budget_alone() {
    let engine = HackEngine::new();
    engine.arm(HackKind::FireBalls.spec(1));

    let mut jump = Opcode::JUMP.to_le_bytes().to_vec();
    jump.push(1);
    for _ in 0..10 {
        assert_eq!(engine.observe(&jump, Direction::Upstream).as_ref(), &jump[..]);
    }
    assert_eq!(engine.status().retries_remaining, Some(1));
}
