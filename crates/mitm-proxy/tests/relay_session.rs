//! Relays exercised over real loopback sockets: a fake game server, the
//! relay in the middle, and a fake client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use mitm_core::protocol::Opcode;
use mitm_core::{Decoder, Direction, HackEngine, HackKind, InjectionQueue};
use mitm_proxy::manager::{PortRelay, RelayRegistry, Route};
use mitm_proxy::relay::RelayContext;

const PORT: u16 = 3000;
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    upstream: TcpListener,
    relay_addr: SocketAddr,
    registry: Arc<RelayRegistry>,
    hacks: Arc<HackEngine>,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn start() -> anyhow::Result<Self> {
        let upstream = TcpListener::bind("127.0.0.1:0").await?;
        let upstream_addr = upstream.local_addr()?;
        let registry = Arc::new(RelayRegistry::new());
        let hacks = Arc::new(HackEngine::new());
        let ctx = RelayContext::new(Arc::new(Decoder::with_builtin_table(true)), hacks.clone());

        let port_relay = PortRelay::bind(
            Route::new(PORT, "127.0.0.1:0", upstream_addr.to_string()),
            registry.clone(),
            ctx,
        )
        .await?;
        let relay_addr = port_relay.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(port_relay.serve(shutdown_rx));

        Ok(Self {
            upstream,
            relay_addr,
            registry,
            hacks,
            _shutdown: shutdown,
        })
    }

    fn queue(&self) -> anyhow::Result<Arc<InjectionQueue>> {
        self.registry
            .queue(PORT)
            .context("port queue registered at bind")
    }

    /// Connects a client and returns it with the server-side socket.
    async fn connect(&self) -> anyhow::Result<(TcpStream, TcpStream)> {
        let client = TcpStream::connect(self.relay_addr).await?;
        let (server, _) = timeout(WAIT, self.upstream.accept()).await??;
        Ok((client, server))
    }
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf)).await??;
    Ok(buf)
}

async fn expect_eof(stream: &mut TcpStream) -> anyhow::Result<()> {
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, stream.read(&mut buf)).await??;
    anyhow::ensure!(n == 0, "expected EOF, got {} bytes", n);
    Ok(())
}

fn jump(ready: u8) -> Vec<u8> {
    let mut out = Opcode::JUMP.to_le_bytes().to_vec();
    out.push(ready);
    out
}

#[tokio::test]
async fn injections_go_out_one_per_buffer_ahead_of_traffic() -> anyhow::Result<()> {
    let harness = Harness::start().await?;
    let queue = harness.queue()?;
    queue.enqueue(Direction::Upstream, vec![0xa1, 0xa2]);
    queue.enqueue(Direction::Upstream, vec![0xb1, 0xb2]);

    let (mut client, mut server) = harness.connect().await?;

    client.write_all(&jump(1)).await?;
    let got = read_exactly(&mut server, 5).await?;
    assert_eq!(got, [0xa1, 0xa2, 0x6a, 0x70, 0x01]);
    assert_eq!(queue.len(Direction::Upstream), 1);

    client.write_all(&jump(0)).await?;
    let got = read_exactly(&mut server, 5).await?;
    assert_eq!(got, [0xb1, 0xb2, 0x6a, 0x70, 0x00]);
    assert!(queue.is_empty());

    // Server traffic passes through untouched, trailer included.
    let reply = [0x2b, 0x2b, 1, 0, 0, 0, 50, 0, 0, 0, 0x0d, 0x0a];
    server.write_all(&reply).await?;
    assert_eq!(read_exactly(&mut client, reply.len()).await?, reply);
    Ok(())
}

#[tokio::test]
async fn console_injection_reaches_only_running_relays() -> anyhow::Result<()> {
    let harness = Harness::start().await?;
    assert!(harness.registry.enqueue_running(Direction::Downstream, &[0x01]).is_empty());

    let (mut client, mut server) = harness.connect().await?;
    timeout(WAIT, async {
        while harness.registry.running_ports().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    let ports = harness
        .registry
        .enqueue_running(Direction::Downstream, &[0xc0, 0xc1]);
    assert_eq!(ports, vec![PORT]);

    server.write_all(&[0x00, 0x00, 0x00]).await?;
    let got = read_exactly(&mut client, 5).await?;
    assert_eq!(got, [0xc0, 0xc1, 0x00, 0x00, 0x00]);
    Ok(())
}

#[tokio::test]
async fn reconnect_retires_previous_relay() -> anyhow::Result<()> {
    let harness = Harness::start().await?;
    let (mut old_client, mut old_server) = harness.connect().await?;
    old_client.write_all(&jump(1)).await?;
    read_exactly(&mut old_server, 3).await?;

    let (mut new_client, mut new_server) = harness.connect().await?;

    // Both ends of the retired relay are half-closed by its pumps.
    expect_eof(&mut old_client).await?;
    expect_eof(&mut old_server).await?;

    new_client.write_all(&jump(0)).await?;
    assert_eq!(read_exactly(&mut new_server, 3).await?, jump(0));

    let statuses = harness.registry.pump_statuses();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|pump| pump.relay_id == statuses[0].relay_id));
    Ok(())
}

#[tokio::test]
async fn dropped_loot_is_picked_up_on_next_client_buffer() -> anyhow::Result<()> {
    let harness = Harness::start().await?;
    let (mut client, mut server) = harness.connect().await?;

    let mut init = Opcode::ENTITY_INIT.to_le_bytes().to_vec();
    init.extend_from_slice(&0x2au32.to_le_bytes());
    init.extend_from_slice(&[0; 4]);
    init.push(0);
    init.extend_from_slice(&8i16.to_le_bytes());
    init.extend_from_slice(b"GoldDrop");
    init.extend_from_slice(&[0; 12 + 4 + 2]);
    init.extend_from_slice(&1i32.to_le_bytes());
    init.extend_from_slice(&[0x00, 0x00]);

    server.write_all(&init).await?;
    assert_eq!(read_exactly(&mut client, init.len()).await?, init);

    client.write_all(&jump(1)).await?;
    let got = read_exactly(&mut server, 6 + 3).await?;
    assert_eq!(&got[..6], &[0x65, 0x65, 0x2a, 0x00, 0x00, 0x00]);
    assert_eq!(&got[6..], &jump(1)[..]);
    Ok(())
}

#[tokio::test]
async fn fire_balls_hack_runs_until_server_confirms() -> anyhow::Result<()> {
    let harness = Harness::start().await?;
    harness.hacks.arm(HackKind::FireBalls.spec(3));
    let (mut client, mut server) = harness.connect().await?;

    let mut position = Opcode::POSITION.to_le_bytes().to_vec();
    position.extend_from_slice(&[0u8; 20]);

    client.write_all(&position).await?;
    let forged = read_exactly(&mut server, position.len() + 6).await?;
    assert_eq!(&forged[..6], &[0x65, 0x65, 0x01, 0x00, 0x00, 0x00]);

    let mut grant = b"\x70\x75\x1c\x00Achievement_GreatBallsOfFire".to_vec();
    grant.extend_from_slice(b"\x70\x75\x10\x00GreatBallsOfFire");
    grant.extend_from_slice(&[0x00, 0x00]);
    server.write_all(&grant).await?;
    assert_eq!(read_exactly(&mut client, grant.len()).await?, grant);

    client.write_all(&position).await?;
    assert_eq!(read_exactly(&mut server, position.len()).await?, position);
    Ok(())
}
