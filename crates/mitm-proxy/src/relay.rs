//! One relayed connection: a client socket, the matching upstream socket and
//! the two pumps copying between them.

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mitm_core::hex::hex_all;
use mitm_core::{Decoder, Direction, HackEngine, InjectionQueue};

/// Shared collaborators every pump needs.
#[derive(Clone)]
pub struct RelayContext {
    pub decoder: Arc<Decoder>,
    pub hacks: Arc<HackEngine>,
    pub read_buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl RelayContext {
    pub fn new(decoder: Arc<Decoder>, hacks: Arc<HackEngine>) -> Self {
        Self {
            decoder,
            hacks,
            read_buffer_size: 4096,
            idle_timeout: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The source returned end-of-stream.
    ConnectionClosed,
    /// The relay was retired or the proxy is shutting down.
    Stopped,
    /// No bytes arrived within the configured idle timeout.
    IdleTimeout,
}

impl fmt::Display for PumpExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PumpExit::ConnectionClosed => "connection_closed",
            PumpExit::Stopped => "stopped",
            PumpExit::IdleTimeout => "idle_timeout",
        })
    }
}

/// Display name of the pump carrying `direction` on `port`.
pub fn pump_name(direction: Direction, port: u16) -> String {
    match direction {
        Direction::Upstream => format!("Client -> Server [{port}]"),
        Direction::Downstream => format!("Server -> Client [{port}]"),
    }
}

/// One direction of a relay.
pub struct Pump {
    port: u16,
    direction: Direction,
    queue: Arc<InjectionQueue>,
    ctx: RelayContext,
}

impl Pump {
    pub fn new(
        port: u16,
        direction: Direction,
        queue: Arc<InjectionQueue>,
        ctx: RelayContext,
    ) -> Self {
        Self {
            port,
            direction,
            queue,
            ctx,
        }
    }

    /// Copies `source` into `sink` until end-of-stream, the stop signal or
    /// the idle timeout. The sink is shut down on every exit path so the far
    /// peer sees EOF.
    pub async fn run<R, W>(
        self,
        mut source: R,
        mut sink: W,
        mut stop: watch::Receiver<bool>,
    ) -> anyhow::Result<PumpExit>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; self.ctx.read_buffer_size.max(1)];
        let result = loop {
            let read = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break Ok(PumpExit::Stopped),
                read = read_some(&mut source, &mut buffer, self.ctx.idle_timeout) => read,
            };
            let n = match read {
                Ok(Some(0)) => break Ok(PumpExit::ConnectionClosed),
                Ok(Some(n)) => n,
                Ok(None) => break Ok(PumpExit::IdleTimeout),
                Err(err) => {
                    let lane = pump_name(self.direction, self.port);
                    break Err(anyhow::Error::new(err).context(format!("{lane} read")));
                }
            };
            if let Err(err) = self.forward(&buffer[..n], &mut sink).await {
                break Err(err);
            }
        };

        if let Err(err) = sink.shutdown().await {
            debug!(
                port = self.port,
                direction = %self.direction,
                error = %err,
                "relay.pump.shutdown_failed"
            );
        }
        result
    }

    /// One tick: at most one injected packet, then the inspected buffer.
    async fn forward<W>(&self, buffer: &[u8], sink: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(packet) = self.queue.try_dequeue(self.direction) {
            info!(
                port = self.port,
                to = self.direction.destination(),
                packet = %hex_all(&packet),
                "relay.inject"
            );
            sink.write_all(&packet)
                .await
                .with_context(|| format!("{} write injected", pump_name(self.direction, self.port)))?;
        }

        let outgoing = self.inspect(buffer);
        sink.write_all(&outgoing)
            .await
            .with_context(|| format!("{} write", pump_name(self.direction, self.port)))?;
        Ok(())
    }

    /// Decodes for the operator, queues auto-loot and runs the hack engine.
    /// Decode failures never block forwarding.
    fn inspect<'a>(&self, buffer: &'a [u8]) -> Cow<'a, [u8]> {
        let decoded = match self.ctx.decoder.decode(buffer, self.direction) {
            Ok(decoded) => {
                if !decoded.is_empty() {
                    let trace = decoded.trace(self.port, buffer);
                    if decoded.is_notable() {
                        info!("{}", trace.trim_end());
                    } else {
                        debug!("{}", trace.trim_end());
                    }
                }
                decoded
            }
            Err(failed) => {
                warn!(
                    port = self.port,
                    from = self.direction.origin(),
                    error = %failed.error,
                    decoded_events = failed.decoded.events.len(),
                    bytes = %hex_all(buffer),
                    "decode.error"
                );
                failed.decoded
            }
        };
        for entry in decoded.auto_loot {
            info!(
                port = self.port,
                packet = %hex_all(&entry.bytes),
                "relay.auto_loot"
            );
            self.queue.enqueue_entry(entry);
        }

        let outgoing = self.ctx.hacks.observe(buffer, self.direction);
        if let Some(outcome) = self.ctx.hacks.observe_inbound(buffer, self.direction) {
            info!(port = self.port, outcome = ?outcome, "relay.hack.confirmed");
        }
        outgoing
    }
}

async fn read_some<R>(
    source: &mut R,
    buffer: &mut [u8],
    idle_timeout: Option<Duration>,
) -> std::io::Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, source.read(buffer)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => source.read(buffer).await.map(Some),
    }
}

pub struct PumpHandle {
    pub direction: Direction,
    task: JoinHandle<anyhow::Result<PumpExit>>,
}

impl PumpHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// A client/upstream socket pair with its two running pumps.
pub struct Relay {
    port: u16,
    id: u64,
    client_addr: SocketAddr,
    stop: watch::Sender<bool>,
    pumps: Vec<PumpHandle>,
}

impl Relay {
    /// Splits both sockets and spawns the client→server and server→client
    /// pumps. `queue` belongs to the port and outlives the relay.
    pub fn start(
        port: u16,
        id: u64,
        client: TcpStream,
        upstream: TcpStream,
        queue: Arc<InjectionQueue>,
        ctx: RelayContext,
    ) -> anyhow::Result<Self> {
        let client_addr = client.peer_addr().context("client peer_addr")?;
        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();
        let (stop, stop_rx) = watch::channel(false);

        let upstream_pump = Pump::new(port, Direction::Upstream, queue.clone(), ctx.clone());
        let downstream_pump = Pump::new(port, Direction::Downstream, queue, ctx);
        let pumps = vec![
            PumpHandle {
                direction: Direction::Upstream,
                task: tokio::spawn(supervise(
                    upstream_pump,
                    id,
                    client_read,
                    upstream_write,
                    stop_rx.clone(),
                )),
            },
            PumpHandle {
                direction: Direction::Downstream,
                task: tokio::spawn(supervise(
                    downstream_pump,
                    id,
                    upstream_read,
                    client_write,
                    stop_rx,
                )),
            },
        ];

        Ok(Self {
            port,
            id,
            client_addr,
            stop,
            pumps,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn pumps(&self) -> &[PumpHandle] {
        &self.pumps
    }

    /// True while at least one pump is still copying.
    pub fn is_running(&self) -> bool {
        self.pumps.iter().any(|pump| !pump.is_finished())
    }

    /// Signals both pumps to exit; they half-close their sinks on the way out.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Waits for both pumps and returns how each one ended.
    pub async fn join(self) -> Vec<(Direction, anyhow::Result<PumpExit>)> {
        let mut exits = Vec::with_capacity(self.pumps.len());
        for pump in self.pumps {
            let exit = match pump.task.await {
                Ok(result) => result,
                Err(err) => Err(anyhow::Error::new(err).context("pump task panicked")),
            };
            exits.push((pump.direction, exit));
        }
        exits
    }
}

async fn supervise<R, W>(
    pump: Pump,
    relay_id: u64,
    source: R,
    sink: W,
    stop: watch::Receiver<bool>,
) -> anyhow::Result<PumpExit>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let port = pump.port;
    let direction = pump.direction;
    debug!(port, relay = relay_id, direction = %direction, "relay.pump.start");
    let result = pump.run(source, sink, stop).await;
    match &result {
        Ok(exit) => info!(
            port,
            relay = relay_id,
            lane = %pump_name(direction, port),
            exit = %exit,
            "relay.pump.end"
        ),
        Err(err) => warn!(
            port,
            relay = relay_id,
            lane = %pump_name(direction, port),
            error = format_args!("{err:#}"),
            "relay.pump.end"
        ),
    }
    result
}
