//! Per-port listeners that turn accepted clients into relays and hot-swap
//! them when the game reconnects.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mitm_core::{Direction, InjectionQueue};

use crate::config::RelayConfig;
use crate::relay::{Relay, RelayContext, pump_name};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts the next connection, riding out failures such as descriptor
/// exhaustion or aborted handshakes. Only shutdown closes a listener.
pub(crate) async fn accept_retrying<T, F, Fut>(mut accept: F, listener: &str) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(err) => {
                warn!(listener, error = %err, "listener.accept_failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Dials the upstream server, giving up after `limit`.
pub async fn dial_upstream(addr: &str, limit: Duration) -> anyhow::Result<TcpStream> {
    bounded(limit, TcpStream::connect(addr))
        .await
        .with_context(|| format!("connect upstream {addr}"))
}

async fn bounded<T>(limit: Duration, connect: impl Future<Output = io::Result<T>>) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, connect).await {
        Ok(connected) => Ok(connected?),
        Err(_) => anyhow::bail!("timed out after {limit:?}"),
    }
}

/// Where one port listens and where it dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Game port the route stands for; keys the registry and labels logs.
    pub port: u16,
    pub listen: String,
    pub upstream: String,
}

impl Route {
    pub fn new(port: u16, listen: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            port,
            listen: listen.into(),
            upstream: upstream.into(),
        }
    }

    /// Same port on both sides, as the game client expects.
    pub fn mirrored(listen_host: &str, upstream_host: &str, port: u16) -> Self {
        Self::new(
            port,
            format!("{listen_host}:{port}"),
            format!("{upstream_host}:{port}"),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpStatus {
    pub name: String,
    pub relay_id: u64,
    pub running: bool,
}

struct PortSlot {
    queue: Arc<InjectionQueue>,
    relay: Option<Relay>,
}

/// Every port's injection queue and its current relay.
///
/// Queues are created with the port and survive hot-swaps, so packets queued
/// while the game reconnects go out on the new connection.
#[derive(Default)]
pub struct RelayRegistry {
    slots: Mutex<BTreeMap<u16, PortSlot>>,
    next_id: AtomicU64,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the port's queue, creating the slot on first use.
    pub fn register_port(&self, port: u16) -> Arc<InjectionQueue> {
        let mut slots = self.slots.lock();
        slots
            .entry(port)
            .or_insert_with(|| PortSlot {
                queue: Arc::new(InjectionQueue::new()),
                relay: None,
            })
            .queue
            .clone()
    }

    pub fn queue(&self, port: u16) -> Option<Arc<InjectionQueue>> {
        self.slots.lock().get(&port).map(|slot| slot.queue.clone())
    }

    pub fn ports(&self) -> Vec<u16> {
        self.slots.lock().keys().copied().collect()
    }

    fn next_relay_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Makes `relay` current for its port and returns the one it replaces.
    pub fn install(&self, relay: Relay) -> Option<Relay> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(relay.port()).or_insert_with(|| PortSlot {
            queue: Arc::new(InjectionQueue::new()),
            relay: None,
        });
        slot.relay.replace(relay)
    }

    /// Ports whose current relay still has a live pump.
    pub fn running_ports(&self) -> Vec<u16> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.relay.as_ref().is_some_and(Relay::is_running))
            .map(|(&port, _)| port)
            .collect()
    }

    /// Queues `bytes` on every port with a running relay; returns those ports.
    pub fn enqueue_running(&self, direction: Direction, bytes: &[u8]) -> Vec<u16> {
        let slots = self.slots.lock();
        let mut ports = Vec::new();
        for (&port, slot) in slots.iter() {
            if slot.relay.as_ref().is_some_and(Relay::is_running) {
                slot.queue.enqueue(direction, bytes.to_vec());
                ports.push(port);
            }
        }
        ports
    }

    pub fn pump_statuses(&self) -> Vec<PumpStatus> {
        let slots = self.slots.lock();
        let mut out = Vec::new();
        for (&port, slot) in slots.iter() {
            let Some(relay) = &slot.relay else { continue };
            for pump in relay.pumps() {
                out.push(PumpStatus {
                    name: pump_name(pump.direction, port),
                    relay_id: relay.id(),
                    running: !pump.is_finished(),
                });
            }
        }
        out
    }

    /// Stops every current relay and removes it; used at shutdown.
    pub fn take_all(&self) -> Vec<Relay> {
        let mut slots = self.slots.lock();
        let relays: Vec<Relay> = slots
            .values_mut()
            .filter_map(|slot| slot.relay.take())
            .collect();
        for relay in &relays {
            relay.stop();
        }
        relays
    }
}

/// A bound listener for one route.
pub struct PortRelay {
    route: Route,
    listener: TcpListener,
    queue: Arc<InjectionQueue>,
    registry: Arc<RelayRegistry>,
    ctx: RelayContext,
}

impl PortRelay {
    pub async fn bind(
        route: Route,
        registry: Arc<RelayRegistry>,
        ctx: RelayContext,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&route.listen)
            .await
            .with_context(|| format!("bind relay listener {}", route.listen))?;
        let queue = registry.register_port(route.port);
        Ok(Self {
            route,
            listener,
            queue,
            registry,
            ctx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("relay listener local_addr")
    }

    pub fn port(&self) -> u16 {
        self.route.port
    }

    /// Accept loop. Each accepted client gets a fresh upstream connection;
    /// the previous relay on this port is told to stop.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let port = self.route.port;
        info!(
            port,
            listen = %self.route.listen,
            upstream = %self.route.upstream,
            "relay.listening"
        );
        let label = format!("relay:{port}");
        let listener = &self.listener;
        loop {
            let (client, client_addr) = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                accepted = accept_retrying(move || listener.accept(), &label) => accepted,
            };
            info!(port, client = %client_addr, "relay.accepted");

            let dialed = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                dialed = dial_upstream(&self.route.upstream, self.ctx.connect_timeout) => dialed,
            };
            let upstream = match dialed {
                Ok(upstream) => upstream,
                Err(err) => {
                    warn!(
                        port,
                        upstream = %self.route.upstream,
                        error = format_args!("{err:#}"),
                        "relay.upstream.connect_failed"
                    );
                    continue;
                }
            };

            let id = self.registry.next_relay_id();
            let relay = match Relay::start(
                port,
                id,
                client,
                upstream,
                self.queue.clone(),
                self.ctx.clone(),
            ) {
                Ok(relay) => relay,
                Err(err) => {
                    warn!(port, error = format_args!("{err:#}"), "relay.start_failed");
                    continue;
                }
            };
            info!(port, relay = id, client = %client_addr, "relay.established");

            if let Some(previous) = self.registry.install(relay) {
                previous.stop();
                info!(port, relay = previous.id(), "relay.retired");
            }
        }
        info!(port, "relay.listener.closed");
        Ok(())
    }
}

/// All configured ports, bound and serving.
pub struct RelayManager {
    registry: Arc<RelayRegistry>,
    shutdown: watch::Sender<bool>,
    listeners: Vec<(u16, SocketAddr, JoinHandle<anyhow::Result<()>>)>,
}

impl RelayManager {
    /// Binds every route before serving any, so a port conflict fails startup
    /// instead of leaving a partial relay.
    pub async fn start(
        routes: Vec<Route>,
        registry: Arc<RelayRegistry>,
        ctx: RelayContext,
    ) -> anyhow::Result<Self> {
        let mut bound = Vec::with_capacity(routes.len());
        for route in routes {
            bound.push(PortRelay::bind(route, registry.clone(), ctx.clone()).await?);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut listeners = Vec::with_capacity(bound.len());
        for port_relay in bound {
            let port = port_relay.port();
            let addr = port_relay.local_addr()?;
            let task = tokio::spawn(port_relay.serve(shutdown_rx.clone()));
            listeners.push((port, addr, task));
        }
        Ok(Self {
            registry,
            shutdown,
            listeners,
        })
    }

    pub async fn from_config(
        config: &RelayConfig,
        registry: Arc<RelayRegistry>,
        ctx: RelayContext,
    ) -> anyhow::Result<Self> {
        let routes = config
            .ports()
            .into_iter()
            .map(|port| Route::mirrored(&config.listen_host, &config.upstream_host, port))
            .collect();
        Self::start(routes, registry, ctx).await
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(p, _, _)| *p == port)
            .map(|(_, addr, _)| *addr)
    }

    /// Stops accepting, retires every relay and waits for all tasks.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for (port, _, task) in self.listeners {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(port, error = format_args!("{err:#}"), "relay.listener.error"),
                Err(err) => warn!(port, error = %err, "relay.listener.join_error"),
            }
        }
        for relay in self.registry.take_all() {
            let id = relay.id();
            for (direction, exit) in relay.join().await {
                if let Err(err) = exit {
                    warn!(
                        relay = id,
                        direction = %direction,
                        error = format_args!("{err:#}"),
                        "relay.shutdown.pump_error"
                    );
                }
            }
        }
        info!("relay.manager.stopped");
    }
}
