//! Network side of the game relay: listeners, relays, console and the
//! process wiring around them.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use mitm_core::protocol::DispatchTable;
use mitm_core::{Decoder, HackEngine};

pub mod config;
pub mod config_loader;
pub mod console;
pub mod logging;
pub mod manager;
pub mod relay;

use crate::config::Config;
use crate::config_loader::ConfigLoader;
use crate::console::Console;
use crate::manager::{RelayManager, RelayRegistry};
use crate::relay::RelayContext;

/// Builds the decoder from the configured opcode table, or the built-in one.
pub fn build_decoder(config: &Config) -> anyhow::Result<Decoder> {
    let table = match &config.decoder.opcode_table {
        Some(path) => {
            let text = ConfigLoader::read_text(path)?;
            DispatchTable::from_toml_str(1, &text)
                .with_context(|| format!("load opcode table {}", path.display()))?
        }
        None => DispatchTable::builtin(1),
    };
    info!(
        version = table.version(),
        source = %config
            .decoder
            .opcode_table
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "builtin".to_string()),
        auto_loot = config.decoder.auto_loot,
        "decoder.table.loaded"
    );
    Ok(Decoder::new(table, config.decoder.auto_loot))
}

/// Runs the proxy until `quit` on the console or Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let decoder = Arc::new(build_decoder(&config)?);
    let hacks = Arc::new(HackEngine::new());
    let registry = Arc::new(RelayRegistry::new());

    let mut ctx = RelayContext::new(decoder.clone(), hacks.clone());
    ctx.read_buffer_size = config.relay.read_buffer_size;
    ctx.idle_timeout = config.relay.idle_timeout();
    ctx.connect_timeout = config.relay.connect_timeout();

    let manager = RelayManager::from_config(&config.relay, registry.clone(), ctx).await?;
    info!(
        listen = %config.relay.listen_host,
        upstream = %config.relay.upstream_host,
        ports = ?config.relay.ports(),
        "proxy.started"
    );

    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let console = Arc::new(Console::new(
        registry,
        hacks,
        decoder,
        config.decoder.opcode_table.clone(),
        shutdown.clone(),
    ));

    let control_task = match &config.control.listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind control listener {addr}"))?;
            info!(listen = %addr, "control.listening");
            Some(tokio::spawn(console::serve_control(
                listener,
                console.clone(),
                shutdown_rx.clone(),
            )))
        }
        None => None,
    };
    let stdin_task = tokio::spawn(console::run_stdin(console, shutdown_rx.clone()));

    tokio::select! {
        _ = shutdown_rx.wait_for(|stopped| *stopped) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "proxy.signal.error");
            }
            info!("proxy.interrupted");
        }
    }
    shutdown.send_replace(true);

    manager.shutdown().await;
    if let Some(task) = control_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = format_args!("{err:#}"), "control.error"),
            Err(err) => warn!(error = %err, "control.join_error"),
        }
    }
    if let Err(err) = stdin_task.await {
        warn!(error = %err, "console.join_error");
    }
    info!("proxy.stopped");
    Ok(())
}
