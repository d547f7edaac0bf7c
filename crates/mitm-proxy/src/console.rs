//! Operator console. The same command set is read from stdin and, when
//! configured, from a line-based TCP control port.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use mitm_core::hack::DEFAULT_RETRIES;
use mitm_core::hex::{decode_hex, hex_prefix};
use mitm_core::protocol::DispatchTable;
use mitm_core::{Decoder, Direction, HackEngine, HackKind};

use crate::config_loader::ConfigLoader;
use crate::manager::{RelayRegistry, accept_retrying};

const ECHO_HEX_LIMIT: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hello,
    Quit,
    Threads,
    /// Queue raw bytes toward the server (`s <hex>`) or client (`c <hex>`).
    Inject(Direction, Vec<u8>),
    Hack { kind: HackKind, retries: u32 },
    HackStatus,
    HackCancel,
    /// Show per-port queue depths.
    Queue,
    /// Drop everything still queued on every port.
    QueueClear,
    Reload,
    Help,
}

const HELP: &str = "\
commands:
  hello                      check the console is alive
  t | thread | threads       list relay pumps
  s <hex>                    queue bytes toward the server on every running relay
  c <hex>                    queue bytes toward the client on every running relay
  h | hack <name> [retries]  arm a hack (fireballs)
  hack status                show the hack engine state
  hack cancel                drop the active and pending hacks
  queue                      show queued packets per port
  queue clear                drop every queued packet
  reload                     re-read the opcode table
  q | quit | exit            stop the proxy";

pub fn parse_command(line: &str) -> anyhow::Result<Command> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    let command = match head.to_ascii_lowercase().as_str() {
        "hello" => Command::Hello,
        "q" | "quit" | "exit" => Command::Quit,
        "t" | "thread" | "threads" => Command::Threads,
        "help" | "?" => Command::Help,
        "reload" => Command::Reload,
        "queue" => match rest.to_ascii_lowercase().as_str() {
            "" | "status" => Command::Queue,
            "clear" => Command::QueueClear,
            other => anyhow::bail!("unknown queue action {other:?}"),
        },
        "s" => Command::Inject(Direction::Upstream, parse_payload(rest)?),
        "c" => Command::Inject(Direction::Downstream, parse_payload(rest)?),
        "h" | "hack" => parse_hack(rest)?,
        "" => anyhow::bail!("empty command"),
        other => anyhow::bail!("unknown command {other:?} (try `help`)"),
    };
    Ok(command)
}

fn parse_payload(rest: &str) -> anyhow::Result<Vec<u8>> {
    if rest.is_empty() {
        anyhow::bail!("missing hex payload");
    }
    decode_hex(rest).with_context(|| format!("invalid hex payload {rest:?}"))
}

fn parse_hack(rest: &str) -> anyhow::Result<Command> {
    let mut args = rest.split_whitespace();
    let Some(name) = args.next() else {
        return Ok(Command::HackStatus);
    };
    match name.to_ascii_lowercase().as_str() {
        "status" => return Ok(Command::HackStatus),
        "cancel" => return Ok(Command::HackCancel),
        _ => {}
    }

    let kind = HackKind::parse(name).ok_or_else(|| anyhow::anyhow!("unknown hack {name:?}"))?;
    let retries = match args.next() {
        Some(value) => value
            .parse::<u32>()
            .with_context(|| format!("invalid retry count {value:?}"))?,
        None => DEFAULT_RETRIES,
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument {extra:?}");
    }
    Ok(Command::Hack { kind, retries })
}

/// Executes console commands against the running proxy.
pub struct Console {
    registry: Arc<RelayRegistry>,
    hacks: Arc<HackEngine>,
    decoder: Arc<Decoder>,
    opcode_table: Option<PathBuf>,
    shutdown: watch::Sender<bool>,
}

impl Console {
    pub fn new(
        registry: Arc<RelayRegistry>,
        hacks: Arc<HackEngine>,
        decoder: Arc<Decoder>,
        opcode_table: Option<PathBuf>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            registry,
            hacks,
            decoder,
            opcode_table,
            shutdown,
        }
    }

    /// Parses and runs one line; the reply is what the operator sees.
    pub fn handle_line(&self, line: &str) -> String {
        match parse_command(line) {
            Ok(command) => self.execute(command),
            Err(err) => {
                warn!(error = format_args!("{err:#}"), line = line.trim(), "console.bad_line");
                format!("error: {err:#}")
            }
        }
    }

    pub fn execute(&self, command: Command) -> String {
        match command {
            Command::Hello => "hello".to_string(),
            Command::Help => HELP.to_string(),
            Command::Quit => {
                info!("console.quit");
                self.shutdown.send_replace(true);
                "bye".to_string()
            }
            Command::Threads => self.threads(),
            Command::Inject(direction, bytes) => {
                let ports = self.registry.enqueue_running(direction, &bytes);
                info!(
                    to = direction.destination(),
                    packet = %hex_prefix(&bytes, ECHO_HEX_LIMIT),
                    ports = ?ports,
                    "console.enqueue"
                );
                if ports.is_empty() {
                    "no running relay; nothing queued".to_string()
                } else {
                    format!(
                        "queued {} bytes to {} on ports {:?}",
                        bytes.len(),
                        direction.destination(),
                        ports
                    )
                }
            }
            Command::Hack { kind, retries } => {
                self.hacks.arm(kind.spec(retries));
                format!("armed {kind} retries={retries}")
            }
            Command::HackStatus => self.hacks.status().to_string(),
            Command::HackCancel => {
                let dropped = self.hacks.cancel();
                info!(dropped, "console.hack.cancel");
                format!("cancelled {dropped} hack(s)")
            }
            Command::Queue => self.queues(),
            Command::QueueClear => {
                let mut dropped = 0;
                for port in self.registry.ports() {
                    if let Some(queue) = self.registry.queue(port) {
                        dropped += queue.clear(Direction::Upstream);
                        dropped += queue.clear(Direction::Downstream);
                    }
                }
                info!(dropped, "console.queue.clear");
                format!("cleared {dropped} packet(s)")
            }
            Command::Reload => match self.reload() {
                Ok(version) => format!("opcode table v{version} active"),
                Err(err) => {
                    warn!(error = format_args!("{err:#}"), "console.reload_failed");
                    format!("error: {err:#}")
                }
            },
        }
    }

    fn threads(&self) -> String {
        let mut lines: Vec<String> = self
            .registry
            .ports()
            .into_iter()
            .map(|port| format!("Proxy [{port}] listening"))
            .collect();
        for pump in self.registry.pump_statuses() {
            lines.push(format!(
                "{} relay={} {}",
                pump.name,
                pump.relay_id,
                if pump.running { "running" } else { "finished" }
            ));
        }
        if lines.is_empty() {
            return "no relays".to_string();
        }
        lines.join("\n")
    }

    fn queues(&self) -> String {
        let running = self.registry.running_ports();
        let lines: Vec<String> = self
            .registry
            .ports()
            .into_iter()
            .filter_map(|port| {
                let queue = self.registry.queue(port)?;
                Some(format!(
                    "[{port}] to_server={} to_client={}{}",
                    queue.len(Direction::Upstream),
                    queue.len(Direction::Downstream),
                    if running.contains(&port) { " running" } else { "" }
                ))
            })
            .collect();
        if lines.is_empty() {
            return "no ports".to_string();
        }
        lines.join("\n")
    }

    /// Rebuilds the table from the configured file, or the built-in bindings
    /// when none is configured, under the next version number.
    fn reload(&self) -> anyhow::Result<u64> {
        let version = match &self.opcode_table {
            Some(path) => {
                let text = ConfigLoader::read_text(path)?;
                self.decoder
                    .reload_from_toml(&text)
                    .with_context(|| format!("load opcode table {}", path.display()))?
            }
            None => self
                .decoder
                .reload_with(|version| anyhow::Ok(DispatchTable::builtin(version)))?,
        };
        info!(version, "decoder.table.reloaded");
        Ok(version)
    }
}

/// Reads commands from stdin until EOF or shutdown.
///
/// Stdin is read on a dedicated thread so a pending line never holds up
/// runtime shutdown.
pub async fn run_stdin(console: Arc<Console>, mut shutdown: watch::Receiver<bool>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<std::io::Result<String>>();
    let spawned = std::thread::Builder::new()
        .name("console-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "console.stdin.spawn_failed");
        return;
    }

    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => break,
            line = rx.recv() => line,
        };
        match line {
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => println!("{}", console.handle_line(&line)),
            Some(Err(err)) => {
                warn!(error = %err, "console.stdin.error");
                break;
            }
            None => {
                info!("console.stdin.closed");
                break;
            }
        }
    }
}

/// Line console over TCP. Every reply ends with an empty line so scripted
/// clients can tell where multi-line replies stop.
pub async fn serve_control(
    listener: TcpListener,
    console: Arc<Console>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = &listener;
    loop {
        let (socket, addr) = tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => return Ok(()),
            accepted = accept_retrying(move || listener.accept(), "control") => accepted,
        };
        info!(client = %addr, "control.accepted");

        let console = console.clone();
        tokio::spawn(async move {
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let reply = format!("{}\n\n", console.handle_line(&line));
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            info!(client = %addr, "control.closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_commands() {
        assert_eq!(parse_command("hello").unwrap(), Command::Hello);
        for quit in ["q", "quit", "exit", " QUIT "] {
            assert_eq!(parse_command(quit).unwrap(), Command::Quit);
        }
        for threads in ["t", "thread", "threads"] {
            assert_eq!(parse_command(threads).unwrap(), Command::Threads);
        }
        assert_eq!(parse_command("reload").unwrap(), Command::Reload);
        assert_eq!(parse_command("queue").unwrap(), Command::Queue);
        assert_eq!(parse_command("queue clear").unwrap(), Command::QueueClear);
        assert!(parse_command("queue flush").is_err());
    }

    #[test]
    fn parses_injection_hex_with_spaces() {
        assert_eq!(
            parse_command("s 6565 0100 0000").unwrap(),
            Command::Inject(Direction::Upstream, vec![0x65, 0x65, 0x01, 0x00, 0x00, 0x00])
        );
        assert_eq!(
            parse_command("c 2b2b").unwrap(),
            Command::Inject(Direction::Downstream, vec![0x2b, 0x2b])
        );
        assert!(parse_command("s").is_err());
        assert!(parse_command("s 6g").is_err());
        assert!(parse_command("c 123").is_err());
    }

    #[test]
    fn parses_hack_commands() {
        assert_eq!(
            parse_command("h fireballs").unwrap(),
            Command::Hack {
                kind: HackKind::FireBalls,
                retries: DEFAULT_RETRIES
            }
        );
        assert_eq!(
            parse_command("hack fire_balls 3").unwrap(),
            Command::Hack {
                kind: HackKind::FireBalls,
                retries: 3
            }
        );
        assert_eq!(parse_command("hack").unwrap(), Command::HackStatus);
        assert_eq!(parse_command("hack status").unwrap(), Command::HackStatus);
        assert_eq!(parse_command("hack cancel").unwrap(), Command::HackCancel);
        assert!(parse_command("hack nope").is_err());
        assert!(parse_command("hack fireballs many").is_err());
    }

    #[test]
    fn unknown_command_is_an_error() {
        let err = parse_command("dance").unwrap_err();
        assert!(format!("{err:#}").contains("unknown command"));
    }

    fn console() -> (Console, watch::Receiver<bool>, Arc<HackEngine>, Arc<Decoder>) {
        console_with(Arc::new(RelayRegistry::new()))
    }

    fn console_with(
        registry: Arc<RelayRegistry>,
    ) -> (Console, watch::Receiver<bool>, Arc<HackEngine>, Arc<Decoder>) {
        let (tx, rx) = watch::channel(false);
        let hacks = Arc::new(HackEngine::new());
        let decoder = Arc::new(Decoder::with_builtin_table(true));
        let console = Console::new(
            registry,
            hacks.clone(),
            decoder.clone(),
            None,
            tx,
        );
        (console, rx, hacks, decoder)
    }

    #[test]
    fn quit_raises_shutdown() {
        let (console, rx, _, _) = console();
        assert_eq!(console.handle_line("q"), "bye");
        assert!(*rx.borrow());
    }

    #[test]
    fn injection_without_relays_queues_nothing() {
        let (console, _rx, _, _) = console();
        assert_eq!(console.handle_line("s 0102"), "no running relay; nothing queued");
        assert_eq!(console.handle_line("t"), "no relays");
    }

    #[test]
    fn hack_commands_drive_the_engine() {
        let (console, _rx, hacks, _) = console();
        assert_eq!(console.handle_line("h fireballs 2"), "armed fire_balls retries=2");
        assert_eq!(hacks.status().pending, 1);
        assert!(console.handle_line("hack status").contains("Armed"));
        assert_eq!(console.handle_line("hack cancel"), "cancelled 1 hack(s)");
    }

    #[test]
    fn reload_without_file_bumps_builtin_version() {
        let (console, _rx, _, decoder) = console();
        assert_eq!(console.handle_line("reload"), "opcode table v2 active");
        assert_eq!(decoder.version(), 2);
    }

    #[test]
    fn queue_commands_report_and_clear_port_queues() {
        let registry = Arc::new(RelayRegistry::new());
        let queue = registry.register_port(3000);
        registry.register_port(3333);
        queue.enqueue(Direction::Upstream, vec![1]);
        queue.enqueue(Direction::Downstream, vec![2]);
        queue.enqueue(Direction::Downstream, vec![3]);
        let (console, _rx, _, _) = console_with(registry);

        assert_eq!(
            console.handle_line("queue"),
            "[3000] to_server=1 to_client=2\n[3333] to_server=0 to_client=0"
        );
        assert_eq!(console.handle_line("queue clear"), "cleared 3 packet(s)");
        assert!(queue.is_empty());
    }
}
