//! beast-splitter: receive Beast-format input and fan it out to clients.
//!
//! One upstream receiver (serial device or remote TCP peer) feeds any
//! number of downstream clients, each with its own negotiated output
//! format and filter. The union of the client filters is pushed back to
//! the device so it only transmits what somebody wants.

use std::cell::RefCell;
use std::io;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use beast_core::{Filter, FilterDistributor, Settings};

mod net;
mod output;
mod receiver;
mod serial;
mod status;

use receiver::{Receiver, ReceiverState, SharedReceiverState};

#[derive(Parser)]
#[command(
    name = "beast-splitter",
    version,
    about = "Mode S Beast receiver splitter"
)]
struct Cli {
    /// Path to the receiver's serial device
    #[arg(long, value_name = "PATH")]
    serial: Option<String>,

    /// Remote receiver to connect to
    #[arg(long, value_name = "HOST:PORT")]
    net: Option<String>,

    /// Fixed baud rate for the serial device; 0 selects autobauding
    #[arg(long, default_value_t = 0, value_name = "N")]
    fixed_baud: u32,

    /// Listen for clients on [HOST:]PORT[:SETTINGS] (repeatable)
    #[arg(long, value_name = "[HOST:]PORT[:SETTINGS]")]
    listen: Vec<String>,

    /// Maintain a client connection to HOST:PORT[:SETTINGS] (repeatable)
    #[arg(long, value_name = "HOST:PORT[:SETTINGS]")]
    connect: Vec<String>,

    /// Settings to force on or off when configuring the receiver
    #[arg(long, default_value = "", value_name = "SETTINGS")]
    force: String,

    /// Write a JSON status snapshot to this path
    #[arg(long, value_name = "PATH")]
    status_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Option parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputSpec {
    host: String,
    port: u16,
    settings: Settings,
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse::<u16>().map_err(|_| format!("invalid port '{s}'"))
}

fn parse_settings(s: &str) -> Result<Settings, String> {
    s.parse::<Settings>().map_err(|e| e.to_string())
}

/// `host:port[:settings]`
fn parse_connect_spec(s: &str) -> Result<OutputSpec, String> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [host, port] => Ok(OutputSpec {
            host: (*host).to_string(),
            port: parse_port(port)?,
            settings: Settings::default(),
        }),
        [host, port, settings] => Ok(OutputSpec {
            host: (*host).to_string(),
            port: parse_port(port)?,
            settings: parse_settings(settings)?,
        }),
        _ => Err(format!("expected host:port[:settings], got '{s}'")),
    }
}

/// `[host:]port[:settings]`; the host defaults to the wildcard address.
fn parse_listen_spec(s: &str) -> Result<OutputSpec, String> {
    const ANY: &str = "0.0.0.0";
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [port] => Ok(OutputSpec {
            host: ANY.to_string(),
            port: parse_port(port)?,
            settings: Settings::default(),
        }),
        [first, second] => {
            // port:settings or host:port, disambiguated by what parses.
            if let Ok(port) = parse_port(second) {
                Ok(OutputSpec {
                    host: (*first).to_string(),
                    port,
                    settings: Settings::default(),
                })
            } else {
                Ok(OutputSpec {
                    host: ANY.to_string(),
                    port: parse_port(first)?,
                    settings: parse_settings(second)?,
                })
            }
        }
        [host, port, settings] => Ok(OutputSpec {
            host: (*host).to_string(),
            port: parse_port(port)?,
            settings: parse_settings(settings)?,
        }),
        _ => Err(format!("expected [host:]port[:settings], got '{s}'")),
    }
}

enum InputConfig {
    Serial { path: String, fixed_baud: u32 },
    Net { host: String, port: u16 },
}

struct Config {
    input: InputConfig,
    listen: Vec<OutputSpec>,
    connect: Vec<OutputSpec>,
    force: Settings,
    status_file: Option<PathBuf>,
}

fn usage_error(message: &str) -> ! {
    eprintln!("{message}");
    eprintln!("Run with --help for usage.");
    std::process::exit(1)
}

fn build_config(cli: Cli) -> Config {
    let input = match (&cli.serial, &cli.net) {
        (Some(path), None) => InputConfig::Serial {
            path: path.clone(),
            fixed_baud: cli.fixed_baud,
        },
        (None, Some(spec)) => {
            let Some((host, port)) = spec.rsplit_once(':') else {
                usage_error(&format!("--net: expected HOST:PORT, got '{spec}'"));
            };
            match parse_port(port) {
                Ok(port) => InputConfig::Net {
                    host: host.to_string(),
                    port,
                },
                Err(e) => usage_error(&format!("--net: {e}")),
            }
        }
        _ => usage_error("exactly one of --serial and --net is required"),
    };

    if cli.listen.is_empty() && cli.connect.is_empty() {
        usage_error("at least one --listen or --connect argument is needed");
    }

    let listen = cli
        .listen
        .iter()
        .map(|s| parse_listen_spec(s).unwrap_or_else(|e| usage_error(&format!("--listen: {e}"))))
        .collect();
    let connect = cli
        .connect
        .iter()
        .map(|s| parse_connect_spec(s).unwrap_or_else(|e| usage_error(&format!("--connect: {e}"))))
        .collect();
    let force = cli
        .force
        .parse::<Settings>()
        .unwrap_or_else(|e| usage_error(&format!("--force: {e}")));

    Config {
        input,
        listen,
        connect,
        force,
        status_file: cli.status_file,
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    let config = build_config(cli);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(99);
        }
    };

    // Everything runs single-threaded on one local task set: connection
    // state is shared with Rc/RefCell, no locking anywhere.
    let local = tokio::task::LocalSet::new();
    if let Err(e) = local.block_on(&runtime, run(config)) {
        eprintln!("{e:#}");
        std::process::exit(99);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let distributor = Rc::new(RefCell::new(FilterDistributor::new()));
    let state: SharedReceiverState = Rc::new(ReceiverState::default());

    let (filter_tx, filter_rx) = mpsc::unbounded_channel();
    distributor
        .borrow_mut()
        .set_filter_notifier(move |filter: &Filter| {
            let _ = filter_tx.send(*filter);
        });

    // Bind every listener up front; a spec none of whose addresses bind is
    // fatal.
    for spec in &config.listen {
        let addrs = (spec.host.as_str(), spec.port)
            .to_socket_addrs()
            .with_context(|| format!("resolving {}:{}", spec.host, spec.port))?;

        let mut bound = false;
        let mut last_error: Option<io::Error> = None;
        for addr in addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!("listening on {addr}");
                    tokio::task::spawn_local(output::run_listener(
                        listener,
                        spec.settings,
                        distributor.clone(),
                        state.clone(),
                    ));
                    bound = true;
                }
                Err(e) => {
                    warn!("could not listen on {addr}: {e}");
                    last_error = Some(e);
                }
            }
        }
        if !bound {
            let reason = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".to_string());
            anyhow::bail!(
                "could not bind to any address of {}:{}: {reason}",
                spec.host,
                spec.port
            );
        }
    }

    for spec in config.connect {
        tokio::task::spawn_local(output::run_connect(
            spec.host,
            spec.port,
            spec.settings,
            distributor.clone(),
            state.clone(),
        ));
    }

    if let Some(path) = config.status_file {
        status::StatusWriter::start(path, &distributor, state.clone());
    }

    match config.input {
        InputConfig::Serial { path, fixed_baud } => {
            let transport = serial::SerialTransport::new(path, fixed_baud);
            Receiver::new(transport, config.force, state, distributor, filter_rx)
                .run()
                .await;
        }
        InputConfig::Net { host, port } => {
            let transport = net::NetTransport::new(host, port);
            Receiver::new(transport, config.force, state, distributor, filter_rx)
                .run()
                .await;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_spec() {
        let spec = parse_connect_spec("localhost:30005").unwrap();
        assert_eq!(spec.host, "localhost");
        assert_eq!(spec.port, 30005);
        assert_eq!(spec.settings, Settings::default());
    }

    #[test]
    fn test_parse_connect_spec_with_settings() {
        let spec = parse_connect_spec("feed.example.com:30004:CdJ").unwrap();
        assert_eq!(spec.host, "feed.example.com");
        assert_eq!(spec.port, 30004);
        assert!(spec.settings.binary_format.is_on());
        assert!(spec.settings.filter_11_17_18.is_off());
        assert!(spec.settings.modeac_enable.is_on());
    }

    #[test]
    fn test_parse_connect_spec_rejects_bare_port() {
        assert!(parse_connect_spec("30005").is_err());
    }

    #[test]
    fn test_parse_connect_spec_rejects_bad_settings() {
        assert!(parse_connect_spec("host:30005:Cx").is_err());
        assert!(parse_connect_spec("host:notaport").is_err());
    }

    #[test]
    fn test_parse_listen_spec_bare_port() {
        let spec = parse_listen_spec("30005").unwrap();
        assert_eq!(spec.host, "0.0.0.0");
        assert_eq!(spec.port, 30005);
    }

    #[test]
    fn test_parse_listen_spec_host_port() {
        let spec = parse_listen_spec("127.0.0.1:30005").unwrap();
        assert_eq!(spec.host, "127.0.0.1");
        assert_eq!(spec.port, 30005);
    }

    #[test]
    fn test_parse_listen_spec_port_settings() {
        let spec = parse_listen_spec("30005:ceD").unwrap();
        assert_eq!(spec.host, "0.0.0.0");
        assert_eq!(spec.port, 30005);
        assert!(spec.settings.binary_format.is_off());
        assert!(spec.settings.avrmlat.is_off());
        assert!(spec.settings.filter_11_17_18.is_on());
    }

    #[test]
    fn test_parse_listen_spec_full() {
        assert!(parse_listen_spec("::1:x").is_err());

        let spec = parse_listen_spec("10.0.0.1:30104:R").unwrap();
        assert_eq!(spec.host, "10.0.0.1");
        assert_eq!(spec.port, 30104);
        assert!(spec.settings.radarcape.is_on());
    }

    #[test]
    fn test_parse_listen_spec_bad_port() {
        assert!(parse_listen_spec("99999").is_err());
        assert!(parse_listen_spec("").is_err());
    }
}
