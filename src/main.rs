use clap::{Parser, Subcommand};
use irlink::config::{Config, Endpoint};
use irlink::ir::waveform;
use irlink::lirc::{ButtonEvent, Connection, ConnectionOptions, LircError};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "irlink")]
#[command(about = "Command-line client for LIRC-style infrared daemons")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.config/irlink/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Daemon TCP address, overrides the config file
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Daemon Unix socket, overrides the config file
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Daemon(DaemonCommand),
    /// Convert a mode2 binary capture file to token text
    Convert { input: PathBuf },
    /// Generate default config file
    Init,
}

/// Commands that talk to the daemon
#[derive(Subcommand)]
enum DaemonCommand {
    /// Send a command a number of times
    SendOnce {
        remote: String,
        command: String,

        /// Number of repetitions
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Transmitter ports to use (comma separated, 1-based)
        #[arg(short, long, value_delimiter = ',')]
        transmitters: Vec<u32>,
    },
    /// Start repeating a command
    SendStart {
        remote: String,
        command: String,

        /// Transmitter ports to use (comma separated, 1-based)
        #[arg(short, long, value_delimiter = ',')]
        transmitters: Vec<u32>,
    },
    /// Stop a repeating command
    SendStop { remote: String, command: String },
    /// List remotes, or the commands of one remote
    List { remote: Option<String> },
    /// Show the daemon version
    Version,
    /// Inject a button press as if it had been received
    Simulate {
        remote: String,
        button: String,

        /// Scan code in hex
        #[arg(long, default_value = "0", value_parser = parse_hex)]
        code: u64,

        /// Repeat counter
        #[arg(long, default_value_t = 0)]
        repeat: u32,
    },
    /// Select active transmitter ports (none given selects none)
    Transmitters { ports: Vec<u32> },
    /// Capture one raw signal streamed by the daemon
    Receive {
        /// Write the capture as mode2 binary instead of printing tokens
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print button presses broadcast by the daemon until interrupted
    Watch,
}

fn parse_hex(value: &str) -> Result<u64, String> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex code {:?}: {}", value, e))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init => {
            info!("Generating default config...");
            let path = cli.config.unwrap_or_else(Config::default_path);
            Config::default().save(&path)?;
            println!("Created default config: {}", path.display());
        }
        Commands::Convert { input } => {
            let bytes = std::fs::read(&input)?;
            let capture = waveform::decode_mode2_binary(&bytes)?;
            print!("{}", waveform::encode_to_string(&capture));
        }
        Commands::Daemon(command) => {
            let mut config = load_config(cli.config)?;
            if let Some(address) = cli.address {
                config.daemon.address = address;
                config.daemon.socket = None;
            }
            if let Some(socket) = cli.socket {
                config.daemon.socket = Some(socket);
            }

            if let Err(e) = run(command, &config).await {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config, irlink::config::ConfigError> {
    match path {
        Some(path) => Config::load(&path),
        None => {
            let path = Config::default_path();
            if path.exists() {
                debug!("Loading config from {}", path.display());
                Config::load(&path)
            } else {
                Ok(Config::default())
            }
        }
    }
}

async fn connect(config: &Config, options: ConnectionOptions) -> Result<Connection, LircError> {
    match config.endpoint() {
        Endpoint::Tcp(address) => Connection::connect_tcp(&address, options).await,
        #[cfg(unix)]
        Endpoint::Unix(path) => Connection::connect_unix(&path, options).await,
        #[cfg(not(unix))]
        Endpoint::Unix(path) => Err(LircError::Transport(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("Unix sockets are not available here: {}", path.display()),
        ))),
    }
}

/// Ports for a send: explicit ones win over `[transmitters] default`
fn send_ports(explicit: Vec<u32>, config: &Config) -> Option<Vec<u32>> {
    if !explicit.is_empty() {
        return Some(explicit);
    }
    config.transmitters.default.clone()
}

async fn run(command: DaemonCommand, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let mut conn = connect(config, config.connection_options()).await?;

    match command {
        DaemonCommand::SendOnce {
            remote,
            command,
            count,
            transmitters,
        } => {
            match send_ports(transmitters, config) {
                Some(ports) => conn.send_once_on(&remote, &command, count, ports).await?,
                None => conn.send_once(&remote, &command, count).await?,
            }
            info!("Sent {} {} x{}", remote, command, count);
        }
        DaemonCommand::SendStart {
            remote,
            command,
            transmitters,
        } => {
            match send_ports(transmitters, config) {
                Some(ports) => conn.send_start_on(&remote, &command, ports).await?,
                None => conn.send_start(&remote, &command).await?,
            }
            info!("Repeating {} {}", remote, command);
        }
        DaemonCommand::SendStop { remote, command } => {
            conn.send_stop(&remote, &command).await?;
            info!("Stopped {} {}", remote, command);
        }
        DaemonCommand::List { remote: None } => {
            for remote in conn.list_remotes().await? {
                println!("{}", remote);
            }
        }
        DaemonCommand::List {
            remote: Some(remote),
        } => {
            for entry in conn.list_commands(&remote).await? {
                match entry.code {
                    Some(code) => println!("{} {}", code, entry.name),
                    None => println!("{}", entry.name),
                }
            }
        }
        DaemonCommand::Version => {
            println!("{}", conn.version().await?);
        }
        DaemonCommand::Simulate {
            remote,
            button,
            code,
            repeat,
        } => {
            let event = ButtonEvent::new(remote, button, code, repeat);
            conn.simulate(&event).await?;
            info!("Simulated {}", event);
        }
        DaemonCommand::Transmitters { ports } => {
            let mask = conn.set_transmitters(ports).await?;
            println!("Transmitter mask: {}", mask);
        }
        DaemonCommand::Receive { output } => match conn.receive_raw().await? {
            Some(capture) => match output {
                Some(path) => {
                    std::fs::write(&path, waveform::encode_mode2_binary(&capture))?;
                    println!("Wrote {} durations to {}", capture.signal.len(), path.display());
                }
                None => print!("{}", waveform::encode_to_string(&capture)),
            },
            None => println!("No signal received"),
        },
        DaemonCommand::Watch => watch(&mut conn).await?,
    }

    conn.close().await;
    Ok(())
}

async fn watch(conn: &mut Connection) -> Result<(), LircError> {
    let handle = conn.close_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, closing connection");
            handle.close();
        }
    });

    loop {
        match conn.next_event(Duration::from_secs(60)).await {
            Ok(Some(event)) => println!("{}", event),
            Ok(None) => continue,
            Err(LircError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
