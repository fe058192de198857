//! Binary entrypoint for the smsgate CLI.
//!
//! Commands:
//! - `start [--port <path>] [--notify-port <path>]` - run the device monitor until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `stats`, `list`, `send`, `delete` - one-shot modem operations, JSON on stdout
//! - `inbox`, `inbox-delete <id>` - inspect or prune the persisted inbox (safe
//!   while `start` is running; the inbox file is re-read under its lock)
//! - `usb-check` - probe the USB stick and switch it to modem mode if needed
//!
//! See the library crate docs for module-level details: `smsgate::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;

use smsgate::config::Config;
use smsgate::instance::InstanceLock;
use smsgate::modem::{sms, DynEngine, SerialOpener};
use smsgate::monitor::{self, Monitor, MonitorSettings};
use smsgate::storage::MessageStore;
use smsgate::{metrics, usb};

#[derive(Parser)]
#[command(name = "smsgate")]
#[command(about = "SMS gateway for GSM USB modems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device monitor and collect incoming messages
    Start {
        /// Command port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
        /// Notification port (e.g., /dev/ttyUSB2)
        #[arg(short, long)]
        notify_port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show signal quality, registration and storage usage
    Stats,
    /// List messages stored on the modem
    List {
        /// Status filter passed to AT+CMGL
        #[arg(short, long, default_value = "ALL")]
        filter: String,
    },
    /// Send a text message
    Send { destination: String, body: String },
    /// Delete a message from modem storage
    Delete { index: String },
    /// Print the persisted inbox
    Inbox,
    /// Remove a message from the persisted inbox by id
    InboxDelete { id: String },
    /// Probe the USB stick mode and switch it to modem mode if needed
    UsbCheck,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    let mut config = match (&cli.command, pre_config) {
        (Commands::Init, _) => Config::default(),
        (_, Some(cfg)) => cfg,
        (_, None) => Config::load_or_default(&cli.config).await?,
    };
    config.apply_env_overrides();

    match cli.command {
        Commands::Init => {
            if std::path::Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists; not overwriting", cli.config));
            }
            Config::create_default(&cli.config).await?;
            println!("Wrote default configuration to {}", cli.config);
        }
        Commands::Start { port, notify_port } => {
            if let Some(p) = port {
                config.modem.command_port = p;
            }
            if let Some(p) = notify_port {
                config.modem.notify_port = p;
            }
            info!("Starting smsgate v{}", env!("CARGO_PKG_VERSION"));
            let _instance = InstanceLock::acquire(&config.modem.lock_path)?;
            usb::ensure_modem_mode(&config.usb).await;

            let store = MessageStore::load(&config.storage.inbox_path).into_shared();
            let monitor = Monitor::new(
                config.modem.monitor_settings(),
                Arc::new(SerialOpener {
                    read_timeout: config.modem.read_timeout(),
                }),
                store,
            );
            let handle = monitor.handle();
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let task = tokio::spawn(monitor.run(shutdown_rx));

            tokio::signal::ctrl_c().await?;
            info!("Interrupted; stopping");
            let _ = shutdown_tx.send(true);
            if let Err(e) = task.await {
                warn!("Monitor task ended abnormally: {}", e);
            }
            let status = handle.status();
            info!(
                "Final state {:?} after {} session(s); {} message(s) in inbox",
                status.state,
                status.generation,
                handle.stored_messages().await.len()
            );
            info!("Metrics: {:?}", metrics::snapshot());
        }
        Commands::Stats => {
            let (_instance, mut engine) = open_one_shot(&config).await?;
            let stats = sms::link_stats(&mut engine).await?;
            let payload = serde_json::json!({
                "signal_quality": stats.signal_quality,
                "registration": stats.registration,
                "storage": stats.storage,
                "rssi_dbm": stats.rssi_dbm(),
                "metrics": metrics::snapshot(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::List { filter } => {
            let (_instance, mut engine) = open_one_shot(&config).await?;
            let report = sms::list_sms(&mut engine, &filter).await?;
            if !report.is_clean() {
                warn!("{} listing entries could not be parsed", report.errors.len());
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Send { destination, body } => {
            let (_instance, mut engine) = open_one_shot(&config).await?;
            sms::send_sms(&mut engine, &destination, &body).await?;
            println!("{}", serde_json::json!({ "status": "sent", "destination": destination }));
        }
        Commands::Delete { index } => {
            let (_instance, mut engine) = open_one_shot(&config).await?;
            sms::delete_sms(&mut engine, &index).await?;
            println!("{}", serde_json::json!({ "status": "deleted", "index": index }));
        }
        Commands::Inbox => {
            let store = MessageStore::load(&config.storage.inbox_path);
            println!("{}", serde_json::to_string_pretty(store.messages())?);
        }
        Commands::InboxDelete { id } => {
            let mut store = MessageStore::load(&config.storage.inbox_path);
            let removed = store.delete(&id);
            println!("{}", serde_json::json!({ "id": id, "removed": removed }));
        }
        Commands::UsbCheck => {
            let before = usb::probe(&config.usb);
            let after = usb::ensure_modem_mode(&config.usb).await;
            println!("{}", serde_json::json!({ "before": before, "after": after }));
        }
    }

    Ok(())
}

/// Open the command port for a single exchange. Refused while a monitor (or
/// another one-shot command) holds the instance lock.
async fn open_one_shot(config: &Config) -> Result<(InstanceLock, DynEngine)> {
    let instance = InstanceLock::acquire(&config.modem.lock_path)?;
    let settings: MonitorSettings = config.modem.monitor_settings();
    let opener = SerialOpener {
        read_timeout: config.modem.read_timeout(),
    };
    let engine = monitor::open_engine(&settings, &opener).await?;
    Ok((instance, engine))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Foreground runs tee to the console; redirected runs only write the file.
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
