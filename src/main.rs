use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use joyprog::config::DaemonConfig;
use joyprog::output::{LoggingSink, OutputSink, UinputSink};
use joyprog::registry::{DeviceRegistry, DeviceWatcher, EvdevDeviceFactory, RegistryCommand};

#[derive(Parser)]
#[command(name = "joyprogd")]
#[command(about = "Runs Lua programs bound to joystick buttons and axes")]
struct Cli {
    /// Config file path (default: ~/.config/joyprog/daemon.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to watch for input devices
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Program loaded on every device
    #[arg(short, long)]
    profile: Option<PathBuf>,

    /// Log output actions instead of emitting them
    #[arg(long)]
    dry_run: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(&cli.log_level)?;

    let config_path = cli.config.unwrap_or_else(DaemonConfig::default_path);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(input_dir) = cli.input_dir {
        config.input_dir = input_dir;
    }
    if let Some(profile) = cli.profile {
        config.profile = Some(profile);
    }
    config.validate()?;

    let sink: Arc<dyn OutputSink> = if cli.dry_run {
        info!("Dry run, output actions are only logged");
        Arc::new(LoggingSink)
    } else {
        Arc::new(UinputSink::create(&config.output_name)?)
    };

    let (file_tx, file_rx) = mpsc::unbounded_channel();
    let (lost_tx, lost_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let factory = EvdevDeviceFactory::new(sink, config.script_settings(), lost_tx);
    let registry = DeviceRegistry::new(factory, &config.input_dir, load_profile(&config));
    let registry_task = tokio::spawn(registry.run(file_rx, lost_rx, command_rx, shutdown.clone()));

    // Watch first, then scan, so nothing slips through in between
    let watcher = DeviceWatcher::create(&config.input_dir, &config.device_prefix, file_tx)?;
    let _watcher = watcher.scan()?;

    let mut hangup = signal(SignalKind::hangup())?;
    let mut report = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                info!("Shutting down");
                break;
            }
            _ = hangup.recv() => {
                info!("Reloading profile");
                let program = load_profile(&config);
                if command_tx.send(RegistryCommand::LoadProgram(program)).is_err() {
                    return Err(eyre!("Device registry stopped unexpectedly"));
                }
            }
            _ = report.recv() => {
                if command_tx.send(RegistryCommand::Report).is_err() {
                    return Err(eyre!("Device registry stopped unexpectedly"));
                }
            }
        }
    }

    shutdown.cancel();
    registry_task.await?;
    Ok(())
}

/// Reads the configured profile; an unreadable file counts as no program
fn load_profile(config: &DaemonConfig) -> Option<Arc<str>> {
    match config.read_profile() {
        Ok(Some(program)) => Some(Arc::from(program)),
        Ok(None) => {
            warn!("No profile configured, devices start without a program");
            None
        }
        Err(e) => {
            error!("{}", e);
            None
        }
    }
}

fn setup(log_level: &str) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let level: Level = log_level
        .parse()
        .map_err(|_| eyre!("Invalid log level: {}", log_level))?;
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .init();
    Ok(())
}
