use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use ecuflash_core::{
    CanBus, ChannelObserver, DeviceProfile, FlashEvent, FlashFailure, FlashSession, LogLevel,
    SessionConfig, SimulatedBus,
};
use tracing::{debug, error, info, trace, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Diagnostic flashing tool for CAN-attached controllers", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up, write the staging image, reset and verify
    Flash(RunArgs),
    /// Read and store the region without writing
    Backup(RunArgs),
    /// Write the default device profile as TOML
    Profile {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write the simulator's credential blob
    SimCredential {
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Session configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Override the image path from the configuration
    #[arg(long)]
    image: Option<PathBuf>,

    /// Run against the built-in simulated device
    #[arg(long, conflicts_with = "interface")]
    simulate: bool,

    /// SocketCAN interface, e.g. can0
    #[arg(short, long)]
    interface: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Flash(args) => execute(args, true),
        Command::Backup(args) => execute(args, false),
        Command::Profile { output } => {
            let profile = DeviceProfile::default();
            match output {
                Some(path) => {
                    profile.save_to_file(&path)?;
                    info!(path = %path.display(), "Profile written");
                }
                None => println!("{}", toml::to_string_pretty(&profile)?),
            }
            Ok(())
        }
        Command::SimCredential { output } => {
            let bus = SimulatedBus::new(&DeviceProfile::default());
            std::fs::write(&output, bus.credential())
                .with_context(|| format!("writing {}", output.display()))?;
            info!(path = %output.display(), "Simulator credential written");
            Ok(())
        }
    }
}

fn execute(args: RunArgs, writes: bool) -> Result<()> {
    let mut config = SessionConfig::load_from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(image) = args.image {
        config.image_path = image;
    }
    config.profile.validate()?;

    if args.simulate {
        let bus = SimulatedBus::new(&config.profile);
        return drive(config, bus, writes);
    }
    match args.interface {
        Some(interface) => open_interface(config, &interface, writes),
        None => bail!("either --simulate or --interface is required"),
    }
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
fn open_interface(config: SessionConfig, interface: &str, writes: bool) -> Result<()> {
    let bus = ecuflash_core::transport::SocketCanBus::open(interface)
        .with_context(|| format!("opening {}", interface))?;
    drive(config, bus, writes)
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
fn open_interface(_config: SessionConfig, interface: &str, _writes: bool) -> Result<()> {
    bail!(
        "cannot open {}: built without SocketCAN support (enable the `socketcan` feature)",
        interface
    )
}

/// Run the session on a worker thread and print its events here.
fn drive<B: CanBus + 'static>(config: SessionConfig, bus: B, writes: bool) -> Result<()> {
    info!(bus = %bus.name(), profile = %config.profile.name, "Starting");
    let (tx, rx) = mpsc::channel();
    let session = FlashSession::with_observer(config, bus, Arc::new(ChannelObserver::new(tx)));

    let worker = thread::spawn(move || {
        if writes {
            session.run().map(|report| (report, None))
        } else {
            session
                .backup()
                .map(|(report, outcome)| (report, Some(outcome)))
        }
    });

    let mut progress = ProgressPrinter::default();
    for event in rx {
        progress.handle(&event);
    }

    let result = match worker.join() {
        Ok(result) => result,
        Err(_) => bail!("flash worker panicked"),
    };
    match result {
        Ok((report, _)) => {
            info!(
                bytes = report.bytes_written,
                elapsed = ?report.duration,
                warnings = report.warnings,
                "Run succeeded"
            );
            for path in &report.backups {
                info!(path = %path.display(), "Backup");
            }
            info!(path = %report.audit_path.display(), "Audit log");
            Ok(())
        }
        Err(failure) => {
            report_failure(&failure);
            Err(failure.into())
        }
    }
}

fn report_failure(failure: &FlashFailure) {
    error!(state = %failure.state, "{}", failure.error);
    match &failure.backup_path {
        Some(path) => warn!(path = %path.display(), "Device can be restored from this backup"),
        None => info!("Device memory was not written"),
    }
    if let Some(block) = failure.last_block {
        warn!(block, "Last block acknowledged by the device");
    }
    if let Some(path) = &failure.audit_path {
        info!(path = %path.display(), "Audit log");
    }
}

/// Prints progress in 10% steps per operation.
#[derive(Default)]
struct ProgressPrinter {
    last: HashMap<String, u64>,
}

impl ProgressPrinter {
    fn handle(&mut self, event: &FlashEvent) {
        match event {
            FlashEvent::StateChanged { from, to } => info!("{} -> {}", from, to),
            FlashEvent::Progress {
                operation,
                current,
                total,
            } => {
                if *total == 0 {
                    return;
                }
                let step = current * 10 / total;
                let last = self.last.entry(operation.clone()).or_insert(u64::MAX);
                if *last != step {
                    *last = step;
                    info!("{}: {}%", operation, step * 10);
                }
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => trace!("{}", message),
                LogLevel::Debug => debug!("{}", message),
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            },
            FlashEvent::Frame {
                direction,
                id,
                data,
            } => trace!("{} 0x{:03X} {:02X?}", direction, id, data),
            FlashEvent::Finished { success } => debug!(success, "Finished"),
        }
    }
}
