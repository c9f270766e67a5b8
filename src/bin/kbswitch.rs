// Kbswitch CLI
// Daemon entry point and store-only maintenance subcommands

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use kbswitch_core::engine::{EngineError, SwitchEngine};
use kbswitch_core::identity::KeyboardIdentity;
use kbswitch_core::monitor::DeviceMonitor;
use kbswitch_core::notify::FileBus;
use kbswitch_core::source::{InputSourceHost, OfflineHost, SourceEventStream};
use kbswitch_core::statefile::FileStore;
use kbswitch_core::sway::{SwayEvents, SwayHost};

/// Automatic per-keyboard input-source switching
#[derive(Parser, Debug)]
#[command(name = "kbswitch")]
#[command(version)]
#[command(about = "Remembers an input source per keyboard and restores it when you switch keyboards", long_about = None)]
struct Args {
    /// Verbosity level (0 = warnings, 1 = debug, 2 or more = trace)
    #[arg(short, long, default_value_t = 0)]
    verbose: u8,

    /// Include the physical port location in keyboard identities
    #[arg(short, long)]
    location: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor keyboards and switch input sources (the default)
    Start,

    /// Enable switching for a device, by identity or list number
    Enable {
        /// Keyboard identity string, or its number from `list`
        device: String,
    },

    /// Disable switching for a device, by identity or list number
    Disable {
        /// Keyboard identity string, or its number from `list`
        device: String,
    },

    /// List known devices with their stored layouts
    List,

    /// Clear all mappings and device flags
    Clear,
}

fn init_logging(verbosity: u8) {
    // RUST_LOG still wins over the flag.
    let default_level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

/// Wire up an engine over the file-backed store and bus.
///
/// The compositor being unreachable is not fatal here: the store-only
/// subcommands keep working against the state file alone.
fn build_engine() -> anyhow::Result<SwitchEngine> {
    let host: Box<dyn InputSourceHost> = match SwayHost::connect() {
        Ok(host) => Box::new(host),
        Err(e) => {
            log::debug!("compositor unreachable, operating store-only: {e}");
            Box::new(OfflineHost)
        }
    };

    let store = FileStore::open_default().context("cannot open the state file")?;
    let bus = FileBus::open_default().context("cannot open the settings channel")?;
    Ok(SwitchEngine::new(host, Box::new(store), Box::new(bus))?)
}

fn run_daemon(use_location: bool) -> anyhow::Result<()> {
    let engine = build_engine()?;
    let mut monitor =
        DeviceMonitor::open(use_location).context("cannot open any keyboard device")?;

    let mut events = match SwayEvents::connect() {
        Ok(stream) => Some(stream),
        Err(e) => {
            log::warn!("no compositor event stream, layout changes will not be tracked: {e}");
            None
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        std::thread::spawn(move || {
            use signal_hook::iterator::Signals;
            if let Ok(mut signals) =
                Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
            {
                if signals.forever().next().is_some() {
                    println!("\nReceived signal, shutting down gracefully...");
                    running.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    log::debug!("kbswitch started with {} device(s)", monitor.device_count());
    monitor.run(
        &engine,
        events.as_mut().map(|s| s as &mut dyn SourceEventStream),
        &running,
    )?;
    Ok(())
}

fn set_device(device: String, enable: bool) -> anyhow::Result<()> {
    let engine = build_engine()?;
    let action = if enable { "Enabled" } else { "Disabled" };

    // A number addresses a list ordinal, anything else is an identity.
    if let Ok(number) = device.parse::<usize>() {
        let result = if enable {
            engine.enable_by_ordinal(number)
        } else {
            engine.disable_by_ordinal(number)
        };
        match result {
            Ok(identity) => println!("{action} {identity}"),
            Err(EngineError::InvalidOrdinal(n)) => eprintln!("Invalid device number: {n}"),
            Err(e) => return Err(e.into()),
        }
    } else {
        let identity = KeyboardIdentity::from_raw(device);
        if enable {
            engine.enable_device(identity.clone());
        } else {
            engine.disable_device(identity.clone());
        }
        println!("{action} {identity}");
    }
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let engine = build_engine()?;
    let listing = engine.describe_devices();
    if listing.is_empty() {
        println!("No devices known yet");
    } else {
        println!("{listing}");
    }
    Ok(())
}

fn clear_settings() -> anyhow::Result<()> {
    let engine = build_engine()?;
    engine.clear_all()?;
    println!("All settings cleared");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command.unwrap_or(Command::Start) {
        Command::Start => run_daemon(args.location),
        Command::Enable { device } => set_device(device, true),
        Command::Disable { device } => set_device(device, false),
        Command::List => list_devices(),
        Command::Clear => clear_settings(),
    }
}
