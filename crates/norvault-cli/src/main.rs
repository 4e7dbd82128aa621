//! Norvault - flash image tool

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use norvault_cli::{load_layout, open_engine, save_engine, Status};
use norvault_core::{EngineBuilder, FlashLayout, LoadDevice, MemoryFlash};

/// Norvault - inspect and drive secure storage flash images
#[derive(Parser)]
#[command(name = "norvault")]
#[command(about = "Host tool for norvault flash images")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the flash image
    #[arg(long, default_value = "norvault.img")]
    image: PathBuf,

    /// Layout overrides (TOML)
    #[arg(long)]
    layout: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a freshly wiped image
    Init {
        /// Overwrite an existing image
        #[arg(long)]
        force: bool,
    },

    /// Show what the image holds
    Status,

    /// Provision a wallet in one step
    Load {
        /// BIP-39 mnemonic phrase
        #[arg(long)]
        mnemonic: String,

        /// PIN to set
        #[arg(long)]
        pin: Option<String>,

        /// Device label
        #[arg(long)]
        label: Option<String>,

        /// Language code (EN, FR or DE)
        #[arg(long)]
        language: Option<String>,

        /// Enable passphrase protection
        #[arg(long)]
        passphrase_protection: bool,

        /// Initial U2F counter
        #[arg(long)]
        u2f_counter: Option<u32>,
    },

    /// Change the device label (empty clears it)
    SetLabel { label: String },

    /// Set feature flags (bits are only ever added)
    ApplyFlags {
        /// Flag bits, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_flags)]
        flags: u32,
    },

    /// Advance the U2F counter
    U2fNext {
        /// Number of increments
        #[arg(long, default_value = "1")]
        count: u32,
    },

    /// Record a failed PIN attempt
    PinFail,

    /// Clear the PIN failure counter after a correct PIN
    PinReset,

    /// Erase all storage
    Wipe,
}

fn parse_flags(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid flags '{}': {}", value, e))
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "norvault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let layout = load_layout(cli.layout.as_deref())?;

    match cli.command {
        Commands::Init { force } => init(&cli.image, layout, force),
        command => run(&cli.image, layout, command),
    }
}

fn init(image: &Path, layout: FlashLayout, force: bool) -> anyhow::Result<()> {
    if image.exists() && !force {
        error!("Image {:?} already exists. Refusing to overwrite.", image);
        error!("Pass --force to replace it with a wiped image.");
        return Ok(());
    }

    let engine = EngineBuilder::new()
        .layout(layout)
        .open(MemoryFlash::new(layout))?;
    println!("Device UUID: {}", engine.uuid_hex());
    save_engine(image, engine)?;
    info!("Image written to {:?}", image);
    Ok(())
}

fn run(image: &Path, layout: FlashLayout, command: Commands) -> anyhow::Result<()> {
    let mut engine = open_engine(image, layout)?;

    match command {
        Commands::Init { .. } => {}

        Commands::Status => {
            println!("\n=== Device Status ===\n");
            println!("{}", Status::read(&engine)?);
            return Ok(());
        }

        Commands::Load {
            mnemonic,
            pin,
            label,
            language,
            passphrase_protection,
            u2f_counter,
        } => {
            if engine.is_initialized()? {
                warn!("Image already holds a wallet, it will be replaced");
            }
            engine.load_device(LoadDevice {
                mnemonic: Some(Zeroizing::new(mnemonic)),
                pin: pin.map(Zeroizing::new),
                label,
                language,
                passphrase_protection,
                u2f_counter,
                ..Default::default()
            })?;
            println!("Wallet loaded");
        }

        Commands::SetLabel { label } => {
            engine.set_label(&label);
            engine.commit()?;
            println!("Label updated");
        }

        Commands::ApplyFlags { flags } => {
            if engine.apply_flags(flags)? {
                engine.commit()?;
            }
            println!("Flags: {:#010x}", engine.get_flags()?);
        }

        Commands::U2fNext { count } => {
            let mut value = engine.u2f_counter()?;
            for _ in 0..count {
                value = engine.next_u2f_counter()?;
            }
            println!("U2F counter: {}", value);
        }

        Commands::PinFail => {
            let addr = engine.pin_fail_address()?;
            if !engine.record_pin_failure(addr)? {
                warn!("Failure word did not read back as written");
            }
            println!(
                "PIN failures: {} (wait {}s)",
                engine.pin_fail_count()?,
                engine.pin_wait_time(addr)?
            );
        }

        Commands::PinReset => {
            let addr = engine.pin_fail_address()?;
            engine.reset_pin_failures(addr)?;
            println!("PIN failures cleared");
        }

        Commands::Wipe => {
            engine.wipe()?;
            println!("Storage wiped, new UUID: {}", engine.uuid_hex());
        }
    }

    save_engine(image, engine)
}
