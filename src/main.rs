#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};

use rsoemcrypto::config::EngineConfig;
use rsoemcrypto::keybox::{Keybox, DEVICE_KEY_SIZE, KEY_DATA_SIZE};
use rsoemcrypto::Engine;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "rsoemcrypto", version, disable_version_flag = true, about = "rsoemcrypto CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create a keybox file from hex-encoded fields.
    ///
    /// The magic and CRC are filled in.
    KeyboxCreate {
        #[arg(short = 'i', long = "device_id")]
        device_id: String,
        /// 16-byte device key, hex.
        #[arg(short = 'k', long = "key")]
        device_key: String,
        /// 72-byte key data, hex.
        #[arg(short = 't', long = "token")]
        key_data: String,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
    /// Check the magic and CRC of a keybox file.
    KeyboxValidate { path: PathBuf },
    /// Print the capabilities an engine reports for a configuration.
    Capabilities {
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("rsoemcrypto version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::KeyboxCreate {
            device_id,
            device_key,
            key_data,
            output,
        }) => run_keybox_create(&device_id, &device_key, &key_data, &output),
        Some(Commands::KeyboxValidate { path }) => run_keybox_validate(&path),
        Some(Commands::Capabilities { config }) => run_capabilities(config.as_deref()),
        None => Ok(()),
    }
}

fn decode_fixed<const N: usize>(name: &str, value: &str) -> anyhow::Result<[u8; N]> {
    let bytes = hex::decode(value).with_context(|| format!("{} is not hex", name))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("{} must be {} bytes, got {}", name, N, b.len()))
}

fn run_keybox_create(
    device_id: &str,
    device_key: &str,
    key_data: &str,
    output: &Path,
) -> anyhow::Result<()> {
    let device_id = hex::decode(device_id).context("device id is not hex")?;
    let device_key = decode_fixed::<DEVICE_KEY_SIZE>("device key", device_key)?;
    let key_data = decode_fixed::<KEY_DATA_SIZE>("key data", key_data)?;

    if output.exists() {
        anyhow::bail!("A file already exists at the path '{}'", output.display());
    }
    let keybox = Keybox::new(&device_id, &device_key, &key_data)?;
    keybox.save(output)?;

    info!("Created keybox {}", output.display());
    info!(" + Device ID: {}", String::from_utf8_lossy(trim_id(keybox.device_id())));
    Ok(())
}

fn run_keybox_validate(path: &Path) -> anyhow::Result<()> {
    let keybox = Keybox::from_path(path).context("Failed to read keybox")?;
    match keybox.validate() {
        Ok(()) => {
            info!("Keybox is valid");
            info!(" + Device ID: {}", String::from_utf8_lossy(trim_id(keybox.device_id())));
            Ok(())
        }
        Err(e) => {
            error!("Keybox is invalid: {}", e);
            Err(e.into())
        }
    }
}

fn trim_id(id: &[u8]) -> &[u8] {
    let end = id.iter().position(|&b| b == 0).unwrap_or(id.len());
    &id[..end]
}

fn run_capabilities(config: Option<&Path>) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => EngineConfig::from_path(path).context("Failed to load config")?,
        None => EngineConfig::default(),
    };
    let engine = Engine::new(config);
    let (current, max) = engine.hdcp_capability();

    info!("API version: {}", engine.api_version());
    info!("Security level: {}", engine.security_level().as_str());
    info!("Provisioning method: {:?}", engine.provisioning_method());
    info!("HDCP: current {:?}, max {:?}", current, max);
    info!("Local display only: {}", engine.is_local_display_only());
    info!("Closed platform: {}", engine.is_closed_platform());
    info!("Anti-rollback hardware: {}", engine.is_anti_rollback_hw_present());
    info!("Security patch level: {}", engine.security_patch_level());
    info!("Max sessions: {}", engine.max_number_of_sessions());
    info!("Resource rating tier: {}", engine.resource_rating_tier());
    info!("Usage table: {}", engine.supports_usage_table());
    info!("SRM update supported: {}", engine.is_srm_update_supported());
    match engine.get_current_srm_version() {
        Ok(version) => info!("SRM version: {}", version),
        Err(_) => info!("SRM version: none"),
    }
    Ok(())
}
