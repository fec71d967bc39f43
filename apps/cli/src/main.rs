use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use data_encoding::HEXLOWER_PERMISSIVE;
use luxnode_core::{
    AlwaysGranted, BtleLinkFactory, Coordinator, CoordinatorConfig, CredentialService, Device,
    DeviceCharacteristics, DeviceFamily, General, LocalCredentialService, OperatingMode,
    TracingObserver,
};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "Streetlight controller node tool", long_about = None)]
struct Cli {
    /// Coordinator configuration (TOML)
    #[arg(long, global = true, default_value = "luxnode.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print every characteristic group
    Read(Target),
    /// Change the operating mode
    SetMode {
        #[command(flatten)]
        target: Target,
        mode: ModeArg,
    },
    /// Change the absolute light level (percent)
    SetLevel {
        #[command(flatten)]
        target: Target,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        level: u8,
    },
    /// Dump the DALI memory banks (D4i only)
    Banks(Target),
    /// Write the default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// Radio address, AA:BB:CC:DD:EE:FF
    #[arg(long)]
    address: String,

    /// Controller family: bdc, zsc010 or d4i
    #[arg(long, default_value = "d4i")]
    family: DeviceFamily,

    /// Device key as hex (Bdc only)
    #[arg(long)]
    device_key: Option<String>,

    /// Device id; derived from the address when omitted
    #[arg(long)]
    device_id: Option<Uuid>,

    /// Seconds to scan before connecting
    #[arg(long, default_value_t = 5)]
    scan_secs: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Off,
    On,
    Dimming,
    Astro,
}

impl From<ModeArg> for OperatingMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Off => OperatingMode::Off,
            ModeArg::On => OperatingMode::On,
            ModeArg::Dimming => OperatingMode::Dimming,
            ModeArg::Astro => OperatingMode::Astro,
        }
    }
}

impl Target {
    fn device(&self) -> Result<Device> {
        let mut device = Device::new(Uuid::nil(), &self.address, self.family);
        let address = device
            .address_bytes()
            .with_context(|| format!("invalid address '{}'", self.address))?;
        device.id = self.device_id.unwrap_or_else(|| {
            let mut bytes = [0u8; 16];
            bytes[10..].copy_from_slice(&address);
            Uuid::from_bytes(bytes)
        });
        Ok(device)
    }

    fn credentials(&self, device: &Device) -> Result<Option<Arc<dyn CredentialService>>> {
        match (&self.device_key, self.family) {
            (Some(hex), _) => {
                let key: [u8; 16] = HEXLOWER_PERMISSIVE
                    .decode(hex.as_bytes())
                    .context("device key is not hex")?
                    .try_into()
                    .map_err(|k: Vec<u8>| anyhow::anyhow!("device key is {} bytes, need 16", k.len()))?;
                let service = LocalCredentialService::new().with_device(device.id, key);
                Ok(Some(Arc::new(service)))
            }
            (None, DeviceFamily::Bdc) => bail!("--device-key is required for Bdc nodes"),
            (None, _) => Ok(None),
        }
    }
}

fn load_config(path: &Path) -> Result<CoordinatorConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading configuration");
        CoordinatorConfig::load_from_file(path)
    } else {
        Ok(CoordinatorConfig::default())
    }
}

async fn connect(target: &Target, config: CoordinatorConfig) -> Result<Coordinator> {
    let device = target.device()?;
    let credentials = target.credentials(&device)?;

    let factory = BtleLinkFactory::first_adapter().await?;
    info!(secs = target.scan_secs, "Scanning");
    factory.scan(Duration::from_secs(target.scan_secs)).await?;

    let coordinator = Coordinator::new(
        Arc::new(factory),
        Arc::new(AlwaysGranted),
        Arc::new(TracingObserver),
        config,
    );
    if !coordinator.connect(device, credentials).await {
        let reason = coordinator
            .state()
            .last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".into());
        bail!("connect failed: {reason}");
    }
    Ok(coordinator)
}

fn print_characteristics(chars: &DeviceCharacteristics) {
    if let Some(general) = &chars.general {
        println!("mode:        {}", general.mode);
    }
    if let Some(dim) = &chars.dim {
        println!("preset:      {:?}", dim.preset);
        println!("level:       {:?}", dim.level);
        for step in &dim.steps {
            println!("  {:02}:{:02} -> {}%", step.hour, step.minute, step.level);
        }
        if let Some(schedule) = &dim.schedule {
            println!(
                "schedule:    v{} from {}-{:02}-{:02}, days 0x{:02X}",
                schedule.version,
                schedule.start.year,
                schedule.start.month,
                schedule.start.day,
                schedule.recurrence
            );
        }
    }
    if let Some(dali) = &chars.dali {
        println!("clo:         {}", dali.clo);
        println!("power:       {:?} of {:?}", dali.power_level, dali.available_power_levels);
        println!("fixture:     {}", dali.fixture_name.as_deref().unwrap_or("-"));
    }
    if let Some(time) = &chars.time {
        println!("utc:         {} (tz {} min)", time.utc, time.timezone_minutes);
    }
    if let Some(gps) = &chars.gps {
        println!("gps:         {:.6}, {:.6}", gps.latitude, gps.longitude);
    }
    if let Some(diag) = &chars.diagnostics {
        println!("status:      0x{:08X}", diag.status);
        println!("firmware:    {}", diag.firmware_version.as_deref().unwrap_or("-"));
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} exists, use --force to overwrite", path.display());
    }
    CoordinatorConfig::default().save_to_file(path)?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

/// Release the link, then report the outcome.
async fn finish(coordinator: Coordinator, ok: bool, what: &str) -> Result<()> {
    let detail = coordinator.state().last_error;
    coordinator.disconnect().await;
    if ok {
        return Ok(());
    }
    match detail {
        Some(e) => bail!("{what} failed: {e}"),
        None => bail!("{what} failed"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = || load_config(&cli.config);

    match &cli.command {
        Command::Read(target) => {
            let coordinator = connect(target, config()?).await?;
            let chars = coordinator.read_characteristics(None, None).await;
            print_characteristics(&chars);
            finish(coordinator, !chars.is_empty(), "read").await
        }
        Command::SetMode { target, mode } => {
            let coordinator = connect(target, config()?).await?;
            let update = DeviceCharacteristics {
                general: Some(General {
                    mode: (*mode).into(),
                }),
                ..Default::default()
            };
            let ok = coordinator.write_characteristics(&update).await;
            finish(coordinator, ok, "mode write").await
        }
        Command::SetLevel { target, level } => {
            let coordinator = connect(target, config()?).await?;
            // The dim group is written as a whole, so start from what the node holds.
            let ok = match coordinator.read_characteristics(None, None).await.dim {
                Some(mut dim) => {
                    dim.level = Some(*level);
                    let update = DeviceCharacteristics {
                        dim: Some(dim),
                        ..Default::default()
                    };
                    coordinator.write_characteristics(&update).await
                }
                None => false,
            };
            finish(coordinator, ok, "level write").await
        }
        Command::Banks(target) => {
            let coordinator = connect(target, config()?).await?;
            match coordinator.read_dali_banks().await {
                Some(banks) => {
                    for (bank, fields) in &banks {
                        let layout = luxnode_core::membank::layout(*bank);
                        println!("bank {bank} ({})", layout.map_or("?", |l| l.name));
                        for (offset, value) in fields {
                            let name = layout
                                .and_then(|l| l.field(*offset))
                                .map_or("?", |f| f.name);
                            println!("  0x{offset:02X} {name:<40} {value}");
                        }
                    }
                }
                None => warn!(family = %target.family, "No memory banks for this family"),
            }
            finish(coordinator, true, "bank read").await
        }
        Command::InitConfig { force } => init_config(&cli.config, *force),
    }
}

#[tokio::main]
async fn main() {
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

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
