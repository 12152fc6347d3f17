//! `stamina` command-line entry point.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stamina_ia::app::{InitialAccess, ManualControl};
use stamina_ia::config::{Settings, DEFAULT_CONFIG_PATH};
use stamina_ia::core::{BeamPair, MhuId, SelectionOutcome};
use stamina_ia::hardware::{GpioLayout, MockFrontEnd};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stamina", version, about = "Millimeter-wave initial access")]
struct Cli {
    /// Settings file (TOML); STAMINA_* environment variables override it
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run initial access against the simulated front end
    Ia {
        /// Stop after this long (e.g. "30s"); runs until Ctrl-C otherwise
        #[arg(long, value_parser = parse_duration)]
        duration: Option<Duration>,
    },
    /// Steer both heads once and print the GPIO commands as JSON
    Manual {
        #[arg(long)]
        tx: i64,
        #[arg(long)]
        rx: i64,
    },
    /// Validate a GPIO layout document and print the derived masks
    Layout {
        /// Defaults to mapper.gpio_config from the settings
        path: Option<PathBuf>,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Ia { duration } => run_initial_access(&settings, duration).await,
        Command::Manual { tx, rx } => run_manual(&settings, tx, rx).await,
        Command::Layout { path } => {
            show_layout(&settings, path.unwrap_or_else(|| settings.mapper.gpio_config.clone()))
        }
    }
}

async fn run_initial_access(settings: &Settings, duration: Option<Duration>) -> Result<()> {
    let layout = GpioLayout::load(&settings.mapper.gpio_config)?;
    let mut ia = InitialAccess::from_settings(settings)?;
    let mut front_end = MockFrontEnd::new(
        settings.front_end_config()?,
        layout,
        settings.rss_calculator(),
    );
    ia.gpio_outlet().connect(front_end.gpio_input());
    front_end.start(ia.power_sink(), ia.sample_counter())?;
    ia.start()?;
    info!(
        "Simulated best pair is (tx {}, rx {})",
        settings.front_end.target_tx, settings.front_end.target_rx
    );

    let mut outcome = ia.selection_outcome();
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = &mut deadline => break,
            changed = outcome.changed() => {
                if changed.is_err() {
                    break;
                }
                match *outcome.borrow_and_update() {
                    Some(SelectionOutcome::Winner { pair, kpi_median }) => {
                        println!("selected {} (median KPI {:.2} dB)", pair, kpi_median);
                    }
                    Some(SelectionOutcome::Failed) => println!("sweep failed, boresight applied"),
                    None => {}
                }
            }
        }
    }

    let stopped = ia.stop().await;
    front_end.stop().await?;
    stopped?;
    let report = *ia.rate_report().borrow();
    println!(
        "last window: throughput {:.0} S/s, overhead {:.0} S/s",
        report.throughput, report.overhead
    );
    Ok(())
}

async fn run_manual(settings: &Settings, tx: i64, rx: i64) -> Result<()> {
    let initial = BeamPair::from_raw(tx, rx)?;
    let mut control = ManualControl::from_settings(settings, initial)?;
    let mut commands = control.gpio_outlet().subscribe();
    control.start()?;
    control.stop().await?;
    while let Ok(cmd) = commands.try_recv() {
        println!("{}", serde_json::to_string(&cmd)?);
    }
    Ok(())
}

fn show_layout(settings: &Settings, path: PathBuf) -> Result<()> {
    let layout = GpioLayout::load(&path)?;
    println!("layout {}", path.display());
    for (name, range) in [
        ("beam", layout.beam_range),
        ("id", layout.id_range),
        ("mode", layout.mode_range),
    ] {
        println!(
            "  {:<5} bits {:>2}..={:<2} mask {:#010x}",
            name,
            range.lower,
            range.upper,
            range.mask()
        );
    }
    for unit in MhuId::ALL {
        println!(
            "  {} id bit {}, mode bit {}",
            unit,
            layout.id_bit(unit),
            layout.mode_bit(unit)
        );
    }
    println!("  combined mask {:#010x}", layout.combined_mask());

    let roles = settings.roles()?;
    println!("setup for TX {} / RX {}:", settings.mapper.tx_mhu, settings.mapper.rx_mhu);
    for write in layout.setup_sequence(&roles) {
        println!("  {}", serde_json::to_string(&write)?);
    }
    Ok(())
}
