//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (`config/default.toml` unless another path is given)
//! 2. environment variables prefixed with `STAMINA_`, nested with `__`
//!
//! ```text
//! STAMINA_APPLICATION__LOG_LEVEL=debug
//! STAMINA_SWEEP__BEAM_PERIOD=100ms
//! STAMINA_SWEEP__TX_BEAMS=[30,31,32]
//! STAMINA_MAPPER__TX_MHU=MHU2
//! ```
//!
//! Every section has defaults matching the reference deployment, so a file
//! only needs to name what differs. Durations use humantime strings
//! (`"50ms"`, `"2s"`).

use crate::actors::{BeamSelectorConfig, KpiAggregatorConfig, RateMonitorConfig, SweepConfig};
use crate::core::{BeamIndex, BeamPair, RoleAssignment};
use crate::data::rss::RssCalculator;
use crate::data::storage::LogFiles;
use crate::error::{IaError, IaResult};
use crate::hardware::MockFrontEndConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging and log files.
    pub application: ApplicationSettings,
    /// Sweep controller.
    pub sweep: SweepSettings,
    /// KPI aggregator.
    pub kpi: KpiSettings,
    /// Rate monitor.
    pub rate: RateSettings,
    /// Beam selector.
    pub selector: SelectorSettings,
    /// Beam mapper.
    pub mapper: MapperSettings,
    /// RSS calculator.
    pub rss: RssSettings,
    /// Simulated front end.
    pub front_end: FrontEndSettings,
}

/// `[application]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// trace, debug, info, warn or error
    pub log_level: String,
    /// Directory receiving the CSV logs.
    pub log_dir: PathBuf,
    /// Tag appended to every log file name.
    pub file_suffix: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_dir: PathBuf::from("logs"),
            file_suffix: "test".into(),
        }
    }
}

/// `[sweep]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// TX candidate beams.
    pub tx_beams: Vec<i64>,
    /// RX candidate beams.
    pub rx_beams: Vec<i64>,
    /// Dwell per pair.
    #[serde(with = "humantime_serde")]
    pub beam_period: Duration,
    /// Cooldown after applying a winner.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Sweep without triggers or selections.
    pub standalone: bool,
    /// Optional wait limit for a selection.
    #[serde(with = "humantime_serde")]
    pub selection_timeout: Option<Duration>,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            tx_beams: (28..=36).collect(),
            rx_beams: (28..=36).collect(),
            beam_period: Duration::from_millis(50),
            interval: Duration::from_secs(2),
            standalone: false,
            selection_timeout: None,
        }
    }
}

/// `[kpi]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KpiSettings {
    /// Time between KPI readings.
    #[serde(with = "humantime_serde")]
    pub meas_period: Duration,
    /// Squelch floor, dB.
    pub sensitivity: f64,
    /// Measure without waiting for a trigger.
    pub standalone: bool,
}

impl Default for KpiSettings {
    fn default() -> Self {
        Self {
            meas_period: Duration::from_millis(10),
            sensitivity: -90.0,
            standalone: false,
        }
    }
}

/// `[rate]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateSettings {
    /// Length of one counting window.
    #[serde(with = "humantime_serde")]
    pub meas_period: Duration,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            meas_period: Duration::from_millis(1),
        }
    }
}

/// `[selector]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    /// Linear power floor; `0` disables it.
    pub threshold: f64,
}

/// `[mapper]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperSettings {
    /// Unit holding the TX role (`MHU1`, `MHU2`, `Disabled`, ...).
    pub tx_mhu: String,
    /// Unit holding the RX role.
    pub rx_mhu: String,
    /// Pause after each register write.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    /// Select-pulse width, added to the pause.
    #[serde(with = "humantime_serde")]
    pub pulse: Duration,
    /// GPIO layout document.
    pub gpio_config: PathBuf,
}

impl Default for MapperSettings {
    fn default() -> Self {
        Self {
            tx_mhu: "MHU1".into(),
            rx_mhu: "MHU2".into(),
            backoff: Duration::from_micros(2),
            pulse: Duration::from_micros(2),
            gpio_config: PathBuf::from("config/gpio_map.json"),
        }
    }
}

/// `[rss]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RssSettings {
    /// Averaging window in samples.
    pub length: usize,
    /// Samples between running-sum refreshes.
    pub max_iter: usize,
}

impl Default for RssSettings {
    fn default() -> Self {
        Self {
            length: 1000,
            max_iter: 4000,
        }
    }
}

/// Simulated front end used by `stamina ia`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontEndSettings {
    /// TX beam of the strongest pair.
    pub target_tx: i64,
    /// RX beam of the strongest pair.
    pub target_rx: i64,
    /// Time between sample batches.
    #[serde(with = "humantime_serde")]
    pub batch_period: Duration,
    /// Samples per batch.
    pub batch_size: usize,
    /// Power on the target pair, dB.
    pub peak_db: f64,
    /// Loss per beam step away from the target, dB.
    pub loss_per_step_db: f64,
    /// Peak amplitude of the I/Q noise.
    pub noise: f32,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for FrontEndSettings {
    fn default() -> Self {
        Self {
            target_tx: 31,
            target_rx: 33,
            batch_period: Duration::from_millis(1),
            batch_size: 256,
            peak_db: -40.0,
            loss_per_step_db: 3.0,
            noise: 1e-4,
            seed: None,
        }
    }
}

impl Settings {
    /// Loads [`DEFAULT_CONFIG_PATH`] plus environment overrides.
    pub fn load() -> IaResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads `path` plus environment overrides, then validates.
    ///
    /// A missing file is not an error; defaults and the environment still
    /// apply.
    pub fn load_from(path: impl AsRef<Path>) -> IaResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STAMINA_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every section.
    ///
    /// Candidate lists must be non-empty and in range, periods non-zero, the
    /// role aliases valid and distinct, and the selector threshold >= 0.
    pub fn validate(&self) -> IaResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(IaError::InvalidConfig(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.sweep_config()?.validate()?;
        if self.sweep.beam_period.is_zero() {
            return Err(IaError::InvalidConfig("sweep.beam_period must be non-zero".into()));
        }
        if self.kpi.meas_period.is_zero() || self.rate.meas_period.is_zero() {
            return Err(IaError::InvalidConfig(
                "measurement periods must be non-zero".into(),
            ));
        }
        self.selector_config().validate()?;
        self.roles()?;
        if self.rss.length == 0 || self.rss.max_iter == 0 {
            return Err(IaError::InvalidConfig(
                "rss.length and rss.max_iter must be positive".into(),
            ));
        }
        self.front_end_config()?;
        Ok(())
    }

    /// Log file locations under `log_dir`.
    pub fn log_files(&self) -> LogFiles {
        LogFiles::in_dir(&self.application.log_dir, &self.application.file_suffix)
    }

    /// Parsed role assignment.
    pub fn roles(&self) -> IaResult<RoleAssignment> {
        RoleAssignment::parse(&self.mapper.tx_mhu, &self.mapper.rx_mhu)
    }

    /// Sweep controller config.
    pub fn sweep_config(&self) -> IaResult<SweepConfig> {
        Ok(SweepConfig {
            tx_beams: candidates("tx_beams", &self.sweep.tx_beams)?,
            rx_beams: candidates("rx_beams", &self.sweep.rx_beams)?,
            beam_period: self.sweep.beam_period,
            interval: self.sweep.interval,
            standalone: self.sweep.standalone,
            selection_timeout: self.sweep.selection_timeout,
        })
    }

    /// KPI aggregator config.
    pub fn kpi_config(&self) -> KpiAggregatorConfig {
        let files = self.log_files();
        KpiAggregatorConfig {
            meas_period: self.kpi.meas_period,
            sensitivity: self.kpi.sensitivity,
            standalone: self.kpi.standalone,
            beam_log: files.beam,
            measurement_log: files.measurement,
        }
    }

    /// Rate monitor config.
    pub fn rate_config(&self) -> RateMonitorConfig {
        RateMonitorConfig {
            meas_period: self.rate.meas_period,
            rate_log: self.log_files().rate,
        }
    }

    /// Beam selector config.
    pub fn selector_config(&self) -> BeamSelectorConfig {
        let files = self.log_files();
        BeamSelectorConfig {
            threshold: self.selector.threshold,
            selection_log: files.selection,
            kpi_log: files.kpi,
        }
    }

    /// Fresh RSS calculator.
    pub fn rss_calculator(&self) -> RssCalculator {
        RssCalculator::new(self.rss.length, self.rss.max_iter)
    }

    /// Simulated front-end config.
    pub fn front_end_config(&self) -> IaResult<MockFrontEndConfig> {
        let fe = &self.front_end;
        Ok(MockFrontEndConfig {
            target: BeamPair::from_raw(fe.target_tx, fe.target_rx)?,
            batch_period: fe.batch_period,
            batch_size: fe.batch_size,
            peak_db: fe.peak_db,
            loss_per_step_db: fe.loss_per_step_db,
            noise: fe.noise,
            seed: fe.seed,
        })
    }
}

fn candidates(key: &str, raw: &[i64]) -> IaResult<Vec<BeamIndex>> {
    raw.iter()
        .map(|&b| {
            BeamIndex::new(b).map_err(|_| {
                IaError::InvalidConfig(format!(
                    "sweep.{} contains {}, outside [{}, {}]",
                    key,
                    b,
                    BeamIndex::MIN,
                    BeamIndex::MAX
                ))
            })
        })
        .collect()
}
