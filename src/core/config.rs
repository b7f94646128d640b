//! # Configuration
//!
//! Centralizes all settings with a clear override hierarchy:
//! defaults → config file → CLI flags.
//!
//! Config lives at `~/.config/tickbar/config.toml`. If missing on first run, a
//! commented-out default is generated so users can discover all options.
//!
//! Bad values never stop the bar: they are logged and replaced by defaults.

use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Config Structs (all fields Option<T> for sparse TOML)
// ============================================================================

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TickbarConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub flat: FlatConfig,
    #[serde(default)]
    pub i3bar: I3barConfig,
    #[serde(default)]
    pub pulseaudio: PulseAudioConfig,
    #[serde(default)]
    pub upower: UpowerConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct GeneralConfig {
    pub interval: Option<u64>,
    pub output: Option<String>,
    pub input: Option<Vec<String>>,
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FlatConfig {
    pub separator: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct I3barConfig {
    pub click_events: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PulseAudioConfig {
    pub format: Option<String>,
    pub increment: Option<i64>,
    pub volume: Option<i64>,
    pub unlimited_volume: Option<bool>,
    pub actions: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UpowerConfig {
    pub all_devices: Option<bool>,
    pub sysfs_root: Option<String>,
    pub poll_interval: Option<u64>,
}

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_OUTPUT: &str = "flat";
pub const DEFAULT_FLAT_SEPARATOR: &str = " | ";
pub const DEFAULT_VOLUME_INCREMENT: u32 = 5;
pub const DEFAULT_VOLUME: u32 = 100;
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/power_supply";
pub const DEFAULT_UPOWER_POLL_SECS: u64 = 5;

// ============================================================================
// Resolved Config (concrete values, no Options)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub interval: Duration,
    pub output: String,
    pub inputs: Vec<String>,
    pub log_level: LevelFilter,
    pub flat_separator: String,
    pub i3bar_click_events: bool,
    pub pulseaudio: PulseAudioSettings,
    pub upower: UpowerSettings,
}

#[derive(Debug, Clone)]
pub struct PulseAudioSettings {
    pub format: Option<String>,
    /// Percent per raise/lower step, in (0, 100).
    pub increment: u32,
    /// Percent applied by the `set` action, in (0, 100].
    pub volume: u32,
    pub unlimited_volume: bool,
    /// Event id → action name.
    pub actions: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct UpowerSettings {
    pub all_devices: bool,
    pub sysfs_root: PathBuf,
    pub poll_interval: Duration,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        resolve(&TickbarConfig::default(), &CliOverrides::default())
    }
}

/// Values given on the command line; `None`/empty = not specified.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub interval: Option<u64>,
    pub output: Option<String>,
    pub inputs: Vec<String>,
    pub log_level: Option<String>,
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    /// Recovered locally: logged, then the default is used.
    OutOfRange { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
            ConfigError::OutOfRange { key, value } => {
                write!(f, "config value {key} = {value} is out of range, using default")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Loading
// ============================================================================

/// Returns the path to `~/.config/tickbar/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tickbar").join("config.toml"))
}

/// Load config from `path`, or from [`config_path`] when `None`.
///
/// A missing default file is generated and `TickbarConfig::default()` is
/// returned. An explicit path that does not exist is an error.
pub fn load_config(path: Option<&Path>) -> Result<TickbarConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match config_path() {
            Some(p) => {
                if !p.exists() {
                    info!("No config file found, generating default at {}", p.display());
                    generate_default_config(&p);
                    return Ok(TickbarConfig::default());
                }
                p
            }
            None => {
                warn!("Could not determine config directory, using default config");
                return Ok(TickbarConfig::default());
            }
        },
    };

    let contents = fs::read_to_string(&path).map_err(ConfigError::Io)?;
    let config: TickbarConfig = toml::from_str(&contents).map_err(ConfigError::Parse)?;
    info!("Loaded config from {}", path.display());
    debug!("Config: {:?}", config);
    Ok(config)
}

/// Generates a commented-out default config file at the given path.
fn generate_default_config(path: &Path) {
    let default_content = r#"# tickbar configuration
# All settings are optional. Defaults are used for anything left out.
# Override hierarchy: defaults → this file → CLI flags.

# [general]
# interval = 1                      # seconds between status lines
# output = "flat"                   # "flat" or "i3bar"
# input = ["pulseaudio", "upower"]
# log_level = "info"

# [flat]
# separator = " | "

# [i3bar]
# click_events = true

# [pulseaudio]
# format = "${volume[@% ]}%"        # tokens: port, mute, volume
# increment = 5                     # percent, 1-99
# volume = 100                      # percent used by "set", 1-100
# unlimited_volume = false          # allow raising past 100%
# actions = { "mouse:1" = "mute toggle", "mouse:4" = "raise", "mouse:5" = "lower" }

# [upower]
# all_devices = false               # also show mice, keyboards, UPSes...
"#;

    if let Some(parent) = path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        warn!("Failed to create config directory: {}", e);
        return;
    }
    if let Err(e) = fs::write(path, default_content) {
        warn!("Failed to write default config: {}", e);
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Keeps `value` when `valid`, otherwise logs and falls back to `default`.
fn in_range<T: fmt::Display>(key: &'static str, value: Option<T>, valid: impl Fn(&T) -> bool, default: T) -> T {
    match value {
        Some(v) if valid(&v) => v,
        Some(v) => {
            warn!("{}", ConfigError::OutOfRange { key, value: v.to_string() });
            default
        }
        None => default,
    }
}

/// Resolve the final config by collapsing: defaults → config file → CLI.
pub fn resolve(config: &TickbarConfig, cli: &CliOverrides) -> ResolvedConfig {
    let interval = in_range(
        "general.interval",
        cli.interval.or(config.general.interval),
        |&secs| secs > 0,
        DEFAULT_INTERVAL_SECS,
    );

    let output = cli
        .output
        .clone()
        .or_else(|| config.general.output.clone())
        .unwrap_or_else(|| DEFAULT_OUTPUT.to_string());

    // Inputs: CLI list replaces the configured one entirely
    let inputs = if cli.inputs.is_empty() {
        config.general.input.clone().unwrap_or_default()
    } else {
        cli.inputs.clone()
    };

    let log_level = cli
        .log_level
        .as_deref()
        .or(config.general.log_level.as_deref())
        .and_then(|level| match level.parse::<LevelFilter>() {
            Ok(level) => Some(level),
            Err(_) => {
                warn!("Unknown log level '{}', using info", level);
                None
            }
        })
        .unwrap_or(LevelFilter::Info);

    let pa = &config.pulseaudio;
    let increment = in_range("pulseaudio.increment", pa.increment, |&v| v > 0 && v < 100, DEFAULT_VOLUME_INCREMENT as i64);
    let volume = in_range("pulseaudio.volume", pa.volume, |&v| v > 0 && v <= 100, DEFAULT_VOLUME as i64);

    let poll_secs = in_range(
        "upower.poll_interval",
        config.upower.poll_interval,
        |&secs| secs > 0,
        DEFAULT_UPOWER_POLL_SECS,
    );

    ResolvedConfig {
        interval: Duration::from_secs(interval),
        output,
        inputs,
        log_level,
        flat_separator: config
            .flat
            .separator
            .clone()
            .unwrap_or_else(|| DEFAULT_FLAT_SEPARATOR.to_string()),
        i3bar_click_events: config.i3bar.click_events.unwrap_or(true),
        pulseaudio: PulseAudioSettings {
            format: pa.format.clone(),
            increment: increment as u32,
            volume: volume as u32,
            unlimited_volume: pa.unlimited_volume.unwrap_or(false),
            actions: pa.actions.clone().unwrap_or_default(),
        },
        upower: UpowerSettings {
            all_devices: config.upower.all_devices.unwrap_or(false),
            sysfs_root: config
                .upower
                .sysfs_root
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSFS_ROOT)),
            poll_interval: Duration::from_secs(poll_secs),
        },
    }
}
