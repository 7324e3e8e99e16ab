//! Robot configuration – reads/writes `~/.hbabot/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use hba_hal::{Drive, PeripheralSettings};
use hba_runtime::TablebotConfig;
use hba_types::{Channel, DEFAULT_HOST, DEFAULT_PORT};
use serde::{Deserialize, Serialize};

/// Persisted configuration.  Every field has a default, so a partial file
/// (or none at all) is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host running the hba daemon.
    pub host: String,
    pub port: u16,
    /// Wheel power while driving, written as hex to `motor0`/`motor1`.
    pub drive_speed: u8,
    /// Encoder counts to reverse after the edge.
    pub back_distance: i32,
    /// Encoder counts for a half turn.
    pub turn_distance: i32,
    pub qtr_period: u8,
    pub qtr_thresh: u8,
    pub encoder_channel: String,
    pub line_channel: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            drive_speed: 0x10,
            back_distance: 50,
            turn_distance: 720,
            qtr_period: 0,
            qtr_thresh: 0x1f,
            encoder_channel: "hba_quad.enc1".to_string(),
            line_channel: "hba_qtr.qtr".to_string(),
        }
    }
}

impl Config {
    pub fn encoder(&self) -> Result<Channel, String> {
        parse_channel("encoder_channel", &self.encoder_channel)
    }

    pub fn line(&self) -> Result<Channel, String> {
        parse_channel("line_channel", &self.line_channel)
    }

    pub fn drive(&self) -> Drive {
        Drive::new(self.drive_speed)
    }

    pub fn peripheral_settings(&self) -> PeripheralSettings {
        PeripheralSettings {
            qtr_period: self.qtr_period,
            qtr_thresh: self.qtr_thresh,
        }
    }

    /// Encoder counts for a half turn, checked against the encoder range.
    pub fn turn(&self) -> Result<i32, String> {
        check_distance("turn_distance", self.turn_distance)
    }

    pub fn tablebot(&self) -> Result<TablebotConfig, String> {
        Ok(TablebotConfig {
            drive: self.drive(),
            back_distance: check_distance("back_distance", self.back_distance)?,
            turn_distance: self.turn()?,
            line: self.line()?,
            encoder: self.encoder()?,
        })
    }
}

fn parse_channel(field: &str, value: &str) -> Result<Channel, String> {
    value.parse().map_err(|e| format!("Invalid {field}: {e}"))
}

/// The encoders count in 16 bits, so a distance beyond that span can never
/// be reached.
fn check_distance(field: &str, value: i32) -> Result<i32, String> {
    if value.unsigned_abs() > i16::MAX as u32 {
        return Err(format!(
            "Invalid {field}: {value} is outside ±{} encoder counts",
            i16::MAX
        ));
    }
    Ok(value)
}

/// Return the path to `~/.hbabot/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".hbabot").join("config.toml")
}

/// Load `path` (defaults when missing) and apply `HBABOT_*` overrides.
pub fn resolve(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply environment overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HBABOT_HOST` | `host` |
/// | `HBABOT_PORT` | `port` |
/// | `HBABOT_BACK_DISTANCE` | `back_distance` |
/// | `HBABOT_TURN_DISTANCE` | `turn_distance` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides_from(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("HBABOT_HOST") {
        cfg.host = v;
    }
    if let Some(v) = var("HBABOT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
    if let Some(v) = var("HBABOT_BACK_DISTANCE")
        && let Ok(d) = v.parse::<i32>()
    {
        cfg.back_distance = d;
    }
    if let Some(v) = var("HBABOT_TURN_DISTANCE")
        && let Ok(d) = v.parse::<i32>()
    {
        cfg.turn_distance = d;
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
