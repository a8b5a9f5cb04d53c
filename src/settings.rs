// src/settings.rs
//
// TOML settings. Every key is optional; a missing file means defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SettingsError;
use crate::identity::{parse_usb_id, IdentityRule, IdentitySet};
use crate::io::serial::framer::{FramingConfig, FramingPolicy};
use crate::io::serial::link::LinkConfig;
use crate::io::serial::reader::SessionTiming;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_schema_path")]
    pub schema_path: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub hotplug: HotplugSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub framing: FramingSettings,
    #[serde(default)]
    pub admission: AdmissionSettings,
    /// Empty means the built-in `Onion1`..`Onion4`
    #[serde(default)]
    pub devices: Vec<DeviceRule>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HotplugBackend {
    /// Kernel notifications on the device directory (Linux)
    Inotify,
    /// Re-enumerate the device directory on an interval
    Poll,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HotplugSettings {
    #[serde(default = "default_dev_dir")]
    pub dev_dir: PathBuf,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    #[serde(default = "default_backend")]
    pub backend: HotplugBackend,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SerialSettings {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64, // <= 1000, bounds stop latency
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FramingKind {
    Delimited,
    Sentinel,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FramingSettings {
    #[serde(rename = "type", default = "default_framing_kind")]
    pub kind: FramingKind,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_start_marker")]
    pub start_marker: String,
    #[serde(default = "default_end_marker")]
    pub end_marker: String,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_pad_on_close")]
    pub pad_on_close: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    Accept,
    Prompt,
    Command,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdmissionSettings {
    #[serde(default = "default_admission_mode")]
    pub mode: AdmissionMode,
    /// argv for `command` mode; `{device}` is replaced by the identity name
    #[serde(default = "default_admission_command")]
    pub command: Vec<String>,
}

/// One `[[devices]]` entry. With neither `node` nor ids, the name is the node.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct DeviceRule {
    pub name: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
}

fn default_schema_path() -> PathBuf {
    PathBuf::from("headers.txt")
}
fn default_database_path() -> PathBuf {
    PathBuf::from("device_data.db")
}
fn default_table() -> String {
    "device_data".to_string()
}
fn default_dev_dir() -> PathBuf {
    PathBuf::from("/dev")
}
fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}
fn default_backend() -> HotplugBackend {
    if cfg!(target_os = "linux") {
        HotplugBackend::Inotify
    } else {
        HotplugBackend::Poll
    }
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_idle_sleep_ms() -> u64 {
    100
}
fn default_settle_delay_ms() -> u64 {
    1000
}
fn default_read_buffer_bytes() -> usize {
    256
}
fn default_framing_kind() -> FramingKind {
    FramingKind::Delimited
}
fn default_delimiter() -> String {
    ";".to_string()
}
fn default_start_marker() -> String {
    "BOX".to_string()
}
fn default_end_marker() -> String {
    "X".to_string()
}
fn default_max_frame_bytes() -> usize {
    8192
}
fn default_pad_on_close() -> bool {
    true
}
fn default_admission_mode() -> AdmissionMode {
    AdmissionMode::Prompt
}
fn default_admission_command() -> Vec<String> {
    vec![
        "zenity".to_string(),
        "--question".to_string(),
        "--text=Device {device} plugged in. Include in data recording?".to_string(),
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            schema_path: default_schema_path(),
            database_path: default_database_path(),
            table: default_table(),
            log_dir: None,
            hotplug: HotplugSettings::default(),
            serial: SerialSettings::default(),
            framing: FramingSettings::default(),
            admission: AdmissionSettings::default(),
            devices: Vec::new(),
        }
    }
}

impl Default for HotplugSettings {
    fn default() -> Self {
        HotplugSettings {
            dev_dir: default_dev_dir(),
            sysfs_root: default_sysfs_root(),
            backend: default_backend(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            read_buffer_bytes: default_read_buffer_bytes(),
        }
    }
}

impl Default for FramingSettings {
    fn default() -> Self {
        FramingSettings {
            kind: default_framing_kind(),
            delimiter: default_delimiter(),
            start_marker: default_start_marker(),
            end_marker: default_end_marker(),
            max_frame_bytes: default_max_frame_bytes(),
            pad_on_close: default_pad_on_close(),
        }
    }
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        AdmissionSettings {
            mode: default_admission_mode(),
            command: default_admission_command(),
        }
    }
}

/// Command-line values that take precedence over the settings file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub schema_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub dev_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub accept_all: bool,
}

/// `<config dir>/onionlog/settings.toml`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("onionlog").join("settings.toml"))
}

impl Settings {
    /// Load settings. An explicit path must exist; the default location
    /// falls back to built-in defaults when absent.
    pub fn load(explicit: Option<&Path>) -> Result<Settings, SettingsError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_settings_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Settings::default()),
            },
        };

        let content = std::fs::read_to_string(&path).map_err(|source| SettingsError::Read {
            path: path.clone(),
            source,
        })?;
        Settings::from_toml(&content, &path)
    }

    pub fn from_toml(content: &str, path: &Path) -> Result<Settings, SettingsError> {
        toml::from_str(content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(path) = &overrides.schema_path {
            self.schema_path = path.clone();
        }
        if let Some(path) = &overrides.database_path {
            self.database_path = path.clone();
        }
        if let Some(dir) = &overrides.dev_dir {
            self.hotplug.dev_dir = dir.clone();
        }
        if let Some(dir) = &overrides.log_dir {
            self.log_dir = Some(dir.clone());
        }
        if overrides.accept_all {
            self.admission.mode = AdmissionMode::Accept;
        }
    }

    /// Check every value the ingestion path relies on.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.table.is_empty()
            || !self
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(SettingsError::invalid(
                "table",
                format!("'{}' is not a plain identifier", self.table),
            ));
        }

        let serial = &self.serial;
        if serial.baud_rate == 0 {
            return Err(SettingsError::invalid("serial.baud_rate", "must be positive"));
        }
        if !(1..=1000).contains(&serial.read_timeout_ms) {
            return Err(SettingsError::invalid(
                "serial.read_timeout_ms",
                format!("{} is outside 1..=1000", serial.read_timeout_ms),
            ));
        }
        if serial.read_buffer_bytes == 0 {
            return Err(SettingsError::invalid(
                "serial.read_buffer_bytes",
                "must be positive",
            ));
        }
        if self.hotplug.poll_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "hotplug.poll_interval_ms",
                "must be positive",
            ));
        }
        if self.admission.mode == AdmissionMode::Command && self.admission.command.is_empty() {
            return Err(SettingsError::invalid(
                "admission.command",
                "command mode needs a program to run",
            ));
        }

        self.framing_config()?;
        self.identities()?;
        Ok(())
    }

    pub fn framing_config(&self) -> Result<FramingConfig, SettingsError> {
        let framing = &self.framing;

        let delimiter = match framing.delimiter.as_bytes() {
            [b] if b.is_ascii() && *b != b'\r' && *b != b'\n' => *b,
            _ => {
                return Err(SettingsError::invalid(
                    "framing.delimiter",
                    format!(
                        "{:?} must be a single ASCII character other than CR/LF",
                        framing.delimiter
                    ),
                ))
            }
        };
        if framing.max_frame_bytes == 0 {
            return Err(SettingsError::invalid(
                "framing.max_frame_bytes",
                "must be positive",
            ));
        }

        let policy = match framing.kind {
            FramingKind::Delimited => FramingPolicy::Delimited,
            // Sentinel framing strips whitespace before splitting
            FramingKind::Sentinel if delimiter.is_ascii_whitespace() => {
                return Err(SettingsError::invalid(
                    "framing.delimiter",
                    format!(
                        "{:?} is whitespace, which sentinel framing discards",
                        framing.delimiter
                    ),
                ))
            }
            FramingKind::Sentinel => {
                let start = marker("framing.start_marker", &framing.start_marker)?;
                let end = marker("framing.end_marker", &framing.end_marker)?;
                FramingPolicy::Sentinel {
                    start_marker: start,
                    end_marker: end,
                }
            }
        };

        Ok(FramingConfig {
            policy,
            delimiter,
            max_frame_bytes: framing.max_frame_bytes,
            pad_on_close: framing.pad_on_close,
        })
    }

    pub fn identities(&self) -> Result<IdentitySet, SettingsError> {
        if self.devices.is_empty() {
            return Ok(IdentitySet::default());
        }

        let mut rules = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            let rule = match (&device.node, &device.vendor_id, &device.product_id) {
                (Some(node), None, None) => IdentityRule::Node(node.clone()),
                (None, Some(vendor), Some(product)) => IdentityRule::Usb {
                    vendor_id: usb_id(vendor)?,
                    product_id: usb_id(product)?,
                },
                (None, None, None) => IdentityRule::Node(device.name.clone()),
                _ => {
                    return Err(SettingsError::invalid(
                        "devices",
                        format!(
                            "'{}' needs either a node or both vendor_id and product_id",
                            device.name
                        ),
                    ))
                }
            };
            rules.push((device.name.clone(), rule));
        }
        IdentitySet::new(rules)
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            baud_rate: self.serial.baud_rate,
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
        }
    }

    pub fn session_timing(&self) -> SessionTiming {
        SessionTiming {
            settle_delay: Duration::from_millis(self.serial.settle_delay_ms),
            idle_sleep: Duration::from_millis(self.serial.idle_sleep_ms),
            read_buffer_bytes: self.serial.read_buffer_bytes,
        }
    }
}

fn marker(key: &'static str, text: &str) -> Result<Vec<u8>, SettingsError> {
    if text.is_empty() || text.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(SettingsError::invalid(
            key,
            "must be non-empty and free of whitespace",
        ));
    }
    Ok(text.as_bytes().to_vec())
}

fn usb_id(text: &str) -> Result<u16, SettingsError> {
    parse_usb_id(text).ok_or_else(|| {
        SettingsError::invalid("devices", format!("'{}' is not a hex USB id", text))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Settings {
        Settings::from_toml(text, Path::new("settings.toml")).unwrap()
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = parse("");
        assert_eq!(settings.table, "device_data");
        assert_eq!(settings.serial.read_timeout_ms, 1000);
        assert_eq!(settings.admission.mode, AdmissionMode::Prompt);
        settings.validate().unwrap();

        let ids = settings.identities().unwrap();
        assert_eq!(ids.len(), 4);
        assert!(ids.by_node("Onion4").is_some());
    }

    #[test]
    fn test_full_file_parses() {
        let settings = parse(
            r#"
schema_path = "cols.txt"
table = "readings"

[hotplug]
backend = "poll"
poll_interval_ms = 250

[serial]
read_timeout_ms = 200
settle_delay_ms = 0

[framing]
type = "sentinel"
delimiter = ","
start_marker = "BOX"
end_marker = "X"

[admission]
mode = "command"
command = ["zenity", "--question"]

[[devices]]
name = "Onion1"

[[devices]]
name = "Onion3"
vendor_id = "0403"
product_id = "0x6001"
"#,
        );
        settings.validate().unwrap();
        assert_eq!(settings.schema_path, PathBuf::from("cols.txt"));
        assert_eq!(settings.hotplug.backend, HotplugBackend::Poll);

        let framing = settings.framing_config().unwrap();
        assert_eq!(framing.delimiter, b',');
        assert_eq!(
            framing.policy,
            FramingPolicy::Sentinel {
                start_marker: b"BOX".to_vec(),
                end_marker: b"X".to_vec()
            }
        );

        let ids = settings.identities().unwrap();
        assert!(ids.by_node("Onion1").is_some());
        assert_eq!(ids.by_usb(0x0403, 0x6001).map(|i| i.name()), Some("Onion3"));

        assert_eq!(settings.link_config().read_timeout, Duration::from_millis(200));
        assert_eq!(settings.session_timing().settle_delay, Duration::ZERO);
    }

    #[test]
    fn test_unknown_enum_value_is_parse_error() {
        let err = Settings::from_toml("[hotplug]\nbackend = \"udev\"\n", Path::new("s.toml"))
            .unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
    }

    #[test]
    fn test_read_timeout_bounds() {
        let mut settings = Settings::default();
        settings.serial.read_timeout_ms = 1500;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid {
                key: "serial.read_timeout_ms",
                ..
            })
        ));
        settings.serial.read_timeout_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_bad_delimiters_rejected() {
        for bad in ["", ";;", "\n", "\r", "é"] {
            let mut settings = Settings::default();
            settings.framing.delimiter = bad.to_string();
            assert!(settings.framing_config().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_whitespace_delimiter_only_for_delimited_framing() {
        for delimiter in [" ", "\t"] {
            let mut settings = Settings::default();
            settings.framing.delimiter = delimiter.to_string();
            assert_eq!(settings.framing_config().unwrap().delimiter, delimiter.as_bytes()[0]);

            settings.framing.kind = FramingKind::Sentinel;
            assert!(
                matches!(
                    settings.framing_config(),
                    Err(SettingsError::Invalid { key: "framing.delimiter", .. })
                ),
                "sentinel accepted {:?}",
                delimiter
            );
            assert!(settings.validate().is_err());
        }
    }

    #[test]
    fn test_table_must_be_identifier() {
        let mut settings = Settings::default();
        settings.table = "data; DROP TABLE x".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_half_usb_rule_rejected() {
        let mut settings = Settings::default();
        settings.devices = vec![DeviceRule {
            name: "Onion3".into(),
            vendor_id: Some("0403".into()),
            ..DeviceRule::default()
        }];
        assert!(settings.identities().is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut settings = Settings::default();
        settings.apply_overrides(&Overrides {
            schema_path: Some(PathBuf::from("/tmp/h.txt")),
            dev_dir: Some(PathBuf::from("/tmp/dev")),
            accept_all: true,
            ..Overrides::default()
        });
        assert_eq!(settings.schema_path, PathBuf::from("/tmp/h.txt"));
        assert_eq!(settings.hotplug.dev_dir, PathBuf::from("/tmp/dev"));
        assert_eq!(settings.admission.mode, AdmissionMode::Accept);
        assert_eq!(settings.database_path, PathBuf::from("device_data.db"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, SettingsError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "database_path = \"/var/lib/onion.db\"\n").unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.database_path, PathBuf::from("/var/lib/onion.db"));
    }
}
