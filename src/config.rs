//! Configuration management for the Redfire FXS line controller

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocols::dtmf::Digit;
use crate::services::dialplan::Dialplan;
use crate::{Error, Result};

/// Longest dialing timeout accepted from configuration, in milliseconds.
pub const MAX_DIALING_TIMEOUT_MS: u64 = 60_000;

/// Longest extension the dialing buffer can hold.
pub const MAX_EXTENSION_LENGTH: usize = 79;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxsConfig {
    pub general: GeneralConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub lines: Vec<LineConfig>,
    #[serde(default)]
    pub dialplan: DialplanConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub description: String,
    /// Poll timeout used when no line needs attention (ms)
    pub idle_timeout_ms: u64,
    /// Poll timeout used after a line could not be locked (ms)
    pub short_timeout_ms: u64,
    pub max_extension_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub max_size: u64,
    pub max_files: u32,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

/// Per-line settings. Empty strings are replaced by per-line defaults on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_device")]
    pub capture_device: String,
    #[serde(default = "default_device")]
    pub playback_device: String,
    /// evdev node delivering hook and keypad events. Empty means console injection only.
    #[serde(default)]
    pub event_input_device: String,
    /// evdev node accepting the bell event used for ringing. May equal the input node.
    #[serde(default)]
    pub event_output_device: String,
    /// When false, lifting the handset opens a call immediately without collecting digits.
    #[serde(default = "default_true")]
    pub monitor_dialing: bool,
    #[serde(default)]
    pub search_extension_trigger: Option<char>,
    #[serde(default = "default_first_digit_timeout")]
    pub dialing_timeout_1st_digit: u64,
    #[serde(default = "default_dialing_timeout")]
    pub dialing_timeout: u64,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub caller_id_name: String,
    #[serde(default)]
    pub caller_id_number: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub moh_interpret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialplanConfig {
    /// Context name to extension patterns (`100`, `_5XXX`, `_0.`)
    #[serde(default)]
    pub contexts: BTreeMap<String, Vec<String>>,
}

fn default_true() -> bool {
    true
}

fn default_device() -> String {
    "default".to_string()
}

fn default_first_digit_timeout() -> u64 {
    5000
}

fn default_dialing_timeout() -> u64 {
    3000
}

impl LineConfig {
    pub fn new(index: usize) -> Self {
        let mut line = Self {
            enable: true,
            capture_device: default_device(),
            playback_device: default_device(),
            event_input_device: String::new(),
            event_output_device: String::new(),
            monitor_dialing: true,
            search_extension_trigger: None,
            dialing_timeout_1st_digit: default_first_digit_timeout(),
            dialing_timeout: default_dialing_timeout(),
            context: String::new(),
            caller_id_name: String::new(),
            caller_id_number: String::new(),
            language: None,
            moh_interpret: None,
        };
        line.apply_defaults(index);
        line
    }

    /// Fill the per-line defaults that depend on the line position.
    pub fn apply_defaults(&mut self, index: usize) {
        let number = index + 1;
        if self.context.is_empty() {
            self.context = format!("ai-line-{}", number);
        }
        if self.caller_id_name.is_empty() {
            self.caller_id_name = format!("line{}", number);
        }
        if self.caller_id_number.is_empty() {
            self.caller_id_number = format!("00-00-00-{:02}", number);
        }
        if self.capture_device.is_empty() {
            self.capture_device = default_device();
        }
        if self.playback_device.is_empty() {
            self.playback_device = default_device();
        }
    }

    pub fn trigger_digit(&self) -> Option<Digit> {
        self.search_extension_trigger.and_then(Digit::from_char)
    }
}

impl FxsConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: FxsConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        config.apply_line_defaults();
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let mut settings = config::Config::builder();

        // Start from defaults so single values can be overridden
        settings = settings.add_source(config::Config::try_from(&Self::default_config())?);

        // Load from environment variables with REDFIRE_FXS_ prefix
        settings = settings.add_source(
            config::Environment::with_prefix("REDFIRE_FXS")
                .prefix_separator("_")
                .separator("__")
        );

        let config = settings.build()?;
        let mut fxs_config: FxsConfig = config.try_deserialize()?;
        fxs_config.apply_line_defaults();
        Ok(fxs_config)
    }

    pub fn apply_line_defaults(&mut self) {
        for (index, line) in self.lines.iter_mut().enumerate() {
            line.apply_defaults(index);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lines.is_empty() {
            return Err(Error::parse("No line configured"));
        }
        if !self.lines.iter().any(|line| line.enable) {
            return Err(Error::parse("All lines are disabled"));
        }

        if self.general.short_timeout_ms == 0
            || self.general.short_timeout_ms >= self.general.idle_timeout_ms
        {
            return Err(Error::parse("Monitor timeouts must satisfy 0 < short < idle"));
        }

        if self.general.max_extension_length == 0
            || self.general.max_extension_length > MAX_EXTENSION_LENGTH
        {
            return Err(Error::parse(format!(
                "max_extension_length must be between 1 and {}",
                MAX_EXTENSION_LENGTH
            )));
        }

        let dialplan = Dialplan::from_config(&self.dialplan)?;

        for (index, line) in self.lines.iter().enumerate() {
            let number = index + 1;
            if line.dialing_timeout_1st_digit > MAX_DIALING_TIMEOUT_MS
                || line.dialing_timeout > MAX_DIALING_TIMEOUT_MS
            {
                return Err(Error::parse(format!("Dialing timeout too long on line {}", number)));
            }
            if let Some(trigger) = line.search_extension_trigger {
                if Digit::from_char(trigger).is_none() {
                    return Err(Error::parse(format!(
                        "Invalid search extension trigger '{}' on line {}",
                        trigger, number
                    )));
                }
            }
            if line.enable && line.monitor_dialing && !dialplan.has_context(&line.context) {
                warn!("Line {}: context '{}' is not defined in the local dialplan", number, line.context);
            }
        }

        Ok(())
    }

    pub fn default_config() -> Self {
        let mut contexts = BTreeMap::new();
        contexts.insert(
            "ai-line-1".to_string(),
            vec!["100".to_string(), "_5XXX".to_string(), "_0N.".to_string()],
        );

        Self {
            general: GeneralConfig {
                node_id: "redfire-fxs-1".to_string(),
                description: "Redfire analog line controller".to_string(),
                idle_timeout_ms: 5000,
                short_timeout_ms: 10,
                max_extension_length: MAX_EXTENSION_LENGTH,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
                max_size: 10 * 1024 * 1024, // 10MB
                max_files: 5,
                format: LogFormat::Compact,
            },
            lines: vec![LineConfig::new(0)],
            dialplan: DialplanConfig { contexts },
        }
    }
}
