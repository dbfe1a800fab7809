//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use can_explorer::{validate_signals, ByteOrder, ExplorerConfig, MessageKey, Signal, ValueType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub explorer: ExplorerConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    /// JSON file of `name -> {url, proclog}`
    #[serde(default = "default_routes")]
    pub routes: PathBuf,
    /// Directory holding `.dbc` files
    #[serde(default = "default_dbc_dir")]
    pub dbc_dir: PathBuf,
    /// Replaces every route's base location with `{part_base}/{route}`
    pub part_base: Option<String>,
}

fn default_routes() -> PathBuf {
    PathBuf::from("routes.json")
}

fn default_dbc_dir() -> PathBuf {
    PathBuf::from("dbc")
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            routes: default_routes(),
            dbc_dir: default_dbc_dir(),
            part_base: None,
        }
    }
}

/// What to load and which scripted actions to run
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionConfig {
    pub route: Option<String>,
    pub dbc: Option<String>,
    /// First part of the window to load after the initial one
    pub window_start: Option<u32>,
    /// Signal edits applied once the window is loaded
    #[serde(default)]
    pub edits: Vec<EditConfig>,
    /// Save the DBC under this name after the edits
    pub save_as: Option<String>,
}

/// Replacement signal set for one message
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EditConfig {
    pub address: u32,
    #[serde(default)]
    pub bus: u8,
    pub signals: Vec<SignalConfig>,
}

impl EditConfig {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.bus, self.address)
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.iter().map(SignalConfig::to_signal).collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalConfig {
    pub name: String,
    pub start_bit: u16,
    pub length: u16,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub big_endian: bool,
    pub unit: Option<String>,
}

fn default_factor() -> f64 {
    1.0
}

impl SignalConfig {
    pub fn to_signal(&self) -> Signal {
        let mut signal = Signal::new(self.name.clone(), self.start_bit, self.length)
            .with_scaling(self.factor, self.offset)
            .with_byte_order(if self.big_endian {
                ByteOrder::BigEndian
            } else {
                ByteOrder::LittleEndian
            })
            .with_value_type(if self.signed { ValueType::Signed } else { ValueType::Unsigned });
        if let Some(unit) = &self.unit {
            signal = signal.with_unit(unit.clone());
        }
        signal
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config.validate()?;
    Ok(config)
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        for edit in &self.session.edits {
            if edit.signals.iter().any(|s| s.length == 0 || s.length > 64) {
                bail!("Edit of {}: signal lengths must be 1..=64 bits", edit.key());
            }
            validate_signals(edit.address, &edit.signals())
                .with_context(|| format!("Edit of {}", edit.key()))?;
        }
        Ok(())
    }
}
