//! Controller configuration, loaded from YAML. Every field has a default.
use std::{fs, path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, Result};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

use crate::{constants::DEFAULT_BASE_ADDRESS, transport::ControlLine};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub boot: BootConfig,
    pub flash: FlashConfig,
    pub timeouts: Timeouts,
    pub assets: AssetConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path; the first available port when unset.
    pub port: Option<String>,
    pub bootloader_baud: u32,
    pub application_baud: u32,
    pub inter_chunk_delay_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: None,
            bootloader_baud: 115200,
            application_baud: 921600,
            inter_chunk_delay_ms: 2,
            read_timeout_ms: 10,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub reset_line: ControlLine,
    pub boot_line: ControlLine,
    /// Reset is usually driven through an N-FET, so asserted is high.
    pub invert_reset: bool,
    pub invert_boot: bool,
    pub settle_ms: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            reset_line: ControlLine::Rts,
            boot_line: ControlLine::Dtr,
            invert_reset: false,
            invert_boot: false,
            settle_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub base_address: u32,
    /// Read back and compare every page after writing.
    pub verify: bool,
}

impl Default for FlashConfig {
    fn default() -> Self {
        FlashConfig {
            base_address: DEFAULT_BASE_ADDRESS,
            verify: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Simple request/acknowledge commands.
    pub command_ms: u64,
    /// Bulk transfers, where the companion programs flash before answering.
    pub transfer_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            command_ms: 5000,
            transfer_ms: 20000,
        }
    }
}

impl Timeouts {
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_millis(self.transfer_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSpec {
    pub name: String,
    pub slot: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub directory: PathBuf,
    /// Size of the decode buffer, large enough for the biggest background.
    #[serde(deserialize_with = "parse_size")]
    pub buffer_capacity: usize,
    pub images: Vec<AssetSpec>,
}

impl Default for AssetConfig {
    fn default() -> Self {
        AssetConfig {
            directory: PathBuf::from("assets"),
            buffer_capacity: 800 * 480 * 4,
            images: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

/// Accepts `0x...` hex, `K`/`KB`/`KiB` suffixed sizes, or plain numbers.
pub fn parse_number(s: &str) -> Result<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .with_context(|| format!("error while parsing {:?}", s));
    }
    if let Some(kib) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix('K'))
    {
        let value = kib
            .trim()
            .parse::<u64>()
            .with_context(|| format!("error while parsing {:?}", s))?;
        return value
            .checked_mul(1024)
            .ok_or_else(|| anyhow::format_err!("{:?} overflows 64 bits", s));
    }
    s.parse().with_context(|| format!("error while parsing {:?}", s))
}

fn parse_value<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => parse_number(&s).map_err(D::Error::custom),
    }
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = parse_value(deserializer)?;
    u32::try_from(value).map_err(|_| D::Error::custom(format!("{:#x} exceeds 32 bits", value)))
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = parse_value(deserializer)?;
    usize::try_from(value).map_err(D::Error::custom)
}
