//! # Register Maps
//!
//! A register map is a JSON object naming each measurement of a device model:
//!
//! ```json
//! {
//!   "sum_active_power": { "address": 40200, "quantity": 2, "gain": 1000 },
//!   "cos_phi":          { "address": 40204, "quantity": 1, "gain": 1000, "signed": true },
//!   "averageCurrentSOC": { "address": 1002, "quantity": 1, "gain": 10, "fc": 4 }
//! }
//! ```
//!
//! Files live under the configured map directory:
//! `logger/<manufacturer>.json` and `ess/<manufacturer>[_<model>].json`,
//! all lowercase.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegisterMapError {
    #[error("missing register map: {0}")]
    Missing(PathBuf),

    #[error("failed to read register map {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid register map {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// The device families that carry a register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind<'a> {
    Logger { manufacturer: &'a str },
    Ess {
        manufacturer: &'a str,
        model: Option<&'a str>,
    },
}

impl DeviceKind<'_> {
    /// Map file for this device, relative to the map directory.
    pub fn relative_path(&self) -> PathBuf {
        match self {
            DeviceKind::Logger { manufacturer } => {
                Path::new("logger").join(format!("{}.json", manufacturer.to_lowercase()))
            }
            DeviceKind::Ess {
                manufacturer,
                model: Some(model),
            } => Path::new("ess").join(format!(
                "{}_{}.json",
                manufacturer.to_lowercase(),
                model.to_lowercase()
            )),
            DeviceKind::Ess {
                manufacturer,
                model: None,
            } => Path::new("ess").join(format!("{}.json", manufacturer.to_lowercase())),
        }
    }
}

/// Modbus function used to read a register block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterTable {
    Holding,
    Input,
}

/// One measurement in a map.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterSpec {
    pub address: u16,
    pub quantity: u16,
    #[serde(default)]
    pub gain: Option<f64>,
    #[serde(default)]
    pub signed: Option<bool>,
    #[serde(default)]
    pub fc: Option<u8>,
}

impl RegisterSpec {
    /// Function code 3 reads holding registers; anything else input registers.
    pub fn table(&self) -> RegisterTable {
        match self.fc {
            Some(3) => RegisterTable::Holding,
            _ => RegisterTable::Input,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RegisterMap {
    entries: BTreeMap<String, RegisterSpec>,
}

impl RegisterMap {
    pub async fn load(dir: &Path, kind: DeviceKind<'_>) -> Result<Self, RegisterMapError> {
        Self::load_file(&dir.join(kind.relative_path())).await
    }

    pub async fn load_file(path: &Path) -> Result<Self, RegisterMapError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegisterMapError::Missing(path.to_path_buf()))
            }
            Err(source) => {
                return Err(RegisterMapError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| RegisterMapError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, key: &str) -> Option<&RegisterSpec> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisterSpec)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, RegisterSpec)> for RegisterMap {
    fn from_iter<I: IntoIterator<Item = (String, RegisterSpec)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Combines one or two registers into a scaled value.
///
/// Two registers form a 32-bit word, high register first. Signed values are
/// read as 32-bit two's complement, so a single register never turns
/// negative.
pub fn combine_scaled(registers: &[u16], gain: f64, signed: bool) -> Option<f64> {
    let raw: u32 = match registers {
        [] => return None,
        [high, low] => (u32::from(*high) << 16) | u32::from(*low),
        [first, ..] => u32::from(*first),
    };
    let value = if signed {
        f64::from(raw as i32)
    } else {
        f64::from(raw)
    };
    Some(value / gain)
}

/// Decodes every register of a block separately as 16-bit values.
pub fn decode_each(registers: &[u16], spec: &RegisterSpec) -> Vec<f64> {
    let signed = spec.signed.unwrap_or(false);
    registers
        .iter()
        .map(|&r| {
            let value = if signed {
                f64::from(r as i16)
            } else {
                f64::from(r)
            };
            match spec.gain {
                Some(gain) => value / gain,
                None => value,
            }
        })
        .collect()
}
