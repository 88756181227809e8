//! The shot compiler turns a request (setpoints, tables and acquisitions per device) into a
//! `ShotFile`. It never talks to hardware: every value is validated against the device's
//! profile and scaled into raw instrument units here, so errors surface before a run starts.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::anyhow;
use serde::Deserialize;

use crate::config::ConnectionTable;
use crate::profile::{DriverKind, InstrumentProfile, TableOptions};
use crate::Error;
use labinstr_protocol::shot::STATIC_DATA;
use labinstr_protocol::{AttrValue, Dataset, DeviceGroup, ShotFile};

pub mod dds;
pub mod quantity;
pub mod scope;
pub mod static_table;

pub use quantity::{check_range, physical_to_raw, raw_to_physical};

/// A series of values, one per clock tick, or a constant.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Series {
    Constant(f64),
    Values(Vec<f64>),
}

impl Series {
    pub fn expand(&self, ticks: usize) -> crate::Result<Vec<f64>> {
        match self {
            Series::Constant(x) => Ok(vec![*x; ticks]),
            Series::Values(x) if x.len() == ticks => Ok(x.clone()),
            Series::Values(x) => Err(Error::argument(anyhow!(
                "Series has {} values but the clock has {} ticks",
                x.len(),
                ticks
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DdsSeries {
    pub freq: Series,
    #[serde(default = "zero_series")]
    pub amp: Series,
    #[serde(default = "zero_series")]
    pub phase: Series,
}

fn zero_series() -> Series {
    Series::Constant(0.0)
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableRequest {
    /// Clock ticks of the parent timing device, in seconds.
    pub times: Vec<f64>,
    /// Keyed by channel number.
    pub channels: BTreeMap<String, DdsSeries>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionRequest {
    /// e.g. "Channel 1" or "Digital 3"
    pub channel: String,
    pub label: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    Pulse,
    Edge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Pos,
    Neg,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterRequest {
    pub channel: String,
    pub kind: CounterKind,
    pub polarity: Polarity,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceRequest {
    /// Physical values keyed by quantity name.
    #[serde(default)]
    pub setpoints: BTreeMap<String, f64>,
    #[serde(default)]
    pub table: Option<TableRequest>,
    #[serde(default)]
    pub trigger_time: Option<f64>,
    #[serde(default)]
    pub acquisitions: Vec<AcquisitionRequest>,
    #[serde(default)]
    pub counters: Vec<CounterRequest>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShotRequest {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceRequest>,
}

impl ShotRequest {
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|x| Error::argument(anyhow!("Invalid shot request: {}", x)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|x| Error::argument(anyhow!("Cannot read `{}`: {}", path.display(), x)))?;
        Self::from_toml(&content)
    }
}

/// Builds the group of a single device.
pub fn compile_device<T: Into<TableOptions>>(
    profile: &InstrumentProfile,
    options: T,
    request: &DeviceRequest,
) -> crate::Result<DeviceGroup> {
    let mut group = DeviceGroup::default();
    let unsupported = |what: &str| Error::argument(anyhow!("{} does not support {}", profile.name, what));
    match profile.driver {
        DriverKind::Scpi => {
            if request.table.is_some() {
                return Err(unsupported("table mode"));
            }
            if !request.acquisitions.is_empty() || !request.counters.is_empty() {
                return Err(unsupported("acquisitions"));
            }
            if let Some(table) = static_table::build(profile, &request.setpoints)? {
                group.insert_dataset(STATIC_DATA, Dataset::new(table));
            }
        }
        DriverKind::NovatechDds => {
            if !request.acquisitions.is_empty() || !request.counters.is_empty() {
                return Err(unsupported("acquisitions"));
            }
            dds::build(profile, options.into(), request, &mut group)?;
        }
        DriverKind::Scope => {
            if !request.setpoints.is_empty() || request.table.is_some() {
                return Err(unsupported("setpoints"));
            }
            scope::build(profile, request, &mut group)?;
        }
    }
    group.set_property("profile", AttrValue::Str(profile.name.clone()));
    Ok(group)
}

/// Compiles a whole shot. Devices not mentioned in `request` do not appear in the shot.
pub fn compile(table: &ConnectionTable, request: &ShotRequest) -> crate::Result<ShotFile> {
    let mut shot = ShotFile::new();
    for (name, device_request) in &request.devices {
        let device = table
            .device(name)
            .ok_or_else(|| Error::argument(anyhow!("`{}` is not in the connection table", name)))?;
        // a malformed address aborts compilation just like an out of range value
        device.address()?;
        let profile = device.profile()?;
        let group = compile_device(&profile, device.table_options(), device_request)?;
        *shot.create_device(name)? = group;
        log::debug!("Compiled {} ({})", name, profile.name);
    }
    Ok(shot)
}
