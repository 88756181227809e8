/// The persisted description of a single shot.
///
/// A shot file holds one group per device, each with named datasets (a `Table` plus
/// attributes) and scalar properties, and a `data` section that run-time code fills with
/// acquired traces and results. Maps are ordered, so saving the same content twice
/// produces identical files.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::table::Table;
use crate::Error;

pub const STATIC_DATA: &str = "STATIC_DATA";
pub const TABLE_DATA: &str = "TABLE_DATA";
pub const ANALOG_ACQUISITIONS: &str = "ANALOG_ACQUISITIONS";
pub const POD1_ACQUISITIONS: &str = "POD1_ACQUISITIONS";
pub const POD2_ACQUISITIONS: &str = "POD2_ACQUISITIONS";
pub const COUNTERS: &str = "COUNTERS";
pub const TRIGGER_TIME: &str = "trigger_time";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Float(f64),
    Int(i64),
    Str(String),
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Float(x) => Some(*x),
            AttrValue::Int(x) => Some(*x as f64),
            AttrValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(x) => Some(x),
            _ => None,
        }
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub table: Table,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: Attributes,
}

impl Dataset {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            attrs: Default::default(),
        }
    }

    pub fn with_attr<T: Into<String>>(mut self, name: T, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceGroup {
    #[serde(default)]
    pub datasets: BTreeMap<String, Dataset>,
    #[serde(default)]
    pub properties: Attributes,
}

impl DeviceGroup {
    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }

    pub fn insert_dataset<T: Into<String>>(&mut self, name: T, dataset: Dataset) {
        self.datasets.insert(name.into(), dataset);
    }

    pub fn set_property<T: Into<String>>(&mut self, name: T, value: AttrValue) {
        self.properties.insert(name.into(), value);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataGroup {
    #[serde(default)]
    pub traces: BTreeMap<String, Dataset>,
    /// Scalar results per device.
    #[serde(default)]
    pub results: BTreeMap<String, Attributes>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShotFile {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceGroup>,
    #[serde(default)]
    pub data: DataGroup,
}

impl ShotFile {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = fs::read(path)
            .map_err(|x| Error::storage(anyhow!("Cannot read `{}`: {}", path.display(), x)))?;
        serde_json::from_slice(&content)
            .map_err(|x| Error::storage(anyhow!("Cannot decode `{}`: {}", path.display(), x)))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();
        let content = self.to_bytes()?;
        fs::write(path, content)
            .map_err(|x| Error::storage(anyhow!("Cannot write `{}`: {}", path.display(), x)))
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(Error::storage)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceGroup> {
        self.devices.get(name)
    }

    /// Creates the group for a device. Every device may only be compiled once per shot.
    pub fn create_device(&mut self, name: &str) -> crate::Result<&mut DeviceGroup> {
        if self.devices.contains_key(name) {
            return Err(Error::argument(anyhow!("Device `{}` already exists in shot", name)));
        }
        Ok(self.devices.entry(name.to_string()).or_default())
    }

    pub fn insert_trace<T: Into<String>>(&mut self, label: T, trace: Dataset) {
        self.data.traces.insert(label.into(), trace);
    }

    pub fn insert_results(&mut self, device: &str, results: Attributes) {
        self.data
            .results
            .entry(device.to_string())
            .or_default()
            .extend(results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Dtype, Field, FieldFormat, Value};

    fn static_table(freq: u64) -> Table {
        let dtype = Dtype::new(vec![
            Field::new("freq0", FieldFormat::U64),
            Field::new("amp0", FieldFormat::F32),
        ])
        .unwrap();
        let mut table = Table::new(dtype);
        table.push_row(&[Value::Uint(freq), Value::Float(-10.0)]).unwrap();
        table
    }

    #[test]
    fn device_can_only_be_created_once() {
        let mut shot = ShotFile::new();
        shot.create_device("sig_gen").unwrap();
        assert!(matches!(shot.create_device("sig_gen"), Err(Error::Argument(_))));
    }

    #[test]
    fn same_content_same_bytes() {
        let build = || {
            let mut shot = ShotFile::new();
            let group = shot.create_device("sig_gen").unwrap();
            group.insert_dataset(STATIC_DATA, Dataset::new(static_table(10_000_000)));
            group.set_property("frequency_scale_factor", AttrValue::Float(1e6));
            shot
        };
        assert_eq!(build().to_bytes().unwrap(), build().to_bytes().unwrap());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.json");
        let mut shot = ShotFile::new();
        let group = shot.create_device("sig_gen").unwrap();
        group.insert_dataset(STATIC_DATA, Dataset::new(static_table(5)));
        shot.insert_trace(
            "scope",
            Dataset::new(static_table(7)).with_attr(TRIGGER_TIME, AttrValue::Float(0.5)),
        );
        shot.save(&path).unwrap();

        let loaded = ShotFile::load(&path).unwrap();
        assert_eq!(loaded, shot);
        let table = &loaded.device("sig_gen").unwrap().dataset(STATIC_DATA).unwrap().table;
        assert_eq!(table.get(0, "freq0").unwrap(), Value::Uint(5));
    }

    #[test]
    fn corrupted_table_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.json");
        let mut shot = ShotFile::new();
        let group = shot.create_device("sig_gen").unwrap();
        group.insert_dataset(STATIC_DATA, Dataset::new(static_table(5)));
        let mut json: serde_json::Value = serde_json::from_slice(&shot.to_bytes().unwrap()).unwrap();
        json["devices"]["sig_gen"]["datasets"][STATIC_DATA]["table"]["rows"] = serde_json::json!(3);
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let ret = ShotFile::load(&path);
        assert!(matches!(ret, Err(Error::Storage(_))));
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ret = ShotFile::load(dir.path().join("nope.json"));
        assert!(matches!(ret, Err(Error::Storage(_))));
    }
}
