/// The connection table: which instruments exist, what they are and how to reach them.
///
/// ```toml
/// [[device]]
/// name = "sig_gen"
/// profile = "hp8642a"
/// address = "prologix::/dev/ttyUSB0::7"
///
/// [[device]]
/// name = "dds"
/// profile = "novatech_409b_ac"
/// address = "COM4,19200"
/// update_mode = "asynchronous"
///
/// [[device]]
/// name = "dds_delayed"
/// profile = "novatech_409b_ac"
/// address = "COM5,19200"
/// synchronous_first_line_repeat = true
/// ```
use std::collections::HashSet;
use std::path::Path;

use anyhow::anyhow;
use serde::Deserialize;

use crate::address::Address;
use crate::builtin;
use crate::profile::{InstrumentProfile, TableOptions, UpdateMode};
use crate::Error;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    /// A built-in profile identifier or the path of a profile file.
    pub profile: String,
    pub address: String,
    #[serde(default)]
    pub update_mode: UpdateMode,
    #[serde(default)]
    pub synchronous_first_line_repeat: bool,
}

impl DeviceConfig {
    pub fn address(&self) -> crate::Result<Address> {
        Address::parse(&self.address)
    }

    pub fn table_options(&self) -> TableOptions {
        TableOptions {
            update_mode: self.update_mode,
            synchronous_first_line_repeat: self.synchronous_first_line_repeat,
        }
    }

    pub fn profile(&self) -> crate::Result<InstrumentProfile> {
        if builtin::contains(&self.profile) {
            return builtin::profile(&self.profile);
        }
        InstrumentProfile::from_file(&self.profile)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionTable {
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

impl ConnectionTable {
    /// Addresses are only checked once a device is used, so one bad entry does not
    /// take down the whole table.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let ret: Self =
            toml::from_str(content).map_err(|x| Error::argument(anyhow!("Invalid connection table: {}", x)))?;
        let mut names = HashSet::new();
        for device in &ret.devices {
            if !names.insert(device.name.as_str()) {
                return Err(Error::argument(anyhow!("Device `{}` is listed twice", device.name)));
            }
        }
        Ok(ret)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|x| Error::argument(anyhow!("Cannot read `{}`: {}", path.display(), x)))?;
        Self::from_toml(&content)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|x| x.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TABLE: &str = r#"
        [[device]]
        name = "dds"
        profile = "novatech_409b_ac"
        address = "COM4,19200"
        update_mode = "asynchronous"

        [[device]]
        name = "wavemeter"
        profile = "bristol_671"
        address = "wavemeter.lab"

        [[device]]
        name = "dds_delayed"
        profile = "novatech_409b_ac"
        address = "COM5,19200"
        synchronous_first_line_repeat = true
    "#;

    #[test]
    fn parse_table() {
        let table = ConnectionTable::from_toml(TABLE).unwrap();
        assert_eq!(table.devices.len(), 3);
        let dds = table.device("dds").unwrap();
        assert_eq!(dds.update_mode, UpdateMode::Asynchronous);
        assert!(!dds.synchronous_first_line_repeat);
        assert!(dds.table_options().repeats_first_row());
        let delayed = table.device("dds_delayed").unwrap().table_options();
        assert_eq!(delayed.update_mode, UpdateMode::Synchronous);
        assert!(delayed.repeats_first_row());
        assert_eq!(dds.profile().unwrap().name, "NovaTech 409B-AC");
        let wavemeter = table.device("wavemeter").unwrap();
        assert_eq!(wavemeter.update_mode, UpdateMode::Synchronous);
        assert_eq!(
            wavemeter.address().unwrap(),
            Address::Tcp {
                host: "wavemeter.lab".to_string(),
                port: 23
            }
        );
        assert!(table.device("scope").is_none());
    }

    #[test]
    fn duplicate_names() {
        let twice = format!("{}\n{}", TABLE, TABLE);
        assert!(matches!(ConnectionTable::from_toml(&twice), Err(Error::Argument(_))));
    }

    #[test]
    fn profile_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
            name = "custom"
            [[quantities]]
            name = "volt"
            min = 0.0
            max = 5.0
            write = "VOLT {value:.3}"
            "#,
        )
        .unwrap();
        let device = DeviceConfig {
            name: "psu".to_string(),
            profile: file.path().to_string_lossy().to_string(),
            address: "tcp::127.0.0.1:5025".to_string(),
            update_mode: UpdateMode::Synchronous,
            synchronous_first_line_repeat: false,
        };
        assert_eq!(device.profile().unwrap().quantity("volt").unwrap().limits(), (0.0, 5.0));

        let missing = DeviceConfig {
            profile: "/nonexistent/profile.toml".to_string(),
            ..device
        };
        assert!(matches!(missing.profile(), Err(Error::Argument(_))));
    }
}
