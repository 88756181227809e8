/// Profiles compiled into the binary, keyed by instrument identifier.
use std::collections::BTreeMap;

use anyhow::anyhow;
use lazy_static::lazy_static;

use crate::profile::InstrumentProfile;
use crate::Error;

macro_rules! profiles {
    ($($key:literal),* $(,)?) => {
        &[$(($key, include_str!(concat!("../profiles/", $key, ".toml")))),*]
    };
}

const SOURCES: &[(&str, &str)] = profiles![
    "bristol_671",
    "hp8642a",
    "hp8643a",
    "keysight_dsox1000",
    "keysight_msox3000",
    "novatech_409b",
    "novatech_409b_ac",
    "novatech_440a",
    "rs_smf100a",
    "rs_smhu",
    "sr865",
    "srs_sg382",
    "srs_sg384",
    "srs_sg386",
    "tektronix_tds",
];

lazy_static! {
    static ref REGISTRY: BTreeMap<&'static str, &'static str> = SOURCES.iter().copied().collect();
}

/// Identifiers of all built-in profiles, sorted.
pub fn keys() -> Vec<&'static str> {
    REGISTRY.keys().copied().collect()
}

pub fn contains(key: &str) -> bool {
    REGISTRY.contains_key(key)
}

pub fn profile(key: &str) -> crate::Result<InstrumentProfile> {
    let source = REGISTRY
        .get(key)
        .ok_or_else(|| Error::argument(anyhow!("No built-in profile `{}`", key)))?;
    InstrumentProfile::from_toml(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DriverKind;

    #[test]
    fn all_profiles_validate() {
        for key in keys() {
            let profile = profile(key).unwrap_or_else(|x| panic!("{}: {}", key, x));
            assert!(!profile.name.is_empty());
            if profile.capabilities.supports_status {
                assert_eq!(profile.status.as_ref().unwrap().labels.len(), 8);
            }
        }
        assert_eq!(keys().len(), SOURCES.len());
    }

    #[test]
    fn lookup() {
        assert!(contains("hp8642a"));
        assert_eq!(profile("novatech_409b_ac").unwrap().driver, DriverKind::NovatechDds);
        assert_eq!(profile("tektronix_tds").unwrap().driver, DriverKind::Scope);
        assert!(matches!(profile("hp8648a"), Err(Error::Argument(_))));
    }

    #[test]
    fn quantity_limits() {
        let smhu = profile("rs_smhu").unwrap();
        assert_eq!(smhu.quantity("freq0").unwrap().limits(), (0.1, 4320.0));
        let sr865 = profile("sr865").unwrap();
        assert_eq!(sr865.quantity("sens").unwrap().limits(), (1e-9, 1.0));
        assert_eq!(sr865.quantity("tau").unwrap().limits(), (1e-6, 30e3));
    }
}
