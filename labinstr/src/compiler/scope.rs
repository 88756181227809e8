/// Acquisition tables for oscilloscopes.
use std::collections::BTreeSet;

use anyhow::anyhow;

use super::{CounterKind, DeviceRequest, Polarity};
use crate::profile::{InstrumentProfile, ScopeProfile};
use crate::Error;
use labinstr_protocol::shot::{ANALOG_ACQUISITIONS, COUNTERS, POD1_ACQUISITIONS, POD2_ACQUISITIONS, TRIGGER_TIME};
use labinstr_protocol::{AttrValue, Dataset, DeviceGroup, Dtype, Field, FieldFormat, Table, Value};

pub const NAME_LENGTH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeChannel {
    /// 1-based, as printed on the front panel.
    Analog(u8),
    /// 0..16, pod 1 holds 0..8.
    Digital(u8),
}

impl ScopeChannel {
    pub fn parse(connection: &str, scope: &ScopeProfile) -> crate::Result<Self> {
        let invalid = || Error::argument(anyhow!("`{}` is not a valid channel", connection));
        let (kind, number) = connection.rsplit_once(' ').ok_or_else(invalid)?;
        let number: u8 = number.parse().map_err(|_| invalid())?;
        match kind {
            "Channel" if number >= 1 && number <= scope.analog_channels => Ok(ScopeChannel::Analog(number)),
            "Digital" if (number as usize) < 8 * scope.digital_pods as usize => Ok(ScopeChannel::Digital(number)),
            _ => Err(invalid()),
        }
    }

    /// The acquisition table this channel is listed in.
    pub fn table_name(&self) -> &'static str {
        match self {
            ScopeChannel::Analog(_) => ANALOG_ACQUISITIONS,
            ScopeChannel::Digital(x) if *x < 8 => POD1_ACQUISITIONS,
            ScopeChannel::Digital(_) => POD2_ACQUISITIONS,
        }
    }
}

impl CounterKind {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            CounterKind::Pulse => "PUL",
            CounterKind::Edge => "EDG",
        }
    }
}

impl Polarity {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Polarity::Pos => "P",
            Polarity::Neg => "N",
        }
    }
}

fn string_table(names: &[&str]) -> crate::Result<Table> {
    let fields = names
        .iter()
        .map(|x| Field::new(*x, FieldFormat::Str(NAME_LENGTH)))
        .collect();
    Ok(Table::new(Dtype::new(fields)?))
}

fn scope_profile(profile: &InstrumentProfile) -> crate::Result<&ScopeProfile> {
    profile
        .scope
        .as_ref()
        .ok_or_else(|| Error::internal(anyhow!("{} is not a scope", profile.name)))
}

pub fn build(profile: &InstrumentProfile, request: &DeviceRequest, group: &mut DeviceGroup) -> crate::Result<()> {
    let scope = scope_profile(profile)?;
    if request.acquisitions.is_empty() && request.counters.is_empty() {
        return Ok(());
    }
    let trigger_time = request
        .trigger_time
        .ok_or_else(|| Error::argument(anyhow!("{}: acquisitions need a trigger time", profile.name)))?;

    let mut acquired = BTreeSet::new();
    let mut labels = BTreeSet::new();
    let mut tables: Vec<(&'static str, Table)> = Vec::new();
    for acquisition in &request.acquisitions {
        let channel = ScopeChannel::parse(&acquisition.channel, scope)?;
        if !acquired.insert(acquisition.channel.as_str()) {
            return Err(Error::argument(anyhow!(
                "{} can only acquire once per shot",
                acquisition.channel
            )));
        }
        if !labels.insert(acquisition.label.as_str()) {
            return Err(Error::argument(anyhow!("Duplicate trace label `{}`", acquisition.label)));
        }
        let name = channel.table_name();
        let idx = match tables.iter().position(|(x, _)| *x == name) {
            Some(idx) => idx,
            None => {
                tables.push((name, string_table(&["connection", "label"])?));
                tables.len() - 1
            }
        };
        tables[idx].1.push_row(&[
            Value::Str(acquisition.channel.clone()),
            Value::Str(acquisition.label.clone()),
        ])?;
    }

    if !request.counters.is_empty() {
        if !scope.counters {
            return Err(Error::argument(anyhow!("{} has no counters", profile.name)));
        }
        let mut counters = string_table(&["connection", "type", "polarity"])?;
        for counter in &request.counters {
            match ScopeChannel::parse(&counter.channel, scope)? {
                ScopeChannel::Analog(_) => {}
                ScopeChannel::Digital(_) => {
                    return Err(Error::argument(anyhow!("Cannot count on {}", counter.channel)));
                }
            }
            counters.push_row(&[
                Value::Str(counter.channel.clone()),
                Value::Str(counter.kind.mnemonic().to_string()),
                Value::Str(counter.polarity.mnemonic().to_string()),
            ])?;
        }
        tables.push((COUNTERS, counters));
    }

    for (name, table) in tables {
        let dataset = Dataset::new(table).with_attr(TRIGGER_TIME, AttrValue::Float(trigger_time));
        group.insert_dataset(name, dataset);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::compiler::{AcquisitionRequest, CounterRequest};

    fn acquisition(channel: &str, label: &str) -> AcquisitionRequest {
        AcquisitionRequest {
            channel: channel.to_string(),
            label: label.to_string(),
        }
    }

    #[test]
    fn channel_names() {
        let profile = builtin::profile("keysight_msox3000").unwrap();
        let scope = profile.scope.as_ref().unwrap();
        assert_eq!(ScopeChannel::parse("Channel 4", scope).unwrap(), ScopeChannel::Analog(4));
        assert_eq!(ScopeChannel::parse("Digital 15", scope).unwrap().table_name(), POD2_ACQUISITIONS);
        assert!(ScopeChannel::parse("Channel 0", scope).is_err());
        assert!(ScopeChannel::parse("Channel 5", scope).is_err());
        assert!(ScopeChannel::parse("Digital 16", scope).is_err());
        assert!(ScopeChannel::parse("CH1", scope).is_err());

        let profile = builtin::profile("keysight_dsox1000").unwrap();
        let scope = profile.scope.as_ref().unwrap();
        assert!(ScopeChannel::parse("Digital 0", scope).is_err());
    }

    #[test]
    fn acquisition_tables() {
        let profile = builtin::profile("keysight_msox3000").unwrap();
        let request = DeviceRequest {
            trigger_time: Some(0.25),
            acquisitions: vec![
                acquisition("Channel 1", "photodiode"),
                acquisition("Digital 2", "gate"),
                acquisition("Channel 3", "pd"),
            ],
            counters: vec![CounterRequest {
                channel: "Channel 1".to_string(),
                kind: CounterKind::Pulse,
                polarity: Polarity::Neg,
            }],
            ..Default::default()
        };
        let mut group = DeviceGroup::default();
        build(&profile, &request, &mut group).unwrap();
        let analog = group.dataset(ANALOG_ACQUISITIONS).unwrap();
        assert_eq!(analog.table.len(), 2);
        assert_eq!(analog.table.get(1, "label").unwrap(), Value::Str("pd".to_string()));
        assert_eq!(analog.attrs[TRIGGER_TIME], AttrValue::Float(0.25));
        assert_eq!(group.dataset(POD1_ACQUISITIONS).unwrap().table.len(), 1);
        assert!(group.dataset(POD2_ACQUISITIONS).is_none());
        let counters = &group.dataset(COUNTERS).unwrap().table;
        assert_eq!(counters.get(0, "type").unwrap(), Value::Str("PUL".to_string()));
        assert_eq!(counters.get(0, "polarity").unwrap(), Value::Str("N".to_string()));
    }

    #[test]
    fn invalid_acquisitions() {
        let profile = builtin::profile("keysight_msox3000").unwrap();
        let mut group = DeviceGroup::default();
        let no_trigger = DeviceRequest {
            acquisitions: vec![acquisition("Channel 1", "a")],
            ..Default::default()
        };
        assert!(build(&profile, &no_trigger, &mut group).is_err());
        let twice = DeviceRequest {
            trigger_time: Some(0.0),
            acquisitions: vec![acquisition("Channel 1", "a"), acquisition("Channel 1", "b")],
            ..Default::default()
        };
        assert!(build(&profile, &twice, &mut group).is_err());

        let profile = builtin::profile("tektronix_tds").unwrap();
        let counter = DeviceRequest {
            trigger_time: Some(0.0),
            counters: vec![CounterRequest {
                channel: "Channel 1".to_string(),
                kind: CounterKind::Edge,
                polarity: Polarity::Pos,
            }],
            ..Default::default()
        };
        assert!(build(&profile, &counter, &mut group).is_err());
    }
}
