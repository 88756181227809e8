/// Tables for NovaTech DDS boxes.
///
/// Static channels go into a one-row `STATIC_DATA` table with the fields `freq<n>`,
/// `amp<n>`, `phase<n>`. Boxes without amplitude control have no `amp<n>` fields. Table channels are stepped by an external clock and get one
/// `TABLE_DATA` row per clock tick, all table channels in every row.
use std::collections::BTreeSet;

use anyhow::anyhow;

use super::quantity::physical_to_raw;
use super::{DeviceRequest, TableRequest};
use crate::profile::{DdsProfile, InstrumentProfile, QuantityProfile, TableOptions};
use crate::Error;
use labinstr_protocol::shot::{STATIC_DATA, TABLE_DATA};
use labinstr_protocol::{AttrValue, Dataset, DeviceGroup, Dtype, Field, Table, Value};

pub const SUB_CHANNELS: [&str; 3] = ["freq", "amp", "phase"];

/// Splits `freq2` into `("freq", 2)`.
pub fn split_field(name: &str) -> Option<(&str, u8)> {
    let idx = name.find(|c: char| c.is_ascii_digit())?;
    let (prefix, channel) = name.split_at(idx);
    if !SUB_CHANNELS.contains(&prefix) {
        return None;
    }
    Some((prefix, channel.parse().ok()?))
}

/// The sub channels `profile` can program, in table field order.
pub fn sub_channels(profile: &InstrumentProfile) -> Vec<&'static str> {
    SUB_CHANNELS
        .iter()
        .copied()
        .filter(|x| profile.quantity(x).is_some())
        .collect()
}

pub fn field_name(sub_channel: &str, channel: u8) -> String {
    format!("{}{}", sub_channel, channel)
}

pub(crate) fn sub_channel<'a>(profile: &'a InstrumentProfile, name: &str) -> crate::Result<&'a QuantityProfile> {
    profile
        .quantity(name)
        .ok_or_else(|| Error::internal(anyhow!("{} has no `{}` quantity", profile.name, name)))
}

pub(crate) fn dds_profile(profile: &InstrumentProfile) -> crate::Result<&DdsProfile> {
    profile
        .dds
        .as_ref()
        .ok_or_else(|| Error::internal(anyhow!("{} is not a DDS", profile.name)))
}

/// Same quantity, but reported under the channel's field name.
pub(crate) fn for_channel(quantity: &QuantityProfile, channel: u8) -> QuantityProfile {
    QuantityProfile {
        name: field_name(&quantity.name, channel),
        ..quantity.clone()
    }
}

fn dtype(profile: &InstrumentProfile, channels: &[u8]) -> crate::Result<Dtype> {
    let mut fields = Vec::new();
    for name in sub_channels(profile) {
        let quantity = sub_channel(profile, name)?;
        for channel in channels {
            fields.push(Field::new(field_name(name, *channel), quantity.format));
        }
    }
    Dtype::new(fields)
}

fn build_static(profile: &InstrumentProfile, request: &DeviceRequest) -> crate::Result<Option<Table>> {
    let dds = dds_profile(profile)?;
    let mut channels = BTreeSet::new();
    for name in request.setpoints.keys() {
        let (sub, channel) = split_field(name)
            .ok_or_else(|| Error::argument(anyhow!("Invalid DDS setpoint `{}`, expected e.g. `freq2`", name)))?;
        if profile.quantity(sub).is_none() {
            return Err(Error::argument(anyhow!("{} has no controllable `{}`", profile.name, sub)));
        }
        if channel >= dds.channels {
            return Err(Error::argument(anyhow!("{} has no channel {}", profile.name, channel)));
        }
        if dds.table_channels.contains(&channel) {
            return Err(Error::argument(anyhow!(
                "Channel {} of {} is driven from the table",
                channel,
                profile.name
            )));
        }
        channels.insert(channel);
    }
    if channels.is_empty() {
        return Ok(None);
    }
    let channels: Vec<u8> = channels.into_iter().collect();
    let mut row = Vec::new();
    for name in sub_channels(profile) {
        let quantity = sub_channel(profile, name)?;
        for channel in &channels {
            let quantity = for_channel(quantity, *channel);
            // unset sub channels start at the lower limit, e.g. 0.1 Hz for the frequency
            let x = request
                .setpoints
                .get(&quantity.name)
                .copied()
                .unwrap_or_else(|| quantity.limits().0);
            row.push(physical_to_raw(&quantity, x)?);
        }
    }
    let mut table = Table::new(dtype(profile, &channels)?);
    table.push_row(&row)?;
    Ok(Some(table))
}

fn build_table(profile: &InstrumentProfile, options: TableOptions, request: &TableRequest) -> crate::Result<Table> {
    let dds = dds_profile(profile)?;
    let ticks = request.times.len();
    if ticks == 0 {
        return Err(Error::argument(anyhow!("{}: table without clock ticks", profile.name)));
    }
    if ticks > dds.max_table_rows {
        return Err(Error::argument(anyhow!(
            "{} can only store {} table rows, the clock has {} ticks",
            profile.name,
            dds.max_table_rows,
            ticks
        )));
    }
    if request.times.windows(2).any(|x| !(x[0] < x[1])) {
        return Err(Error::argument(anyhow!("{}: clock ticks must increase", profile.name)));
    }

    let mut columns: Vec<Vec<Value>> = Vec::new();
    for name in sub_channels(profile) {
        let quantity = sub_channel(profile, name)?;
        for channel in &dds.table_channels {
            let column = match request.channels.get(&channel.to_string()) {
                Some(series) => {
                    let series = match name {
                        "freq" => &series.freq,
                        "amp" => &series.amp,
                        _ => &series.phase,
                    };
                    let quantity = for_channel(quantity, *channel);
                    series
                        .expand(ticks)?
                        .into_iter()
                        .map(|x| physical_to_raw(&quantity, x))
                        .collect::<crate::Result<Vec<_>>>()?
                }
                // unused table channels idle at the lowest frequency the board accepts
                None if name == "freq" => vec![Value::Uint(1); ticks],
                None => vec![Value::Uint(0); ticks],
            };
            columns.push(column);
        }
    }
    for key in request.channels.keys() {
        let known = key
            .parse::<u8>()
            .map(|x| dds.table_channels.contains(&x))
            .unwrap_or(false);
        if !known {
            return Err(Error::argument(anyhow!("{} has no table channel `{}`", profile.name, key)));
        }
    }

    let mut table = Table::new(dtype(profile, &dds.table_channels)?);
    for tick in 0..ticks {
        let row: Vec<Value> = columns.iter().map(|x| x[tick].clone()).collect();
        table.push_row(&row)?;
    }
    if options.repeats_first_row() {
        // otherwise the board runs one step ahead of the clock
        table.repeat_first_row()?;
    }
    Ok(table)
}

pub fn build(
    profile: &InstrumentProfile,
    options: TableOptions,
    request: &DeviceRequest,
    group: &mut DeviceGroup,
) -> crate::Result<()> {
    if let Some(table) = &request.table {
        if dds_profile(profile)?.table_channels.is_empty() {
            return Err(Error::argument(anyhow!("{} has no table channels", profile.name)));
        }
        group.insert_dataset(TABLE_DATA, Dataset::new(build_table(profile, options, table)?));
    }
    if let Some(table) = build_static(profile, request)? {
        group.insert_dataset(STATIC_DATA, Dataset::new(table));
    }
    for (sub, property) in [
        ("freq", "frequency_scale_factor"),
        ("amp", "amplitude_scale_factor"),
        ("phase", "phase_scale_factor"),
    ] {
        if let Some(quantity) = profile.quantity(sub) {
            group.set_property(property, AttrValue::Float(quantity.scale));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::compiler::{DdsSeries, Series};
    use crate::profile::UpdateMode;

    fn table_request(times: Vec<f64>, freq: Vec<f64>) -> TableRequest {
        let mut channels = std::collections::BTreeMap::new();
        channels.insert(
            "0".to_string(),
            DdsSeries {
                freq: Series::Values(freq),
                amp: Series::Constant(0.5),
                phase: Series::Constant(90.0),
            },
        );
        TableRequest { times, channels }
    }

    #[test]
    fn field_names() {
        assert_eq!(split_field("freq2"), Some(("freq", 2)));
        assert_eq!(split_field("phase10"), Some(("phase", 10)));
        assert_eq!(split_field("gain1"), None);
        assert_eq!(split_field("freq"), None);
    }

    #[test]
    fn static_channels() {
        let profile = builtin::profile("novatech_409b_ac").unwrap();
        let mut request = DeviceRequest::default();
        request.setpoints.insert("freq2".to_string(), 80e6);
        request.setpoints.insert("amp2".to_string(), 1.0);
        request.setpoints.insert("phase3".to_string(), 180.0);
        let table = build_static(&profile, &request).unwrap().unwrap();
        let names: Vec<_> = table.dtype().fields().iter().map(|x| x.name.clone()).collect();
        assert_eq!(names, ["freq2", "freq3", "amp2", "amp3", "phase2", "phase3"]);
        assert_eq!(table.get(0, "freq2").unwrap(), Value::Uint(800_000_000));
        assert_eq!(table.get(0, "amp2").unwrap(), Value::Uint(1023));
        assert_eq!(table.get(0, "phase3").unwrap(), Value::Uint(8192));
        // unset frequency of channel 3 starts at 0.1 Hz
        assert_eq!(table.get(0, "freq3").unwrap(), Value::Uint(1));

        request.setpoints.insert("freq0".to_string(), 1e6);
        assert!(matches!(build_static(&profile, &request), Err(Error::Argument(_))));
    }

    #[test]
    fn out_of_range_amplitude() {
        let profile = builtin::profile("novatech_409b").unwrap();
        let mut request = DeviceRequest::default();
        request.setpoints.insert("amp1".to_string(), 1.01);
        match build_static(&profile, &request) {
            Err(Error::Range(err)) => assert_eq!(err.channel, "amp1"),
            x => panic!("unexpected {:?}", x),
        }
    }

    #[test]
    fn synchronous_table() {
        let profile = builtin::profile("novatech_409b_ac").unwrap();
        let request = table_request(vec![0.0, 1e-3, 2e-3], vec![1e6, 2e6, 3e6]);
        let table = build_table(&profile, UpdateMode::Synchronous.into(), &request).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(2, "freq0").unwrap(), Value::Uint(30_000_000));
        assert_eq!(table.get(0, "amp0").unwrap(), Value::Uint(512));
        assert_eq!(table.get(0, "phase0").unwrap(), Value::Uint(4096));
        // channel 1 is unused
        assert_eq!(table.column("freq1").unwrap(), vec![Value::Uint(1); 3]);
        assert_eq!(table.get(1, "amp1").unwrap(), Value::Uint(0));
    }

    #[test]
    fn asynchronous_table_repeats_first_row() {
        let profile = builtin::profile("novatech_409b_ac").unwrap();
        let request = table_request(vec![0.0, 1e-3, 2e-3], vec![1e6, 2e6, 3e6]);
        let table = build_table(&profile, UpdateMode::Asynchronous.into(), &request).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.row(0).unwrap(), table.row(1).unwrap());
        assert_eq!(table.get(3, "freq0").unwrap(), Value::Uint(30_000_000));
    }

    #[test]
    fn synchronous_first_line_repeat() {
        let profile = builtin::profile("novatech_409b_ac").unwrap();
        let request = table_request(vec![0.0, 1e-3, 2e-3], vec![1e6, 2e6, 3e6]);
        let options = TableOptions {
            update_mode: UpdateMode::Synchronous,
            synchronous_first_line_repeat: true,
        };
        let table = build_table(&profile, options, &request).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.row(0).unwrap(), table.row(1).unwrap());
        assert_eq!(table.get(1, "freq0").unwrap(), Value::Uint(10_000_000));
        assert_eq!(table.get(2, "freq0").unwrap(), Value::Uint(20_000_000));
    }

    #[test]
    fn single_channel_without_amplitude() {
        let profile = builtin::profile("novatech_440a").unwrap();
        let mut request = DeviceRequest::default();
        request.setpoints.insert("freq0".to_string(), 80e6);
        request.setpoints.insert("phase0".to_string(), 90.0);
        let mut group = DeviceGroup::default();
        build(&profile, UpdateMode::Synchronous.into(), &request, &mut group).unwrap();
        let table = &group.dataset(STATIC_DATA).unwrap().table;
        let names: Vec<_> = table.dtype().fields().iter().map(|x| x.name.clone()).collect();
        assert_eq!(names, ["freq0", "phase0"]);
        assert_eq!(table.get(0, "freq0").unwrap(), Value::Uint(80_000_000));
        assert_eq!(table.get(0, "phase0").unwrap(), Value::Uint(4096));
        assert!(group.properties.get("amplitude_scale_factor").is_none());

        request.setpoints.insert("amp0".to_string(), 0.5);
        assert!(matches!(build_static(&profile, &request), Err(Error::Argument(_))));
        request.setpoints.remove("amp0");
        request.setpoints.insert("freq0".to_string(), 100.0);
        assert!(matches!(build_static(&profile, &request), Err(Error::Range(_))));
        request.setpoints.insert("freq1".to_string(), 1e6);
        assert!(matches!(build_static(&profile, &request), Err(Error::Argument(_))));
    }

    #[test]
    fn invalid_tables() {
        let profile = builtin::profile("novatech_409b_ac").unwrap();
        let mismatch = table_request(vec![0.0, 1e-3], vec![1e6]);
        assert!(build_table(&profile, UpdateMode::Synchronous.into(), &mismatch).is_err());
        let backwards = table_request(vec![1e-3, 0.0], vec![1e6, 1e6]);
        assert!(build_table(&profile, UpdateMode::Synchronous.into(), &backwards).is_err());
        let mut wrong_channel = table_request(vec![0.0], vec![1e6]);
        let series = wrong_channel.channels.remove("0").unwrap();
        wrong_channel.channels.insert("2".to_string(), series);
        assert!(build_table(&profile, UpdateMode::Synchronous.into(), &wrong_channel).is_err());

        let times: Vec<f64> = (0..16383).map(|x| x as f64 * 1e-4).collect();
        let too_long = table_request(times, vec![1e6; 16383]);
        assert!(build_table(&profile, UpdateMode::Synchronous.into(), &too_long).is_err());
    }

    #[test]
    fn scale_factors_are_recorded() {
        let profile = builtin::profile("novatech_409b_ac").unwrap();
        let mut group = DeviceGroup::default();
        let mut request = DeviceRequest::default();
        request.table = Some(table_request(vec![0.0], vec![1e6]));
        build(&profile, UpdateMode::Synchronous.into(), &request, &mut group).unwrap();
        assert!(group.dataset(TABLE_DATA).is_some());
        assert!(group.dataset(STATIC_DATA).is_none());
        assert_eq!(group.properties["amplitude_scale_factor"], AttrValue::Float(1023.0));
        assert_eq!(group.properties["frequency_scale_factor"], AttrValue::Float(10.0));
    }
}
