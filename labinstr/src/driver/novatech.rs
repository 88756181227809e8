/// Driver for NovaTech DDS boxes (409B family, 440A) over their serial command set.
///
/// Every command is acknowledged with `OK`. `QUE` reports the words currently output by
/// each channel in the column order the profile gives. Right after connecting they seed
/// the smart cache of the static channels. Table channels are written row by row with
/// `t<ch> <row> <freq>,<phase>,<amp>,ff` and only rows that differ from the previously
/// written table are sent again.
use anyhow::anyhow;
use async_trait::async_trait;

use super::{Driver, Values};
use crate::cache::SmartCache;
use crate::compiler::dds::{dds_profile, field_name, for_channel, split_field, sub_channel, sub_channels};
use crate::compiler::{physical_to_raw, raw_to_physical};
use crate::profile::{Capabilities, InstrumentProfile, UpdateMode};
use crate::session::Session;
use crate::status::StatusReport;
use crate::Error;
use labinstr_protocol::shot::{STATIC_DATA, TABLE_DATA};
use labinstr_protocol::{DataGroup, DeviceGroup, Table, Value};

async fn command(session: &mut Session, cmd: &str) -> crate::Result<()> {
    session.write(cmd).await?;
    let reply = session.read_line().await?;
    if reply.trim() != "OK" {
        return Err(Error::protocol(anyhow!("`{}` not acknowledged, got {:?}", cmd, reply)));
    }
    Ok(())
}

fn word(value: &Value) -> crate::Result<u64> {
    match value {
        Value::Uint(x) => Ok(*x),
        x => Err(Error::internal(anyhow!("Expected an unsigned table word, got {:?}", x))),
    }
}

/// (freq, phase, amp) of one table channel, in the order the board expects them.
fn table_entry(table: &Table, row: usize, channel: u8) -> crate::Result<[u64; 3]> {
    Ok([
        word(&table.get(row, &field_name("freq", channel))?)?,
        word(&table.get(row, &field_name("phase", channel))?)?,
        word(&table.get(row, &field_name("amp", channel))?)?,
    ])
}

/// A shorter table overwrites the beginning of the cached one, a longer one replaces it.
fn merge_tables(old: Option<Table>, new: &Table) -> crate::Result<Table> {
    match old {
        Some(mut old) if old.dtype() == new.dtype() && new.len() <= old.len() => {
            for row in 0..new.len() {
                for field in new.dtype().fields() {
                    old.set(row, &field.name, new.get(row, &field.name)?)?;
                }
            }
            Ok(old)
        }
        _ => Ok(new.clone()),
    }
}

pub struct NovatechDriver {
    name: String,
    profile: InstrumentProfile,
    update_mode: UpdateMode,
    /// Raw words of the static outputs, keyed by field name such as `freq2`.
    cache: SmartCache<String, Value>,
    table: Option<Table>,
    initial: Values,
    final_values: Values,
}

impl NovatechDriver {
    pub fn new(name: &str, profile: InstrumentProfile, update_mode: UpdateMode) -> Self {
        Self {
            name: name.to_string(),
            profile,
            update_mode,
            cache: SmartCache::new(),
            table: None,
            initial: Values::new(),
            final_values: Values::new(),
        }
    }

    /// Raw words of every output as reported by `QUE`.
    async fn read_outputs(&self, session: &mut Session) -> crate::Result<Vec<(String, Value)>> {
        let dds = dds_profile(&self.profile)?;
        session.drain().await?;
        session.write("QUE").await?;
        let mut lines = Vec::new();
        for _ in 0..(dds.channels as usize + dds.readback_trailer_lines) {
            lines.push(session.read_line().await?);
        }
        let mut ret = Vec::new();
        for (channel, line) in lines.iter().take(dds.channels as usize).enumerate() {
            let tokens: Vec<_> = line.split_whitespace().collect();
            if tokens.len() < dds.readback.len() {
                return Err(Error::unexpected_response(line.clone()));
            }
            for (column, token) in dds.readback.iter().zip(&tokens) {
                let word = u64::from_str_radix(token, 16).map_err(|_| Error::unexpected_response(line.clone()))?;
                ret.push((field_name(&column.name, channel as u8), Value::Uint(word / column.divisor)));
            }
        }
        Ok(ret)
    }

    fn to_physical(&self, raw: &[(String, Value)]) -> crate::Result<Values> {
        let mut ret = Values::new();
        for (field, word) in raw {
            let (sub, _) = split_field(field).ok_or_else(|| Error::internal(anyhow!("Invalid DDS output `{}`", field)))?;
            ret.insert(field.clone(), raw_to_physical(sub_channel(&self.profile, sub)?, word)?);
        }
        Ok(ret)
    }

    async fn query_outputs(&self, session: &mut Session) -> crate::Result<Values> {
        let raw = self.read_outputs(session).await?;
        self.to_physical(&raw)
    }

    /// Writes a static sub channel unless it is known to be set already.
    async fn program_static(&mut self, session: &mut Session, field: &str, raw: Value, fresh: bool) -> crate::Result<bool> {
        let (sub, channel) = split_field(field)
            .ok_or_else(|| Error::argument(anyhow!("Invalid DDS output `{}`, expected e.g. `freq2`", field)))?;
        let quantity = sub_channel(&self.profile, sub)?;
        let s = &mut *session;
        let to_write = raw.clone();
        self.cache
            .program(field.to_string(), raw, fresh, move || async move {
                let cmd = super::render(quantity, &to_write, channel)?;
                command(s, &cmd).await
            })
            .await
    }

    async fn program_table(&mut self, session: &mut Session, table: &Table, fresh: bool) -> crate::Result<()> {
        let dds = dds_profile(&self.profile)?;
        let mut written = 0;
        for row in 0..table.len() {
            for channel in &dds.table_channels {
                let entry = table_entry(table, row, *channel)?;
                let unchanged = match &self.table {
                    Some(old) if !fresh && row < old.len() => table_entry(old, row, *channel)? == entry,
                    _ => false,
                };
                if unchanged {
                    continue;
                }
                let cmd = format!(
                    "t{} {:04x} {:08x},{:04x},{:04x},ff",
                    channel, row, entry[0], entry[1], entry[2]
                );
                command(session, &cmd).await?;
                written += 1;
            }
        }
        log::debug!("{}: wrote {} of {} table entries", self.name, written, table.len() * dds.table_channels.len());
        self.table = Some(merge_tables(self.table.take(), table)?);
        Ok(())
    }

    /// Writes the sub channels of `channels` that `values` holds.
    async fn program_channels(&mut self, session: &mut Session, values: &Values, channels: &[u8]) -> crate::Result<()> {
        for channel in channels {
            for sub in sub_channels(&self.profile) {
                let field = field_name(sub, *channel);
                let x = match values.get(&field) {
                    Some(x) => *x,
                    None => continue,
                };
                let quantity = for_channel(sub_channel(&self.profile, sub)?, *channel);
                let raw = physical_to_raw(&quantity, x)?;
                self.program_static(session, &field, raw, true).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for NovatechDriver {
    fn capabilities(&self) -> Capabilities {
        self.profile.capabilities
    }

    async fn init(&mut self, session: &mut Session) -> crate::Result<()> {
        self.cache.invalidate_all();
        self.table = None;
        session.drain().await?;
        // turn off echo, the reply may still be echoed
        session.write("e d").await?;
        let mut reply = session.read_line().await?;
        if reply.trim() == "e d" {
            reply = session.read_line().await?;
        }
        if reply.trim() != "OK" {
            return Err(Error::protocol(anyhow!("`e d` not acknowledged, got {:?}", reply)));
        }
        for cmd in dds_profile(&self.profile)?.setup.clone() {
            command(session, &cmd).await?;
        }
        let raw = self.read_outputs(session).await?;
        let outputs = self.to_physical(&raw)?;
        for (field, word) in raw {
            self.cache.store(field, word);
        }
        log::info!("{}: connected, outputs {:?}", self.name, outputs);
        Ok(())
    }

    async fn check_remote_values(&mut self, session: &mut Session) -> crate::Result<Values> {
        self.query_outputs(session).await
    }

    async fn program_manual(&mut self, session: &mut Session, values: &Values) -> crate::Result<Values> {
        let channels = dds_profile(&self.profile)?.channels;
        let mut settings = Vec::new();
        for (field, x) in values {
            let (sub, channel) = split_field(field)
                .filter(|(sub, channel)| *channel < channels && self.profile.quantity(sub).is_some())
                .ok_or_else(|| Error::argument(anyhow!("{} has no output `{}`", self.profile.name, field)))?;
            let quantity = for_channel(sub_channel(&self.profile, sub)?, channel);
            settings.push((field.clone(), physical_to_raw(&quantity, *x)?));
        }
        for (field, raw) in settings {
            self.program_static(session, &field, raw, false).await?;
            // a later shot must not trust what the front panel wrote
            self.cache.invalidate(&field);
        }
        self.query_outputs(session).await
    }

    async fn transition_to_buffered(
        &mut self,
        session: &mut Session,
        group: &DeviceGroup,
        initial: &Values,
        fresh: bool,
    ) -> crate::Result<Values> {
        self.initial = initial.clone();
        self.final_values = initial.clone();
        let fresh = fresh || !self.profile.capabilities.supports_smart_programming;

        if let Some(dataset) = group.dataset(STATIC_DATA) {
            let table = &dataset.table;
            for field in table.dtype().fields() {
                let raw = table.get(0, &field.name)?;
                let (sub, _) = split_field(&field.name)
                    .ok_or_else(|| Error::argument(anyhow!("Invalid DDS output `{}`", field.name)))?;
                let physical = raw_to_physical(sub_channel(&self.profile, sub)?, &raw)?;
                self.program_static(session, &field.name, raw, fresh).await?;
                self.final_values.insert(field.name.clone(), physical);
            }
        }

        if let Some(dataset) = group.dataset(TABLE_DATA) {
            let table = &dataset.table;
            self.program_table(session, table, fresh).await?;
            let last = table
                .len()
                .checked_sub(1)
                .ok_or_else(|| Error::argument(anyhow!("{}: empty table", self.name)))?;
            for field in table.dtype().fields() {
                let (sub, _) = split_field(&field.name)
                    .ok_or_else(|| Error::argument(anyhow!("Invalid DDS output `{}`", field.name)))?;
                let physical = raw_to_physical(sub_channel(&self.profile, sub)?, &table.get(last, &field.name)?)?;
                self.final_values.insert(field.name.clone(), physical);
            }
            // table mode, then wait for the first clock edge
            command(session, "m t").await?;
            if self.update_mode == UpdateMode::Synchronous {
                command(session, "I e").await?;
            }
        }
        Ok(self.final_values.clone())
    }

    async fn transition_to_manual(&mut self, session: &mut Session, abort: bool) -> crate::Result<DataGroup> {
        let dds = dds_profile(&self.profile)?.clone();
        if !dds.table_channels.is_empty() {
            command(session, "m 0").await?;
            command(session, "I a").await?;
        }
        if abort {
            // table channels never left their initial values
            let statics: Vec<u8> = (0..dds.channels).filter(|x| !dds.table_channels.contains(x)).collect();
            let initial = std::mem::take(&mut self.initial);
            self.program_channels(session, &initial, &statics).await?;
            for channel in statics {
                for sub in sub_channels(&self.profile) {
                    self.cache.invalidate(&field_name(sub, channel));
                }
            }
        } else {
            // static channels already are at their final values
            let final_values = std::mem::take(&mut self.final_values);
            self.program_channels(session, &final_values, &dds.table_channels).await?;
        }
        Ok(DataGroup::default())
    }

    async fn check_status(&mut self, session: &mut Session) -> crate::Result<StatusReport> {
        super::check_status(session, &self.profile, &self.name).await
    }

    async fn clear(&mut self, session: &mut Session) -> crate::Result<()> {
        session.drain().await.map(|_| ())
    }

    fn invalidate_cache(&mut self) {
        self.cache.invalidate_all();
        self.table = None;
    }
}
