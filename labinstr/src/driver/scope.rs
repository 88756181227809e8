/// Driver for oscilloscopes that capture a single trace per shot.
///
/// Going buffered arms the scope (`:DIG` on Keysight) and configures counters. Going back to
/// manual reads out every acquired channel and returns the traces as `t`/`values` tables.
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bitvec::prelude::*;
use byteorder::{BigEndian, ByteOrder};

use super::{Driver, Values};
use crate::compiler::scope::ScopeChannel;
use crate::profile::{Capabilities, InstrumentProfile, ScopeFlavor, ScopeProfile};
use crate::scpi::WaveformPreamble;
use crate::session::Session;
use crate::status::StatusReport;
use crate::Error;
use labinstr_protocol::shot::{ANALOG_ACQUISITIONS, COUNTERS, POD1_ACQUISITIONS, POD2_ACQUISITIONS, TRIGGER_TIME};
use labinstr_protocol::{AttrValue, Attributes, DataGroup, Dataset, DeviceGroup, Dtype, Field, FieldFormat, Table, Value};

fn text(table: &Table, row: usize, name: &str) -> crate::Result<String> {
    match table.get(row, name)? {
        Value::Str(x) => Ok(x),
        x => Err(Error::internal(anyhow!("Expected text in `{}`, got {:?}", name, x))),
    }
}

fn trace(time: &[f64], values: Vec<Value>, format: FieldFormat, trigger_time: f64) -> crate::Result<Dataset> {
    if time.len() != values.len() {
        return Err(Error::protocol(anyhow!(
            "Trace has {} samples but {} time points",
            values.len(),
            time.len()
        )));
    }
    let dtype = Dtype::new(vec![Field::new("t", FieldFormat::F64), Field::new("values", format)])?;
    let mut table = Table::new(dtype);
    for (t, x) in time.iter().zip(values) {
        table.push_row(&[Value::Float(*t), x])?;
    }
    Ok(Dataset::new(table).with_attr(TRIGGER_TIME, AttrValue::Float(trigger_time)))
}

/// Acquisitions of one shot, kept until the scope is read out.
struct Armed {
    group: DeviceGroup,
    trigger_time: f64,
}

impl Armed {
    /// (connection, label) pairs of an acquisition table.
    fn acquisitions(&self, name: &str) -> crate::Result<Vec<(String, String)>> {
        let table = match self.group.dataset(name) {
            Some(x) => &x.table,
            None => return Ok(Vec::new()),
        };
        (0..table.len())
            .map(|row| Ok((text(table, row, "connection")?, text(table, row, "label")?)))
            .collect()
    }
}

pub struct ScopeDriver {
    name: String,
    profile: InstrumentProfile,
    counters: Option<Table>,
    armed: Option<Armed>,
}

impl ScopeDriver {
    pub fn new(name: &str, profile: InstrumentProfile) -> Self {
        Self {
            name: name.to_string(),
            profile,
            counters: None,
            armed: None,
        }
    }

    fn scope(&self) -> crate::Result<&ScopeProfile> {
        self.profile
            .scope
            .as_ref()
            .ok_or_else(|| Error::internal(anyhow!("{} is not a scope", self.profile.name)))
    }

    fn analog_channel(&self, connection: &str) -> crate::Result<u8> {
        match ScopeChannel::parse(connection, self.scope()?)? {
            ScopeChannel::Analog(x) => Ok(x),
            ScopeChannel::Digital(_) => Err(Error::argument(anyhow!("{} is not an analog channel", connection))),
        }
    }

    fn digital_channel(&self, connection: &str) -> crate::Result<u8> {
        match ScopeChannel::parse(connection, self.scope()?)? {
            ScopeChannel::Digital(x) => Ok(x),
            ScopeChannel::Analog(_) => Err(Error::argument(anyhow!("{} is not a digital channel", connection))),
        }
    }

    async fn configure_counters(&mut self, session: &mut Session, table: &Table, fresh: bool) -> crate::Result<()> {
        if !fresh && self.counters.as_ref() == Some(table) {
            return Ok(());
        }
        self.counters = None;
        for row in 0..table.len() {
            let channel = self.analog_channel(&text(table, row, "connection")?)?;
            let kind = text(table, row, "type")?;
            let polarity = text(table, row, "polarity")?;
            session
                .write(&format!(":MEAS:{}{} CHAN{}", polarity, kind, channel))
                .await?;
        }
        self.counters = Some(table.clone());
        Ok(())
    }

    async fn read_keysight(&self, session: &mut Session, armed: &Armed, data: &mut DataGroup) -> crate::Result<()> {
        for (connection, label) in armed.acquisitions(ANALOG_ACQUISITIONS)? {
            let channel = self.analog_channel(&connection)?;
            let reply = session
                .query(&format!(":WAV:FORM WORD;SOUR CHAN{};PRE?", channel))
                .await?;
            let pre = WaveformPreamble::parse(&reply)?;
            let raw = session.query_binary_sized(":WAV:DATA?", pre.points * 2).await?;
            let values = raw
                .chunks_exact(2)
                .map(|x| Value::Float(pre.scale(BigEndian::read_u16(x) as f64)))
                .collect();
            let dataset = trace(&pre.time_axis(), values, FieldFormat::F32, armed.trigger_time)?;
            data.traces.insert(label, dataset);
        }

        for (pod, name) in [(1, POD1_ACQUISITIONS), (2, POD2_ACQUISITIONS)] {
            let acquisitions = armed.acquisitions(name)?;
            if acquisitions.is_empty() {
                continue;
            }
            let reply = session.query(&format!(":WAV:FORM BYTE;SOUR POD{};PRE?", pod)).await?;
            let pre = WaveformPreamble::parse(&reply)?;
            let raw = session.query_binary_sized(":WAV:DATA?", pre.points).await?;
            let time = pre.time_axis();
            for (connection, label) in acquisitions {
                let bit = (self.digital_channel(&connection)? % 8) as usize;
                let values = raw
                    .iter()
                    .map(|x| Value::Uint(x.view_bits::<Lsb0>()[bit] as u64))
                    .collect();
                data.traces
                    .insert(label, trace(&time, values, FieldFormat::U8, armed.trigger_time)?);
            }
        }

        if let Some(dataset) = armed.group.dataset(COUNTERS) {
            let table = &dataset.table;
            let mut results = Attributes::new();
            for row in 0..table.len() {
                let connection = text(table, row, "connection")?;
                let channel = self.analog_channel(&connection)?;
                let kind = text(table, row, "type")?;
                let polarity = text(table, row, "polarity")?;
                let reply = session
                    .query(&format!(":MEAS:{}{}? CHAN{}", polarity, kind, channel))
                    .await?;
                let count = reply
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| Error::unexpected_response(reply.clone()))?;
                results.insert(format!("{}:{}{}", connection, polarity, kind), AttrValue::Float(count));
            }
            results.insert(TRIGGER_TIME.to_string(), AttrValue::Float(armed.trigger_time));
            data.results.insert(self.name.clone(), results);
        }
        Ok(())
    }

    async fn read_tektronix(&self, session: &mut Session, armed: &Armed, data: &mut DataGroup) -> crate::Result<()> {
        let acquisitions = armed.acquisitions(ANALOG_ACQUISITIONS)?;
        if acquisitions.is_empty() {
            return Ok(());
        }
        let mut channels = Vec::new();
        for (connection, label) in acquisitions {
            let channel = self.analog_channel(&connection)?;
            let y = session
                .query_values(&format!(":DAT:SOU CH{};:WFMPRE:YZE?;YMU?;YOFF?", channel), ';')
                .await?;
            if y.len() != 3 {
                return Err(Error::protocol(anyhow!("Expected 3 vertical scale values, got {:?}", y)));
            }
            let (zero, mult, offset) = (y[0], y[1], y[2]);
            let raw = session.query_binary("CURV?").await?;
            let values: Vec<f64> = raw
                .chunks_exact(2)
                .map(|x| (BigEndian::read_i16(x) as f64 - offset) * mult + zero)
                .collect();
            channels.push((label, values));
        }
        let x = session.query_values(":WFMPRE:XZE?;XIN?", ';').await?;
        if x.len() != 2 {
            return Err(Error::protocol(anyhow!("Expected 2 horizontal scale values, got {:?}", x)));
        }
        let (t0, dt) = (x[0], x[1]);
        for (label, values) in channels {
            let time: Vec<f64> = (0..values.len()).map(|k| k as f64 * dt + t0).collect();
            let values = values.into_iter().map(Value::Float).collect();
            data.traces
                .insert(label, trace(&time, values, FieldFormat::F32, armed.trigger_time)?);
        }
        Ok(())
    }

    async fn read_out(&self, session: &mut Session, armed: &Armed) -> crate::Result<DataGroup> {
        let mut data = DataGroup::default();
        match self.scope()?.flavor {
            ScopeFlavor::Keysight => self.read_keysight(session, armed, &mut data).await?,
            ScopeFlavor::Tektronix => self.read_tektronix(session, armed, &mut data).await?,
        }
        log::info!("{}: read {} traces", self.name, data.traces.len());
        Ok(data)
    }
}

#[async_trait]
impl Driver for ScopeDriver {
    fn capabilities(&self) -> Capabilities {
        self.profile.capabilities
    }

    async fn init(&mut self, session: &mut Session) -> crate::Result<()> {
        self.counters = None;
        self.armed = None;
        super::prepare(session, &self.profile, &self.name).await
    }

    async fn check_remote_values(&mut self, _session: &mut Session) -> crate::Result<Values> {
        Ok(Values::new())
    }

    async fn program_manual(&mut self, _session: &mut Session, values: &Values) -> crate::Result<Values> {
        if let Some(name) = values.keys().next() {
            return Err(Error::argument(anyhow!("{} has no output `{}`", self.profile.name, name)));
        }
        Ok(Values::new())
    }

    async fn transition_to_buffered(
        &mut self,
        session: &mut Session,
        group: &DeviceGroup,
        initial: &Values,
        fresh: bool,
    ) -> crate::Result<Values> {
        self.armed = None;
        if let Some(dataset) = group.dataset(COUNTERS) {
            self.configure_counters(session, &dataset.table, fresh).await?;
        }
        if group.datasets.is_empty() {
            return Ok(initial.clone());
        }
        if self.scope()?.flavor == ScopeFlavor::Keysight {
            // single acquisition, :WAV:DATA? then waits for this trigger
            session.write(":DIG").await?;
        }
        let trigger_time = group
            .datasets
            .values()
            .find_map(|x| x.attrs.get(TRIGGER_TIME).and_then(AttrValue::as_f64))
            .ok_or_else(|| Error::argument(anyhow!("{}: acquisitions without a trigger time", self.name)))?;
        self.armed = Some(Armed {
            group: group.clone(),
            trigger_time,
        });
        Ok(initial.clone())
    }

    async fn transition_to_manual(&mut self, session: &mut Session, abort: bool) -> crate::Result<DataGroup> {
        let armed = match self.armed.take() {
            Some(x) if !abort => x,
            _ => return Ok(DataGroup::default()),
        };
        let timeout = session.options().timeout;
        session.set_timeout(Duration::from_millis(self.scope()?.waveform_timeout_ms));
        let ret = self.read_out(session, &armed).await;
        session.set_timeout(timeout);
        ret
    }

    async fn check_status(&mut self, session: &mut Session) -> crate::Result<StatusReport> {
        super::check_status(session, &self.profile, &self.name).await
    }

    async fn clear(&mut self, session: &mut Session) -> crate::Result<()> {
        super::clear(session, &self.profile).await
    }

    fn invalidate_cache(&mut self) {
        self.counters = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::compiler::{compile_device, AcquisitionRequest, CounterKind, CounterRequest, DeviceRequest, Polarity};
    use crate::profile::UpdateMode;
    use crate::testing::{fake_instrument, options};

    fn block(payload: &[u8]) -> Vec<u8> {
        let len = payload.len().to_string();
        let mut ret = format!("#{}{}", len.len(), len).into_bytes();
        ret.extend_from_slice(payload);
        ret.push(b'\n');
        ret
    }

    fn acquisition(channel: &str, label: &str) -> AcquisitionRequest {
        AcquisitionRequest {
            channel: channel.to_string(),
            label: label.to_string(),
        }
    }

    fn keysight_request() -> DeviceRequest {
        DeviceRequest {
            trigger_time: Some(0.5),
            acquisitions: vec![acquisition("Channel 1", "photodiode"), acquisition("Digital 10", "gate")],
            counters: vec![CounterRequest {
                channel: "Channel 2".to_string(),
                kind: CounterKind::Pulse,
                polarity: Polarity::Neg,
            }],
            ..Default::default()
        }
    }

    fn keysight() -> (Session, crate::testing::CommandLog) {
        let mut source = String::new();
        let (stream, log) = fake_instrument(move |cmd| {
            if let Some(x) = cmd.strip_suffix(";PRE?") {
                source = x.rsplit("SOUR ").next().unwrap_or_default().to_string();
                return Some(b"+0,+0,+4,+1,+1.0E-03,-2.0E-03,+0,+1.0E-01,+0.0E+00,+0\n".to_vec());
            }
            match cmd {
                ":WAV:DATA?" if source == "CHAN1" => Some(block(&[0, 0, 0, 1, 0, 2, 0, 3])),
                ":WAV:DATA?" if source == "POD2" => Some(block(&[0b100, 0, 0b100, 0xff])),
                ":MEAS:NPUL? CHAN2" => Some(b"+3.0E+00\n".to_vec()),
                _ => None,
            }
        });
        (Session::from_stream(stream, options()), log)
    }

    #[tokio::test]
    async fn keysight_readout() {
        let profile = builtin::profile("keysight_msox3000").unwrap();
        let group = compile_device(&profile, UpdateMode::Synchronous, &keysight_request()).unwrap();
        let mut driver = ScopeDriver::new("scope", profile);
        let (mut session, log) = keysight();

        driver
            .transition_to_buffered(&mut session, &group, &Values::new(), false)
            .await
            .unwrap();
        let data = driver.transition_to_manual(&mut session, false).await.unwrap();
        assert_eq!(log.count(":MEAS:NPUL CHAN2"), 1);
        assert_eq!(log.count(":DIG"), 1);

        let trace = &data.traces["photodiode"];
        assert_eq!(trace.attrs[TRIGGER_TIME], AttrValue::Float(0.5));
        assert_eq!(trace.table.len(), 4);
        assert_eq!(trace.table.get(0, "t").unwrap(), Value::Float(-2e-3));
        let x = trace.table.get(3, "values").unwrap().as_f64().unwrap();
        assert!((x - 0.3).abs() < 1e-6);

        // Digital 10 is bit 2 of pod 2
        let gate = &data.traces["gate"].table;
        assert_eq!(
            gate.column("values").unwrap(),
            vec![Value::Uint(1), Value::Uint(0), Value::Uint(1), Value::Uint(1)]
        );

        let results = &data.results["scope"];
        assert_eq!(results["Channel 2:NPUL"], AttrValue::Float(3.0));
        assert_eq!(results[TRIGGER_TIME], AttrValue::Float(0.5));
    }

    #[tokio::test]
    async fn counters_are_configured_once() {
        let profile = builtin::profile("keysight_msox3000").unwrap();
        let group = compile_device(&profile, UpdateMode::Synchronous, &keysight_request()).unwrap();
        let mut driver = ScopeDriver::new("scope", profile);
        let (mut session, log) = keysight();
        for _ in 0..2 {
            driver
                .transition_to_buffered(&mut session, &group, &Values::new(), false)
                .await
                .unwrap();
            driver.transition_to_manual(&mut session, true).await.unwrap();
        }
        driver
            .transition_to_buffered(&mut session, &group, &Values::new(), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.count(":MEAS:NPUL CHAN2"), 2);
        assert_eq!(log.count(":DIG"), 3);
        // aborted shots are not read out
        assert_eq!(log.count(":WAV"), 0);
    }

    #[tokio::test]
    async fn nothing_to_acquire() {
        let profile = builtin::profile("keysight_msox3000").unwrap();
        let mut driver = ScopeDriver::new("scope", profile);
        let (mut session, log) = keysight();
        driver
            .transition_to_buffered(&mut session, &DeviceGroup::default(), &Values::new(), false)
            .await
            .unwrap();
        let data = driver.transition_to_manual(&mut session, false).await.unwrap();
        assert!(data.traces.is_empty());
        assert!(data.results.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(log.commands().is_empty());
    }

    #[tokio::test]
    async fn tektronix_readout() {
        let profile = builtin::profile("tektronix_tds").unwrap();
        let request = DeviceRequest {
            trigger_time: Some(1.0),
            acquisitions: vec![acquisition("Channel 2", "pd")],
            ..Default::default()
        };
        let group = compile_device(&profile, UpdateMode::Synchronous, &request).unwrap();
        let mut driver = ScopeDriver::new("tek", profile);
        let (stream, log) = fake_instrument(|cmd| match cmd {
            ":DAT:SOU CH2;:WFMPRE:YZE?;YMU?;YOFF?" => Some(b"0.5;0.01;0\n".to_vec()),
            "CURV?" => {
                let mut payload = [0_u8; 4];
                BigEndian::write_i16(&mut payload[..2], 10);
                BigEndian::write_i16(&mut payload[2..], -10);
                Some(block(&payload))
            }
            ":WFMPRE:XZE?;XIN?" => Some(b"-1e-3;1e-4\n".to_vec()),
            _ => None,
        });
        let mut session = Session::from_stream(stream, options());
        driver
            .transition_to_buffered(&mut session, &group, &Values::new(), false)
            .await
            .unwrap();
        let data = driver.transition_to_manual(&mut session, false).await.unwrap();
        assert_eq!(log.count(":DIG"), 0);

        let pd = &data.traces["pd"].table;
        let values: Vec<f64> = pd.column("values").unwrap().iter().filter_map(Value::as_f64).collect();
        assert_eq!(values.len(), 2);
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] - 0.4).abs() < 1e-6);
        let t = pd.get(1, "t").unwrap().as_f64().unwrap();
        assert!((t + 0.9e-3).abs() < 1e-12);
        assert_eq!(session.options().timeout, options().timeout);
    }

    #[tokio::test]
    async fn manual_values_are_rejected() {
        let profile = builtin::profile("tektronix_tds").unwrap();
        let mut driver = ScopeDriver::new("tek", profile);
        let (stream, _) = fake_instrument(|_| None);
        let mut session = Session::from_stream(stream, options());
        let mut values = Values::new();
        values.insert("freq0".to_string(), 1.0);
        assert!(matches!(
            driver.program_manual(&mut session, &values).await,
            Err(Error::Argument(_))
        ));
        assert!(driver.program_manual(&mut session, &Values::new()).await.unwrap().is_empty());
    }
}
