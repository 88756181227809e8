/// Driver for instruments whose settings are plain text commands: signal generators,
/// lock-in amplifiers and wavemeters. Everything device specific comes from the profile.
use anyhow::anyhow;
use async_trait::async_trait;

use super::{Driver, Values};
use crate::cache::SmartCache;
use crate::compiler::quantity::{reading_to_raw, same_setting};
use crate::compiler::{physical_to_raw, raw_to_physical};
use crate::profile::{Capabilities, InstrumentProfile, QuantityProfile};
use crate::session::Session;
use crate::status::StatusReport;
use crate::Error;
use labinstr_protocol::shot::STATIC_DATA;
use labinstr_protocol::{DataGroup, DeviceGroup, Value};

fn quantity<'a>(profile: &'a InstrumentProfile, name: &str) -> crate::Result<&'a QuantityProfile> {
    profile
        .quantity(name)
        .ok_or_else(|| Error::argument(anyhow!("{} has no quantity `{}`", profile.name, name)))
}

pub struct ScpiDriver {
    name: String,
    profile: InstrumentProfile,
    cache: SmartCache<String, Value>,
    initial: Values,
}

impl ScpiDriver {
    pub fn new(name: &str, profile: InstrumentProfile) -> Self {
        Self {
            name: name.to_string(),
            profile,
            cache: SmartCache::new(),
            initial: Values::new(),
        }
    }

    /// Queries a quantity and returns the reading in raw units.
    async fn read_quantity(&self, session: &mut Session, quantity: &QuantityProfile, query: &str) -> crate::Result<f64> {
        let reply = session.query(query).await?;
        if reply.is_empty() {
            if let Some(message) = &quantity.empty_reply {
                return Err(Error::device(self.name.as_str(), message.as_str()));
            }
        }
        let reading = quantity.parser.parse(&reply)?;
        if let Some(threshold) = quantity.off_at_or_below {
            if reading <= threshold {
                return Err(Error::device(
                    self.name.as_str(),
                    format!("{} reads {}, output is off or faulted", quantity.name, reading),
                ));
            }
        }
        Ok(reading)
    }
}

#[async_trait]
impl Driver for ScpiDriver {
    fn capabilities(&self) -> Capabilities {
        self.profile.capabilities
    }

    async fn init(&mut self, session: &mut Session) -> crate::Result<()> {
        self.cache.invalidate_all();
        super::prepare(session, &self.profile, &self.name).await
    }

    async fn check_remote_values(&mut self, session: &mut Session) -> crate::Result<Values> {
        let mut ret = Values::new();
        for quantity in &self.profile.quantities {
            let query = match &quantity.query {
                Some(x) => x,
                None => continue,
            };
            let reading = self.read_quantity(session, quantity, query).await?;
            let raw = reading_to_raw(quantity, reading);
            let physical = raw_to_physical(quantity, &raw)?;
            if let Some(cached) = self.cache.cached(&quantity.name) {
                if !same_setting(cached, &raw) {
                    log::warn!(
                        "{}: {} was changed on the instrument ({} instead of {})",
                        self.name,
                        quantity.name,
                        raw,
                        cached
                    );
                    self.cache.invalidate(&quantity.name);
                }
            }
            ret.insert(quantity.name.clone(), physical);
        }
        for measurement in &self.profile.measurements {
            let reply = session.query(&measurement.query).await?;
            let reading = measurement.parser.parse(&reply)?;
            ret.insert(measurement.name.clone(), reading / measurement.scale);
        }
        Ok(ret)
    }

    async fn program_manual(&mut self, session: &mut Session, values: &Values) -> crate::Result<Values> {
        let mut settings = Vec::new();
        for (name, x) in values {
            let quantity = quantity(&self.profile, name)?;
            if x.is_nan() && quantity.optional {
                continue;
            }
            settings.push((quantity, physical_to_raw(quantity, *x)?));
        }
        let mut ret = Values::new();
        for (quantity, raw) in &settings {
            super::write_setting(session, quantity, raw, 0).await?;
            ret.insert(quantity.name.clone(), raw_to_physical(quantity, raw)?);
        }
        // manual writes bypass the cache, the next shot programs everything again
        for (quantity, _) in &settings {
            self.cache.invalidate(&quantity.name);
        }
        if self.profile.capabilities.supports_remote_value_check {
            return self.check_remote_values(session).await;
        }
        Ok(ret)
    }

    async fn transition_to_buffered(
        &mut self,
        session: &mut Session,
        group: &DeviceGroup,
        initial: &Values,
        fresh: bool,
    ) -> crate::Result<Values> {
        self.initial = initial.clone();
        let mut ret = initial.clone();
        let table = match group.dataset(STATIC_DATA) {
            Some(x) => &x.table,
            None => return Ok(ret),
        };
        let fresh = fresh || !self.profile.capabilities.supports_smart_programming;
        for field in table.dtype().fields() {
            let quantity = quantity(&self.profile, &field.name)?;
            let raw = table.get(0, &field.name)?;
            if raw.is_sentinel() && quantity.optional {
                continue;
            }
            let physical = raw_to_physical(quantity, &raw)?;
            let s = &mut *session;
            let to_write = raw.clone();
            let written = self
                .cache
                .program(field.name.clone(), raw, fresh, move || async move {
                    super::write_setting(s, quantity, &to_write, 0).await
                })
                .await?;
            if !written {
                log::debug!("{}: {} unchanged", self.name, field.name);
            }
            ret.insert(field.name.clone(), physical);
        }
        Ok(ret)
    }

    async fn transition_to_manual(&mut self, session: &mut Session, abort: bool) -> crate::Result<DataGroup> {
        if abort {
            let initial = std::mem::take(&mut self.initial);
            self.program_manual(session, &initial).await?;
        }
        Ok(DataGroup::default())
    }

    async fn check_status(&mut self, session: &mut Session) -> crate::Result<StatusReport> {
        super::check_status(session, &self.profile, &self.name).await
    }

    async fn clear(&mut self, session: &mut Session) -> crate::Result<()> {
        super::clear(session, &self.profile).await
    }

    fn invalidate_cache(&mut self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::compiler::{compile_device, DeviceRequest};
    use crate::profile::UpdateMode;
    use crate::testing::{fake_instrument, options, CommandLog};
    use std::time::Duration;

    fn hp8642a(freq: &'static str, amp: &'static str) -> (Session, CommandLog) {
        let (stream, log) = fake_instrument(move |cmd| match cmd {
            "FROA" => Some(format!("FR {} HZ\n", freq).into_bytes()),
            "APOA" => Some(format!("AP {} DM\n", amp).into_bytes()),
            _ => None,
        });
        (Session::from_stream(stream, options()), log)
    }

    fn group(profile: &InstrumentProfile, setpoints: &[(&str, f64)]) -> DeviceGroup {
        let mut request = DeviceRequest::default();
        for (k, v) in setpoints {
            request.setpoints.insert(k.to_string(), *v);
        }
        compile_device(profile, UpdateMode::Synchronous, &request).unwrap()
    }

    fn values(x: &[(&str, f64)]) -> Values {
        x.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn unchanged_settings_are_written_once() {
        let profile = builtin::profile("hp8642a").unwrap();
        let group = group(&profile, &[("freq0", 100.0), ("amp0", -10.0)]);
        let mut driver = ScpiDriver::new("sg", profile);
        let (mut session, log) = hp8642a("100000000", "-10.0");
        let initial = values(&[("freq0", 1.0), ("amp0", 0.0)]);

        for _ in 0..3 {
            let ret = driver
                .transition_to_buffered(&mut session, &group, &initial, false)
                .await
                .unwrap();
            assert_eq!(ret, values(&[("freq0", 100.0), ("amp0", -10.0)]));
        }
        settle().await;
        assert_eq!(log.count("FR 100000000 HZ"), 1);
        assert_eq!(log.count("AP -10.0 DM"), 1);

        driver
            .transition_to_buffered(&mut session, &group, &initial, true)
            .await
            .unwrap();
        settle().await;
        assert_eq!(log.count("FR "), 2);
        assert_eq!(log.count("AP "), 2);
    }

    #[tokio::test]
    async fn manual_write_invalidates_cache() {
        let profile = builtin::profile("hp8642a").unwrap();
        let group = group(&profile, &[("freq0", 100.0)]);
        let mut driver = ScpiDriver::new("sg", profile);
        let (mut session, log) = hp8642a("50000000", "-10.0");

        driver
            .transition_to_buffered(&mut session, &group, &Values::new(), false)
            .await
            .unwrap();
        let ret = driver
            .program_manual(&mut session, &values(&[("freq0", 50.0)]))
            .await
            .unwrap();
        assert_eq!(ret["freq0"], 50.0);
        assert_eq!(ret["amp0"], -10.0);
        driver
            .transition_to_buffered(&mut session, &group, &Values::new(), false)
            .await
            .unwrap();
        settle().await;
        assert_eq!(
            log.commands()
                .iter()
                .filter(|x| x.starts_with("FR "))
                .cloned()
                .collect::<Vec<_>>(),
            vec!["FR 100000000 HZ", "FR 50000000 HZ", "FR 100000000 HZ"]
        );
    }

    #[tokio::test]
    async fn front_panel_changes_are_detected() {
        let profile = builtin::profile("hp8642a").unwrap();
        let group = group(&profile, &[("freq0", 100.0), ("amp0", -10.0)]);
        let mut driver = ScpiDriver::new("sg", profile);

        let (mut session, _) = hp8642a("100000000", "-10.0");
        driver
            .transition_to_buffered(&mut session, &group, &Values::new(), false)
            .await
            .unwrap();
        let remote = driver.check_remote_values(&mut session).await.unwrap();
        assert_eq!(remote, values(&[("freq0", 100.0), ("amp0", -10.0)]));

        // someone turned the frequency knob
        let (mut session, log) = hp8642a("120000000", "-10.0");
        let remote = driver.check_remote_values(&mut session).await.unwrap();
        assert_eq!(remote["freq0"], 120.0);
        driver
            .transition_to_buffered(&mut session, &group, &Values::new(), false)
            .await
            .unwrap();
        settle().await;
        assert_eq!(log.count("FR 100000000 HZ"), 1);
        assert_eq!(log.count("AP "), 0);
    }

    #[tokio::test]
    async fn output_off_is_a_device_error() {
        let profile = builtin::profile("hp8642a").unwrap();
        let mut driver = ScpiDriver::new("sg", profile);
        let (mut session, _) = hp8642a("100000000", "-201.0");
        match driver.check_remote_values(&mut session).await {
            Err(Error::Device(err)) => assert_eq!(err.device, "sg"),
            x => panic!("unexpected {:?}", x),
        }
    }

    #[tokio::test]
    async fn empty_reply_is_reported() {
        let profile = builtin::profile("rs_smhu").unwrap();
        let mut driver = ScpiDriver::new("smhu", profile);
        let (stream, _) = fake_instrument(|cmd| match cmd {
            "RF?" => Some(b"100000000.0\n".to_vec()),
            "LEVEL:RF?" => Some(b"\n".to_vec()),
            _ => None,
        });
        let mut session = Session::from_stream(stream, options());
        match driver.check_remote_values(&mut session).await {
            Err(Error::Device(err)) => assert_eq!(err.message, "RF is off"),
            x => panic!("unexpected {:?}", x),
        }
    }

    #[tokio::test]
    async fn unspecified_optional_settings_are_skipped() {
        let profile = builtin::profile("sr865").unwrap();
        let group = group(&profile, &[("tau", 10e-3)]);
        let mut driver = ScpiDriver::new("lockin", profile);
        let (stream, log) = fake_instrument(|cmd| match cmd {
            "OFLT?" => Some(b"8\n".to_vec()),
            "SCAL?" => Some(b"0\n".to_vec()),
            "PHAS?" => Some(b"12.5\n".to_vec()),
            _ => None,
        });
        let mut session = Session::from_stream(stream, options());
        let ret = driver
            .transition_to_buffered(&mut session, &group, &values(&[("sens", 1.0)]), false)
            .await
            .unwrap();
        assert_eq!(ret, values(&[("tau", 10e-3), ("sens", 1.0)]));
        let remote = driver.check_remote_values(&mut session).await.unwrap();
        assert_eq!(remote["tau"], 10e-3);
        assert_eq!(remote["sens"], 1.0);
        assert_eq!(remote["phase"], 12.5);
        settle().await;
        assert_eq!(log.count("OFLT 8"), 1);
        assert_eq!(log.count("SCAL "), 0);
        assert_eq!(log.count("PHAS "), 0);
    }

    #[tokio::test]
    async fn abort_restores_initial_values() {
        let profile = builtin::profile("hp8642a").unwrap();
        let group = group(&profile, &[("freq0", 100.0)]);
        let mut driver = ScpiDriver::new("sg", profile);
        let (mut session, log) = hp8642a("20000000", "-5.0");
        let initial = values(&[("freq0", 20.0), ("amp0", -5.0)]);
        driver
            .transition_to_buffered(&mut session, &group, &initial, false)
            .await
            .unwrap();
        let data = driver.transition_to_manual(&mut session, true).await.unwrap();
        assert!(data.traces.is_empty());
        settle().await;
        assert_eq!(log.count("FR 20000000 HZ"), 1);
        assert_eq!(log.count("AP -5.0 DM"), 1);
    }

    #[tokio::test]
    async fn unknown_or_out_of_range_values_write_nothing() {
        let profile = builtin::profile("hp8642a").unwrap();
        let mut driver = ScpiDriver::new("sg", profile);
        let (mut session, log) = hp8642a("1", "0");
        let ret = driver
            .program_manual(&mut session, &values(&[("amp0", 0.0), ("level", 1.0)]))
            .await;
        assert!(matches!(ret, Err(Error::Argument(_))));
        let ret = driver
            .program_manual(&mut session, &values(&[("amp0", 0.0), ("freq0", 2000.0)]))
            .await;
        assert!(matches!(ret, Err(Error::Range(_))));
        settle().await;
        assert!(log.commands().is_empty());
    }

    #[tokio::test]
    async fn wavemeter_measurements() {
        let profile = builtin::profile("bristol_671").unwrap();
        let mut driver = ScpiDriver::new("wavemeter", profile);
        let (stream, _) = fake_instrument(|cmd| match cmd {
            ":READ:ALL?" => Some(b"1,0,780.241,1.25\n".to_vec()),
            _ => None,
        });
        let mut session = Session::from_stream(stream, options());
        let remote = driver.check_remote_values(&mut session).await.unwrap();
        assert_eq!(remote["wavelength"], 780.241);
        assert_eq!(remote["power"], 1.25);
        assert!(!remote.contains_key("setpoint"));
    }
}
