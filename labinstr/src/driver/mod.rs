//! Drivers program one instrument through a `Session`. The worker owns both and calls the
//! driver at the points of a run: manual edits, transition to buffered, back to manual.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::codec::Arg;
use crate::compiler::raw_to_physical;
use crate::profile::{Capabilities, DriverKind, InstrumentProfile, QuantityProfile, UpdateMode};
use crate::session::Session;
use crate::status::{self, StatusReport};
use crate::Error;
use labinstr_protocol::{DataGroup, DeviceGroup, Value};

pub mod novatech;
pub mod scope;
pub mod scpi;

pub use novatech::NovatechDriver;
pub use scope::ScopeDriver;
pub use scpi::ScpiDriver;

/// Front panel values in physical units, keyed by quantity or field name.
pub type Values = BTreeMap<String, f64>;

#[async_trait]
pub trait Driver: Send {
    fn capabilities(&self) -> Capabilities;

    /// Called once after the session has been opened.
    async fn init(&mut self, session: &mut Session) -> crate::Result<()>;

    /// Reads back what the instrument currently outputs.
    async fn check_remote_values(&mut self, session: &mut Session) -> crate::Result<Values>;

    /// Programs front panel values without smart programming and returns the values the
    /// instrument settled on.
    async fn program_manual(&mut self, session: &mut Session, values: &Values) -> crate::Result<Values>;

    /// Programs the device group of a shot and returns the values the front panel shows
    /// once the shot has run.
    async fn transition_to_buffered(
        &mut self,
        session: &mut Session,
        group: &DeviceGroup,
        initial: &Values,
        fresh: bool,
    ) -> crate::Result<Values>;

    /// Finishes the shot. Acquired data is returned, aborting restores the initial values.
    async fn transition_to_manual(&mut self, session: &mut Session, abort: bool) -> crate::Result<DataGroup>;

    async fn check_status(&mut self, session: &mut Session) -> crate::Result<StatusReport>;

    async fn clear(&mut self, session: &mut Session) -> crate::Result<()>;

    /// Forgets everything known about the instrument state.
    fn invalidate_cache(&mut self);
}

pub fn create(name: &str, profile: InstrumentProfile, update_mode: UpdateMode) -> Box<dyn Driver> {
    match profile.driver {
        DriverKind::Scpi => Box::new(ScpiDriver::new(name, profile)),
        DriverKind::NovatechDds => Box::new(NovatechDriver::new(name, profile, update_mode)),
        DriverKind::Scope => Box::new(ScopeDriver::new(name, profile)),
    }
}

pub(crate) fn arg(value: &Value) -> crate::Result<Arg> {
    match value {
        Value::Uint(x) => i64::try_from(*x)
            .map(Arg::Int)
            .map_err(|_| Error::internal(anyhow!("{} does not fit a command argument", x))),
        Value::Int(x) => Ok(Arg::Int(*x)),
        Value::Float(x) => Ok(Arg::Float(*x)),
        Value::Str(x) => Err(Error::internal(anyhow!("Cannot program string `{}`", x))),
    }
}

/// Renders the write command of `quantity` for a raw table value.
pub(crate) fn render(quantity: &QuantityProfile, raw: &Value, channel: u8) -> crate::Result<String> {
    let physical = raw_to_physical(quantity, raw)?;
    quantity.write.render(&[
        ("raw", arg(raw)?),
        ("value", Arg::Float(physical)),
        ("scaled", Arg::Float(physical * quantity.command_scale)),
        ("channel", Arg::Int(channel as i64)),
    ])
}

pub(crate) async fn write_setting(
    session: &mut Session,
    quantity: &QuantityProfile,
    raw: &Value,
    channel: u8,
) -> crate::Result<()> {
    let cmd = render(quantity, raw, channel)?;
    session.write(&cmd).await
}

/// Skips the greeting banner, checks the identity and sends the setup commands.
pub(crate) async fn prepare(session: &mut Session, profile: &InstrumentProfile, device: &str) -> crate::Result<()> {
    let connection = &profile.connection;
    if let Some(wait) = connection.opening_message_wait_ms {
        let skipped = session.skip_opening_message(Duration::from_millis(wait)).await?;
        log::debug!("{}: skipped {} bytes of opening message", device, skipped);
    }
    if let Some(identity) = &connection.identity {
        let reply = session.query(&identity.query).await?;
        if !identity.contains.iter().all(|x| reply.contains(x.as_str())) {
            return Err(Error::device(
                device,
                format!("`{}` is not supported by the {} profile", reply, profile.name),
            ));
        }
        log::info!("{}: connected to {}", device, reply);
    }
    for cmd in &connection.setup {
        session.write(cmd).await?;
    }
    Ok(())
}

pub(crate) async fn check_status(
    session: &mut Session,
    profile: &InstrumentProfile,
    device: &str,
) -> crate::Result<StatusReport> {
    match &profile.status {
        Some(x) if profile.capabilities.supports_status => status::check_status(session, x, device).await,
        _ => Err(Error::argument(anyhow!("{} does not report its status", profile.name))),
    }
}

pub(crate) async fn clear(session: &mut Session, profile: &InstrumentProfile) -> crate::Result<()> {
    match &profile.connection.clear_command {
        Some(cmd) => session.write(cmd).await,
        None => session.clear().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::testing::{fake_instrument, options};

    #[test]
    fn render_commands() {
        let profile = builtin::profile("hp8642a").unwrap();
        let freq = profile.quantity("freq0").unwrap();
        assert_eq!(render(freq, &Value::Uint(100_000_000), 0).unwrap(), "FR 100000000 HZ");
        let amp = profile.quantity("amp0").unwrap();
        assert_eq!(render(amp, &Value::Float(-3.5), 0).unwrap(), "AP -3.5 DM");

        let dds = builtin::profile("novatech_409b").unwrap();
        let freq = dds.quantity("freq").unwrap();
        assert_eq!(render(freq, &Value::Uint(800_000_000), 2).unwrap(), "F2 80.0000000");
        let phase = dds.quantity("phase").unwrap();
        assert_eq!(render(phase, &Value::Uint(4096), 1).unwrap(), "P1 4096");
    }

    #[tokio::test]
    async fn identity_is_checked() {
        let profile = builtin::profile("keysight_msox3000").unwrap();
        let (stream, log) = fake_instrument(|cmd| match cmd {
            "*IDN?" => Some(b"KEYSIGHT TECHNOLOGIES,MSO-X 3024T,MY1234,07.20\n".to_vec()),
            _ => None,
        });
        let mut session = Session::from_stream(stream, options());
        prepare(&mut session, &profile, "scope").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.count("*ESE 60;*SRE 32;*CLS;:WAV:BYT MSBF"), 1);

        let profile = builtin::profile("keysight_dsox1000").unwrap();
        let (stream, _log) = fake_instrument(|cmd| match cmd {
            "*IDN?" => Some(b"KEYSIGHT TECHNOLOGIES,MSO-X 3024T,MY1234,07.20\n".to_vec()),
            _ => None,
        });
        let mut session = Session::from_stream(stream, options());
        let ret = prepare(&mut session, &profile, "scope").await;
        assert!(matches!(ret, Err(Error::Device(_))));
    }

    #[tokio::test]
    async fn clear_uses_profile_command() {
        let profile = builtin::profile("bristol_671").unwrap();
        let (stream, log) = fake_instrument(|_| None);
        let mut session = Session::from_stream(stream, options());
        clear(&mut session, &profile).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.commands(), vec!["*CLS"]);
    }
}
