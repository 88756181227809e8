/// Instrument profiles: everything that distinguishes one instrument model from another,
/// expressed as data. Profiles are TOML documents and are validated when loaded, so a
/// profile that parses is safe to hand to a driver.
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;

use crate::codec::{ReplyParser, Template};
use crate::session::SessionOptions;
use crate::Error;
use labinstr_protocol::FieldFormat;

/// Arguments every quantity template may refer to.
pub const TEMPLATE_ARGS: &[&str] = &["raw", "value", "scaled", "channel"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Line-based instruments with independent static setpoints.
    Scpi,
    /// NovaTech DDS boxes.
    NovatechDds,
    /// Oscilloscopes that acquire traces during a shot.
    Scope,
}

fn default_driver() -> DriverKind {
    DriverKind::Scpi
}

fn default_termination() -> String {
    "\n".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_connection_timeout_ms() -> u64 {
    3000
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityCheck {
    #[serde(default = "default_identity_query")]
    pub query: String,
    /// Every entry must appear in the reply.
    pub contains: Vec<String>,
}

fn default_identity_query() -> String {
    "*IDN?".to_string()
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionProfile {
    #[serde(default = "default_termination")]
    pub write_termination: String,
    #[serde(default = "default_termination")]
    pub read_termination: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Drain a greeting banner after connecting, waiting this long per read.
    #[serde(default)]
    pub opening_message_wait_ms: Option<u64>,
    #[serde(default)]
    pub identity: Option<IdentityCheck>,
    /// Commands written once after connecting.
    #[serde(default)]
    pub setup: Vec<String>,
    /// Clears the status registers. A device clear is sent if not given.
    #[serde(default)]
    pub clear_command: Option<String>,
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self {
            write_termination: default_termination(),
            read_termination: default_termination(),
            timeout_ms: default_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            opening_message_wait_ms: None,
            identity: None,
            setup: Vec::new(),
            clear_command: None,
        }
    }
}

impl ConnectionProfile {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            write_termination: self.write_termination.clone(),
            read_termination: self.read_termination.as_bytes().first().copied().unwrap_or(b'\n'),
            timeout: Duration::from_millis(self.timeout_ms),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
        }
    }

    fn validate(&self) -> crate::Result<()> {
        let term = self.read_termination.as_bytes();
        if term.len() != 1 || !term[0].is_ascii() {
            return Err(Error::argument(anyhow!(
                "Read termination must be a single ASCII character, got {:?}",
                self.read_termination
            )));
        }
        if self.timeout_ms == 0 {
            return Err(Error::argument(anyhow!("Timeout must be positive")));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Capabilities {
    pub supports_status: bool,
    pub supports_smart_programming: bool,
    pub supports_remote_value_check: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coerce {
    /// Smallest level not below the request.
    Up,
    /// Largest level not above the request.
    Down,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Levels {
    /// In the order the instrument numbers them. Must be monotonic.
    pub values: Vec<f64>,
    pub coerce: Coerce,
}

impl Levels {
    /// Index of the level `x` coerces to. Requests beyond the table clamp to its ends.
    pub fn coerce(&self, x: f64) -> usize {
        let candidates = self.values.iter().enumerate();
        let ret = match self.coerce {
            Coerce::Up => candidates
                .filter(|(_, v)| **v >= x)
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, _)| k),
            Coerce::Down => candidates
                .filter(|(_, v)| **v <= x)
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, _)| k),
        };
        ret.unwrap_or_else(|| {
            let (min, max) = self.extremes();
            if x > self.values[max] {
                max
            } else {
                min
            }
        })
    }

    /// Indices of the smallest and the largest level.
    fn extremes(&self) -> (usize, usize) {
        let first = 0;
        let last = self.values.len() - 1;
        if self.values[first] <= self.values[last] {
            (first, last)
        } else {
            (last, first)
        }
    }

    fn is_monotonic(&self) -> bool {
        let ascending = self.values.windows(2).all(|x| x[0] < x[1]);
        let descending = self.values.windows(2).all(|x| x[0] > x[1]);
        ascending || descending
    }
}

fn default_scale() -> f64 {
    1.0
}

fn default_format() -> FieldFormat {
    FieldFormat::F64
}

/// One programmable quantity such as a frequency or an amplitude.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantityProfile {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    /// raw = physical * scale
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Limits in physical units.
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default = "default_format")]
    pub format: FieldFormat,
    /// Wrap the physical value into [0, wrap) before checking and scaling.
    #[serde(default)]
    pub wrap: Option<f64>,
    /// Discrete settings; the raw value is the index into the table.
    #[serde(default)]
    pub levels: Option<Levels>,
    /// Stored as the "not specified" sentinel when no setpoint is given.
    #[serde(default)]
    pub optional: bool,
    /// `scaled` = physical * command_scale
    #[serde(default = "default_scale")]
    pub command_scale: f64,
    pub write: Template,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub parser: ReplyParser,
    /// Replies at or below this value mean the output is off or faulted.
    #[serde(default)]
    pub off_at_or_below: Option<f64>,
    /// An empty reply is reported with this message.
    #[serde(default)]
    pub empty_reply: Option<String>,
}

impl QuantityProfile {
    pub fn limits(&self) -> (f64, f64) {
        match &self.levels {
            Some(levels) => {
                let (min, max) = levels.extremes();
                (levels.values[min], levels.values[max])
            }
            None => (
                self.min.unwrap_or(f64::NEG_INFINITY),
                self.max.unwrap_or(f64::INFINITY),
            ),
        }
    }

    fn validate(&self) -> crate::Result<()> {
        let invalid = |why: String| Error::argument(anyhow!("Quantity `{}`: {}", self.name, why));
        if self.name.is_empty() {
            return Err(Error::argument(anyhow!("Quantity without a name")));
        }
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(invalid(format!("invalid scale factor {}", self.scale)));
        }
        if !self.command_scale.is_finite() || self.command_scale == 0.0 {
            return Err(invalid(format!("invalid command scale {}", self.command_scale)));
        }
        if let FieldFormat::Str(_) = self.format {
            return Err(invalid("strings cannot be programmed".to_string()));
        }
        match &self.levels {
            Some(levels) => {
                if levels.values.is_empty() {
                    return Err(invalid("empty level table".to_string()));
                }
                if !levels.is_monotonic() {
                    return Err(invalid("levels must be strictly monotonic".to_string()));
                }
                if !self.format.is_integer() {
                    return Err(invalid("level indices need an integer format".to_string()));
                }
            }
            None => {
                let (min, max) = match (self.min, self.max) {
                    (Some(min), Some(max)) => (min, max),
                    _ => return Err(invalid("needs `min` and `max`".to_string())),
                };
                if min.is_nan() || max.is_nan() || min > max {
                    return Err(invalid(format!("invalid limits [{}, {}]", min, max)));
                }
            }
        }
        if let Some(wrap) = self.wrap {
            if !(wrap > 0.0) {
                return Err(invalid(format!("invalid wrap {}", wrap)));
            }
        }
        if self.optional && !(self.format.is_float() || self.format.is_signed()) {
            return Err(invalid("optional quantities need a float or signed format".to_string()));
        }
        self.write.check_placeholders(TEMPLATE_ARGS)
    }
}

/// A read-only value reported alongside the programmable quantities.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementProfile {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    pub query: String,
    #[serde(default)]
    pub parser: ReplyParser,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorQueue {
    /// One query returns everything.
    Single,
    /// `code,"message"` entries until code 0.
    Scpi,
    /// Bare error codes until 0.
    Codes,
}

fn default_register_mask() -> u32 {
    0xff
}

fn default_error_queue() -> ErrorQueue {
    ErrorQueue::Single
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusProfile {
    /// `*STB?` (or a serial poll over GPIB) when not given.
    #[serde(default)]
    pub register_query: Option<String>,
    #[serde(default = "default_register_mask")]
    pub register_mask: u32,
    /// Register bits that indicate an error worth reading out.
    #[serde(default)]
    pub error_mask: u32,
    #[serde(default)]
    pub error_query: Option<String>,
    #[serde(default = "default_error_queue")]
    pub error_queue: ErrorQueue,
    /// A single-query reply ending in this means "no error".
    #[serde(default)]
    pub no_error_suffix: Option<String>,
    /// Queried and logged whenever the register is non-zero.
    #[serde(default)]
    pub detail_query: Option<String>,
    /// Bit 0 first.
    pub labels: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    Synchronous,
    Asynchronous,
}

impl Default for UpdateMode {
    fn default() -> Self {
        UpdateMode::Synchronous
    }
}

/// How a clocked table is laid out for the board.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableOptions {
    pub update_mode: UpdateMode,
    /// Duplicate the first row in synchronous mode too, as needed when the clock reaches
    /// the board through a plain delay line instead of a tristate driver.
    pub synchronous_first_line_repeat: bool,
}

impl TableOptions {
    pub fn repeats_first_row(&self) -> bool {
        self.update_mode == UpdateMode::Asynchronous || self.synchronous_first_line_repeat
    }
}

impl From<UpdateMode> for TableOptions {
    fn from(update_mode: UpdateMode) -> Self {
        Self {
            update_mode,
            synchronous_first_line_repeat: false,
        }
    }
}

fn default_table_rows() -> usize {
    16384 - 2
}

fn default_dds_setup() -> Vec<String> {
    // auto update, single tone mode
    vec!["I a".to_string(), "m 0".to_string()]
}

fn default_readback() -> Vec<ReadbackColumn> {
    ["freq", "phase", "amp"]
        .iter()
        .map(|x| ReadbackColumn {
            name: x.to_string(),
            divisor: 1,
        })
        .collect()
}

fn default_divisor() -> u64 {
    1
}

fn default_readback_trailer_lines() -> usize {
    1
}

/// One hex word of a `QUE` channel line.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadbackColumn {
    pub name: String,
    /// The reported word is the raw value times this.
    #[serde(default = "default_divisor")]
    pub divisor: u64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DdsProfile {
    pub channels: u8,
    /// Channels driven from the table in buffered mode. All others are static.
    #[serde(default)]
    pub table_channels: Vec<u8>,
    #[serde(default = "default_table_rows")]
    pub max_table_rows: usize,
    /// Acknowledged commands sent after echo is turned off.
    #[serde(default = "default_dds_setup")]
    pub setup: Vec<String>,
    #[serde(default = "default_readback")]
    pub readback: Vec<ReadbackColumn>,
    /// Lines `QUE` prints after the channel lines.
    #[serde(default = "default_readback_trailer_lines")]
    pub readback_trailer_lines: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeFlavor {
    Keysight,
    Tektronix,
}

fn default_waveform_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeProfile {
    pub flavor: ScopeFlavor,
    pub analog_channels: u8,
    /// Number of 8-bit digital pods.
    #[serde(default)]
    pub digital_pods: u8,
    #[serde(default)]
    pub counters: bool,
    #[serde(default = "default_waveform_timeout_ms")]
    pub waveform_timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_driver")]
    pub driver: DriverKind,
    #[serde(default)]
    pub connection: ConnectionProfile,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub quantities: Vec<QuantityProfile>,
    #[serde(default)]
    pub measurements: Vec<MeasurementProfile>,
    #[serde(default)]
    pub status: Option<StatusProfile>,
    #[serde(default)]
    pub dds: Option<DdsProfile>,
    #[serde(default)]
    pub scope: Option<ScopeProfile>,
}

impl InstrumentProfile {
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let ret: Self = toml::from_str(content).map_err(|x| Error::argument(anyhow!("Invalid profile: {}", x)))?;
        ret.validate()?;
        Ok(ret)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|x| Error::argument(anyhow!("Cannot read profile `{}`: {}", path.display(), x)))?;
        Self::from_toml(&content)
    }

    pub fn quantity(&self, name: &str) -> Option<&QuantityProfile> {
        self.quantities.iter().find(|x| x.name == name)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |why: &str| Error::argument(anyhow!("Profile `{}`: {}", self.name, why));
        if self.name.is_empty() {
            return Err(Error::argument(anyhow!("Profile without a name")));
        }
        self.connection.validate()?;

        let mut names = HashSet::new();
        for quantity in &self.quantities {
            quantity.validate()?;
            if !names.insert(quantity.name.as_str()) {
                return Err(invalid(&format!("duplicate quantity `{}`", quantity.name)));
            }
        }
        for measurement in &self.measurements {
            if !names.insert(measurement.name.as_str()) {
                return Err(invalid(&format!("duplicate name `{}`", measurement.name)));
            }
            if !measurement.scale.is_finite() || measurement.scale == 0.0 {
                return Err(invalid(&format!("measurement `{}` has an invalid scale", measurement.name)));
            }
        }

        if let Some(status) = &self.status {
            if status.labels.len() != 8 {
                return Err(invalid("status labels need exactly 8 entries"));
            }
            if status.error_mask != 0 && status.error_query.is_none() {
                return Err(invalid("an error mask needs an error query"));
            }
        } else if self.capabilities.supports_status {
            return Err(invalid("status support needs a [status] section"));
        }

        match self.driver {
            DriverKind::Scpi => {}
            DriverKind::NovatechDds => {
                let dds = self.dds.as_ref().ok_or_else(|| invalid("needs a [dds] section"))?;
                if dds.channels == 0 || dds.table_channels.iter().any(|x| *x >= dds.channels) {
                    return Err(invalid("invalid DDS channel configuration"));
                }
                // amplitude control is optional, but table rows always carry one
                let required: &[&str] = if dds.table_channels.is_empty() {
                    &["freq", "phase"]
                } else {
                    &["freq", "amp", "phase"]
                };
                for name in required {
                    if self.quantity(name).is_none() {
                        return Err(invalid(&format!("DDS needs a `{}` quantity", name)));
                    }
                }
                for name in ["freq", "amp", "phase"] {
                    match self.quantity(name) {
                        Some(quantity) if !quantity.format.is_integer() => {
                            return Err(invalid(&format!("DDS quantity `{}` must be an integer", name)));
                        }
                        _ => {}
                    }
                }
                for column in &dds.readback {
                    if self.quantity(&column.name).is_none() || column.divisor == 0 {
                        return Err(invalid(&format!("invalid readback column `{}`", column.name)));
                    }
                }
            }
            DriverKind::Scope => {
                let scope = self.scope.as_ref().ok_or_else(|| invalid("needs a [scope] section"))?;
                if scope.analog_channels == 0 || scope.digital_pods > 2 {
                    return Err(invalid("invalid scope channel configuration"));
                }
            }
        }
        Ok(())
    }
}
