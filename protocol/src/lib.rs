//! Data shared between the shot compiler and the run-time workers: the error taxonomy,
//! fixed-layout binary tables and the persisted shot description.

pub mod error;
pub mod shot;
pub mod table;
mod util;

pub use crate::error::{DeviceError, Error, ProtocolError, RangeError, TransportError};
pub use crate::shot::{AttrValue, Attributes, DataGroup, Dataset, DeviceGroup, ShotFile};
pub use crate::table::{Dtype, Field, FieldFormat, Table, Value};

pub type Result<T> = std::result::Result<T, Error>;
