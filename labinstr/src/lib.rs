//! Lab instrument plugins: compile shot descriptions into fixed-layout tables and drive
//! signal generators, DDS boards, lock-in amplifiers, wavemeters and scopes from them.

pub mod address;
pub mod builtin;
pub mod bytestream;
pub mod cache;
pub mod codec;
pub mod compiler;
pub mod config;
pub mod driver;
pub mod inventory;
pub mod iotask;
pub mod profile;
pub mod prologix;
pub mod scpi;
pub mod session;
pub mod status;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use labinstr_protocol::{Error, ProtocolError, RangeError, TransportError};

pub type Result<T> = std::result::Result<T, Error>;
