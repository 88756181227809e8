/// Opening byte-stream links to instruments. Whatever the physical link, the rest of the
/// crate only sees a `DynStream`.
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::address::Address;

pub mod serial;
pub mod tcp;

pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub type DynStream = Box<dyn ByteStream>;

/// Opens the link described by `addr`. Failure to connect within `connection_timeout`
/// is reported as a transport error.
pub async fn open(addr: &Address, connection_timeout: Duration) -> crate::Result<DynStream> {
    log::debug!("Opening {}", addr);
    match addr {
        Address::Tcp { host, port } => {
            let stream = tcp::connect_tcp_stream(host, *port, connection_timeout).await?;
            Ok(Box::new(stream))
        }
        Address::Serial { path, params } => {
            let stream = serial::open_serial_port(path, params)?;
            Ok(Box::new(stream))
        }
        Address::Prologix { file, .. } => {
            let stream = serial::open_serial_port(file, &serial::prologix_params())?;
            Ok(Box::new(stream))
        }
    }
}
