use std::io;

use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::Error;

pub async fn connect_tcp_stream(host: &str, port: u16, connection_timeout: Duration) -> crate::Result<TcpStream> {
    let fut = async move { TcpStream::connect((host, port)).await.map_err(Error::transport) };
    let stream = match timeout(connection_timeout, fut).await {
        Ok(Ok(x)) => x,
        Ok(Err(x)) => return Err(x),
        Err(_) => {
            return Err(crate::Error::transport(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Connection to {}:{} timed out", host, port),
            )))
        }
    };
    if let Err(x) = stream.set_nodelay(true) {
        log::warn!("Cannot set TCP_NODELAY on {}:{}: {}", host, port, x);
    }
    Ok(stream)
}
