/// This module implements the framing for the Prologix USB to GPIB controller.
/// http://prologix.biz/gpib-usb-controller.html
///
/// The controller is configured once per session; afterwards every exchange selects the
/// GPIB address first and explicitly asks for the reply after a query.
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::Error;

pub async fn init_prologix<T: AsyncWrite + Unpin>(serial: &mut T) -> crate::Result<()> {
    log::debug!("Initializing prologix.");
    write(serial, "++savecfg 0\n").await?;
    write(serial, "++auto 0\n").await?;
    // we manually append termination chars
    write(serial, "++eos 3\n").await
}

pub async fn select_address<T: AsyncWrite + Unpin>(serial: &mut T, gpib_addr: u8) -> crate::Result<()> {
    write(serial, &format!("++addr {}\n", gpib_addr)).await
}

pub async fn request_reply<T: AsyncWrite + Unpin>(serial: &mut T) -> crate::Result<()> {
    write(serial, "++read eoi\n").await
}

/// The controller answers with the status byte as a decimal number.
pub async fn serial_poll<T: AsyncWrite + Unpin>(serial: &mut T) -> crate::Result<()> {
    write(serial, "++spoll\n").await
}

pub async fn device_clear<T: AsyncWrite + Unpin>(serial: &mut T) -> crate::Result<()> {
    write(serial, "++clr\n").await
}

async fn write<T: AsyncWrite + Unpin>(serial: &mut T, msg: &str) -> crate::Result<()> {
    serial.write_all(msg.as_bytes()).await.map_err(Error::transport)
}
