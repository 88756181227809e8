use anyhow::anyhow;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

pub use params::{DataBits, Parity, SerialParams, StopBits};

pub mod params;

/// Prologix controllers ignore the line settings, but the port still needs some.
pub fn prologix_params() -> SerialParams {
    SerialParams::with_baud(9600)
}

pub fn open_serial_port(path: &str, params: &SerialParams) -> crate::Result<SerialStream> {
    log::debug!("Opening serial port {} with {}", path, params);
    let data_bits = match params.data_bits {
        DataBits::Seven => tokio_serial::DataBits::Seven,
        DataBits::Eight => tokio_serial::DataBits::Eight,
    };
    let parity = match params.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    let stop_bits = match params.stop_bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    };
    tokio_serial::new(path, params.baud)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|x| crate::Error::transport(anyhow!("Cannot open {}: {}", path, x)))
}
