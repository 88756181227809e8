/// Connection strings. Besides the native `tcp::`, `serial::` and `prologix::` forms, the
/// VISA resource names and "COM3,19200" strings found in existing connection tables are
/// accepted and mapped onto the same three links.
use std::fmt::{self, Display, Formatter};

use anyhow::anyhow;

use crate::transport::serial::SerialParams;
use crate::Error;

const TELNET_PORT: u16 = 23;
const VISA_SERIAL_BAUD: u32 = 9600;
const MAX_GPIB_ADDR: u8 = 30;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Serial { path: String, params: SerialParams },
    Prologix { file: String, gpib_addr: u8 },
}

fn invalid(addr: &str) -> Error {
    Error::argument(anyhow!("Invalid Address: `{}`", addr))
}

fn host_port(x: &str, default_port: Option<u16>) -> Option<(String, u16)> {
    match x.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None => Some((x.to_string(), default_port?)),
    }
}

/// `ASRL3` is `COM3`, `ASRL/dev/ttyS0` is the path itself.
fn visa_serial_path(resource: &str) -> Option<String> {
    let port = resource.get(4..).filter(|x| !x.is_empty())?;
    if port.bytes().all(|x| x.is_ascii_digit()) {
        Some(format!("COM{}", port))
    } else {
        Some(port.to_string())
    }
}

impl Address {
    pub fn parse(addr: &str) -> crate::Result<Self> {
        let addr = addr.trim();
        let parts: Vec<&str> = addr.split("::").collect();
        let kind = parts[0].to_lowercase();
        let ret = match (kind.as_str(), &parts[1..]) {
            ("", _) => None,
            ("tcp", [target]) => host_port(target, None).map(|(host, port)| Address::Tcp { host, port }),
            ("serial", [path, baud, framing]) => Some(Address::Serial {
                path: path.to_string(),
                params: SerialParams::parse(baud, framing)?,
            }),
            ("prologix", [file, gpib]) => gpib
                .parse::<u8>()
                .ok()
                .filter(|x| *x <= MAX_GPIB_ADDR)
                .map(|gpib_addr| Address::Prologix {
                    file: file.to_string(),
                    gpib_addr,
                }),
            (visa, [host, port, socket]) if visa.starts_with("tcpip") && socket.eq_ignore_ascii_case("socket") => {
                port.parse().ok().map(|port| Address::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            (visa, [instr]) if visa.starts_with("asrl") && instr.eq_ignore_ascii_case("instr") => {
                visa_serial_path(parts[0]).map(|path| Address::Serial {
                    path,
                    params: SerialParams::with_baud(VISA_SERIAL_BAUD),
                })
            }
            (_, []) => match addr.split_once(',') {
                Some((path, baud)) => Some(Address::Serial {
                    path: path.trim().to_string(),
                    params: SerialParams::with_baud(baud.trim().parse().map_err(|_| invalid(addr))?),
                }),
                None => host_port(addr, Some(TELNET_PORT)).map(|(host, port)| Address::Tcp { host, port }),
            },
            _ => None,
        };
        ret.ok_or_else(|| invalid(addr))
    }

    /// The exclusive hardware resource behind this address. A Prologix controller is one
    /// serial link, whatever GPIB address it talks to.
    pub fn handle_id(&self) -> HandleId {
        let id = match self {
            Address::Tcp { host, port } => format!("{}:{}", host.to_lowercase(), port),
            Address::Serial { path, .. } => path.clone(),
            Address::Prologix { file, .. } => file.clone(),
        };
        HandleId(id)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "tcp::{}:{}", host, port),
            Address::Serial { path, params } => write!(f, "serial::{}::{}", path, params),
            Address::Prologix { file, gpib_addr } => write!(f, "prologix::{}::{}", file, gpib_addr),
        }
    }
}

#[derive(Hash, Clone, PartialEq, Eq, Debug)]
pub struct HandleId(String);

impl Display for HandleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
