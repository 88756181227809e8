use std::fmt::{self, Display, Formatter};

use anyhow::anyhow;

use crate::Error;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum StopBits {
    One,
    Two,
}

/// Line settings of a serial port. Written as `<baud>::<framing>` in addresses, where the
/// framing is data bits, parity and stop bits, e.g. `19200::8N1`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct SerialParams {
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl SerialParams {
    /// 8N1 at the given baud rate.
    pub fn with_baud(baud: u32) -> Self {
        Self {
            baud,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }

    /// Parses `baud` and a framing such as `8N1` or `7e2`.
    pub fn parse(baud: &str, framing: &str) -> crate::Result<Self> {
        let baud = baud
            .trim()
            .parse()
            .map_err(|_| Error::argument(anyhow!("Invalid baud rate: `{}`", baud)))?;
        let invalid = || Error::argument(anyhow!("Invalid serial framing: `{}`", framing));
        let framing_upper = framing.to_uppercase();
        let (data_bits, parity, stop_bits) = match framing_upper.as_bytes() {
            [d, p, s] => (*d, *p, *s),
            _ => return Err(invalid()),
        };
        Ok(Self {
            baud,
            data_bits: match data_bits {
                b'7' => DataBits::Seven,
                b'8' => DataBits::Eight,
                _ => return Err(invalid()),
            },
            parity: match parity {
                b'N' => Parity::None,
                b'O' => Parity::Odd,
                b'E' => Parity::Even,
                _ => return Err(invalid()),
            },
            stop_bits: match stop_bits {
                b'1' => StopBits::One,
                b'2' => StopBits::Two,
                _ => return Err(invalid()),
            },
        })
    }

    pub fn framing(&self) -> String {
        let data_bits = match self.data_bits {
            DataBits::Seven => '7',
            DataBits::Eight => '8',
        };
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        let stop_bits = match self.stop_bits {
            StopBits::One => '1',
            StopBits::Two => '2',
        };
        [data_bits, parity, stop_bits].iter().collect()
    }
}

impl Display for SerialParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.baud, self.framing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing() {
        let params = SerialParams::parse("9600", "7o2").unwrap();
        assert_eq!(params.data_bits, DataBits::Seven);
        assert_eq!(params.parity, Parity::Odd);
        assert_eq!(params.stop_bits, StopBits::Two);
        assert_eq!(params.to_string(), "9600::7O2");
        assert!(SerialParams::parse("9600", "8N").is_err());
        assert!(SerialParams::parse("fast", "8N1").is_err());
    }

    #[test]
    fn display() {
        assert_eq!(SerialParams::with_baud(19200).to_string(), "19200::8N1");
    }
}
