/// This module implements some base types and functions to interact with SCPI-based instruments
use anyhow::anyhow;

use crate::Error;
use labinstr_protocol::ProtocolError;

const DEFAULT_LENGTH_BEFORE_BLOCK: usize = 25;

fn invalid_header() -> Error {
    Error::Protocol(ProtocolError::InvalidBinaryHeader)
}

/// Parse an IEEE 488.2 definite-length block header in a complete reply.
/// Returns the offset of the payload and its length.
pub fn parse_binary_header(rx: &[u8]) -> crate::Result<(usize, usize)> {
    let begin = rx.iter().position(|x| *x == b'#').ok_or_else(invalid_header)?;
    if begin > DEFAULT_LENGTH_BEFORE_BLOCK {
        return Err(invalid_header());
    }
    if rx.len() < begin + 2 {
        return Err(invalid_header());
    }
    let header_length = parse_digit_count(rx[begin + 1])?;
    let offset = begin + 2 + header_length;
    if offset > rx.len() {
        return Err(invalid_header());
    }
    let data_length = parse_length_field(&rx[begin + 2..offset])?;
    if offset + data_length > rx.len() {
        Err(invalid_header())
    } else {
        Ok((offset, data_length))
    }
}

/// The single digit following `#`. Indefinite-length blocks (`#0`) are not supported.
pub fn parse_digit_count(x: u8) -> crate::Result<usize> {
    match x {
        b'1'..=b'9' => Ok((x - b'0') as usize),
        _ => Err(invalid_header()),
    }
}

pub fn parse_length_field(x: &[u8]) -> crate::Result<usize> {
    std::str::from_utf8(x)
        .map_err(|_| invalid_header())?
        .parse::<usize>()
        .map_err(|_| invalid_header())
}

/// Parses a separated list of numbers such as "1.0e-3;12;45.2".
pub fn parse_values(reply: &str, sep: char) -> crate::Result<Vec<f64>> {
    reply
        .trim()
        .split(sep)
        .map(|x| {
            x.trim()
                .parse::<f64>()
                .map_err(|_| Error::unexpected_response(reply.to_string()))
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorEntry {
    pub code: i32,
    pub message: String,
}

impl ErrorEntry {
    pub fn is_error(&self) -> bool {
        self.code != 0
    }
}

/// Parses an error queue entry of the form `-113,"Undefined header"`.
/// Instruments that only report a number are accepted as well.
pub fn parse_error_entry(reply: &str) -> crate::Result<ErrorEntry> {
    let reply = reply.trim();
    let (code, message) = match reply.split_once(',') {
        Some((code, message)) => (code, message.trim().trim_matches('"').to_string()),
        None => (reply, String::new()),
    };
    let code = code
        .trim()
        .parse::<i32>()
        .map_err(|_| Error::unexpected_response(reply.to_string()))?;
    Ok(ErrorEntry { code, message })
}

/// The waveform preamble as returned by `:WAVeform:PREamble?` on Keysight scopes.
#[derive(Clone, Debug, PartialEq)]
pub struct WaveformPreamble {
    pub format: u32,
    pub kind: u32,
    pub points: usize,
    pub count: u32,
    pub x_increment: f64,
    pub x_origin: f64,
    pub x_reference: f64,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
}

impl WaveformPreamble {
    pub fn parse(reply: &str) -> crate::Result<Self> {
        let values = parse_values(reply, ',')?;
        if values.len() != 10 {
            return Err(Error::protocol(anyhow!(
                "Expected 10 preamble values, got {}: `{}`",
                values.len(),
                reply
            )));
        }
        Ok(Self {
            format: values[0] as u32,
            kind: values[1] as u32,
            points: values[2] as usize,
            count: values[3] as u32,
            x_increment: values[4],
            x_origin: values[5],
            x_reference: values[6],
            y_increment: values[7],
            y_origin: values[8],
            y_reference: values[9],
        })
    }

    pub fn time_axis(&self) -> Vec<f64> {
        (0..self.points)
            .map(|k| (self.x_reference + k as f64) * self.x_increment + self.x_origin)
            .collect()
    }

    pub fn scale(&self, raw: f64) -> f64 {
        (raw - self.y_reference) * self.y_increment + self.y_origin
    }
}
