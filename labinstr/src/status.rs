/// Status register decoding and error-queue readout.
use bitvec::prelude::*;
use serde::Serialize;

use crate::profile::{ErrorQueue, StatusProfile};
use crate::scpi::{parse_error_entry, ErrorEntry};
use crate::session::Session;
use crate::Error;

/// Error queues hold at most a few dozen entries; stop reading after this many.
const MAX_QUEUE_ENTRIES: usize = 64;

/// The eight bits of a status register. Index 0 is the least significant bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StatusBits(pub [bool; 8]);

impl StatusBits {
    /// `None` past bit 7.
    pub fn bit(&self, idx: usize) -> Option<bool> {
        self.0.get(idx).copied()
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|x| *x)
    }
}

pub fn decode(register: u8) -> StatusBits {
    let bits = register.view_bits::<Lsb0>();
    let mut ret = [false; 8];
    for (k, x) in ret.iter_mut().enumerate() {
        *x = bits[k];
    }
    StatusBits(ret)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusFlag {
    pub bit: usize,
    pub label: String,
    pub set: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusReport {
    pub register: u8,
    pub flags: Vec<StatusFlag>,
}

impl StatusReport {
    /// `labels` are given bit 0 first. Missing labels show up as "unused".
    pub fn new(register: u8, labels: &[String]) -> Self {
        let flags = decode(register)
            .0
            .iter()
            .enumerate()
            .map(|(bit, set)| StatusFlag {
                bit,
                label: labels.get(bit).cloned().unwrap_or_else(|| "unused".to_string()),
                set: *set,
            })
            .collect();
        Self { register, flags }
    }

    pub fn is_set(&self, label: &str) -> bool {
        self.flags.iter().any(|x| x.label == label && x.set)
    }
}

fn parse_register(reply: &str) -> crate::Result<u32> {
    let value = reply
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::unexpected_response(reply.to_string()))?;
    if value < 0.0 || value > u32::MAX as f64 || value.fract() != 0.0 {
        return Err(Error::unexpected_response(reply.to_string()));
    }
    Ok(value as u32)
}

/// Queries and decodes the status register. If any error bit is set, the error queue is read
/// out and reported as a `DeviceError`.
pub async fn check_status(session: &mut Session, status: &StatusProfile, device: &str) -> crate::Result<StatusReport> {
    let register = match &status.register_query {
        Some(query) => parse_register(&session.query(query).await?)?,
        None => session.read_stb().await? as u32,
    };
    let register = register & status.register_mask;
    if register != 0 {
        if let Some(detail) = &status.detail_query {
            let reply = session.query(detail).await?;
            log::warn!("{}: status register is {:#04x}, {} returned `{}`", device, register, detail, reply);
        }
    }
    if register & status.error_mask != 0 {
        if let Some(query) = &status.error_query {
            read_error_queue(session, status, query, device).await?;
        }
    }
    Ok(StatusReport::new((register & 0xff) as u8, &status.labels))
}

async fn read_error_queue(
    session: &mut Session,
    status: &StatusProfile,
    query: &str,
    device: &str,
) -> crate::Result<()> {
    match status.error_queue {
        ErrorQueue::Single => {
            let reply = session.query(query).await?;
            if let Some(suffix) = &status.no_error_suffix {
                if reply.ends_with(suffix.as_str()) {
                    return Ok(());
                }
            }
            if let Ok(ErrorEntry { code: 0, .. }) = parse_error_entry(&reply) {
                return Ok(());
            }
            Err(Error::device(device, reply))
        }
        ErrorQueue::Scpi | ErrorQueue::Codes => {
            let mut entries = Vec::new();
            for _ in 0..MAX_QUEUE_ENTRIES {
                let entry = parse_error_entry(&session.query(query).await?)?;
                if !entry.is_error() {
                    break;
                }
                entries.push(entry);
            }
            if entries.is_empty() {
                return Ok(());
            }
            let message = match status.error_queue {
                ErrorQueue::Codes => {
                    let codes: Vec<_> = entries.iter().map(|x| x.code.to_string()).collect();
                    format!("error codes {}", codes.join(", "))
                }
                _ => {
                    let lines: Vec<_> = entries.iter().map(|x| format!("{},\"{}\"", x.code, x.message)).collect();
                    lines.join("\n")
                }
            };
            Err(Error::device(device, message))
        }
    }
}
