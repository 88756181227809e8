/// A `Session` is the one open link to an instrument. It owns the byte stream and knows the
/// line framing the instrument expects, so drivers only deal in commands and replies.
use std::time::Duration;

use anyhow::anyhow;
use tokio::io::AsyncWriteExt;

use crate::address::Address;
use crate::bytestream::{check_term, read_all, read_chunk_timeout, read_exact_timeout, read_to_term_timeout};
use crate::transport::{self, ByteStream, DynStream};
use crate::{prologix, scpi, Error};

/// Number of consecutive empty reads after which an opening banner is considered complete.
const EMPTY_READS_AFTER_BANNER: usize = 3;
const MAX_BYTES_BEFORE_BLOCK: usize = 25;

#[derive(Clone, Debug, PartialEq)]
pub struct SessionOptions {
    pub write_termination: String,
    pub read_termination: u8,
    pub timeout: Duration,
    pub connection_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            write_termination: "\n".to_string(),
            read_termination: b'\n',
            timeout: Duration::from_secs(2),
            connection_timeout: Duration::from_secs(3),
        }
    }
}

enum Framing {
    Plain,
    Prologix { gpib_addr: u8, initialized: bool },
}

pub struct Session {
    stream: Option<DynStream>,
    framing: Framing,
    options: SessionOptions,
    name: String,
}

impl Session {
    pub async fn open(addr: &Address, options: SessionOptions) -> crate::Result<Self> {
        check_term(options.read_termination)?;
        let stream = transport::open(addr, options.connection_timeout).await?;
        let framing = match addr {
            Address::Prologix { gpib_addr, .. } => Framing::Prologix {
                gpib_addr: *gpib_addr,
                initialized: false,
            },
            _ => Framing::Plain,
        };
        log::info!("Opened session to {}", addr);
        Ok(Self {
            stream: Some(stream),
            framing,
            options,
            name: addr.to_string(),
        })
    }

    /// Wraps an already open stream. Used for in-process instruments.
    pub fn from_stream<S: ByteStream + 'static>(stream: S, options: SessionOptions) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            framing: Framing::Plain,
            options,
            name: "stream".to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.options.timeout = timeout;
    }

    fn stream(&mut self) -> crate::Result<&mut DynStream> {
        self.stream.as_mut().ok_or_else(Error::closed)
    }

    async fn prepare_gpib(&mut self) -> crate::Result<()> {
        let gpib_addr = match &mut self.framing {
            Framing::Plain => return Ok(()),
            Framing::Prologix { gpib_addr, initialized } => {
                let gpib_addr = *gpib_addr;
                let needs_init = !*initialized;
                *initialized = true;
                if needs_init {
                    let stream = self.stream.as_mut().ok_or_else(Error::closed)?;
                    prologix::init_prologix(stream).await?;
                }
                gpib_addr
            }
        };
        prologix::select_address(self.stream()?, gpib_addr).await
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> crate::Result<()> {
        let stream = self.stream()?;
        stream.write_all(data).await.map_err(Error::transport)?;
        stream.flush().await.map_err(Error::transport)
    }

    /// Writes a command, appending the write terminator unless already present.
    pub async fn write(&mut self, cmd: &str) -> crate::Result<()> {
        log::debug!("{} <- {:?}", self.name, cmd);
        self.prepare_gpib().await?;
        let mut msg = cmd.to_string();
        if !msg.ends_with(&self.options.write_termination) {
            msg.push_str(&self.options.write_termination);
        }
        self.write_raw(msg.as_bytes()).await
    }

    /// Returns the first non-empty chunk arriving within `timeout`.
    pub async fn read_response(&mut self, timeout: Duration) -> crate::Result<Vec<u8>> {
        let ret = read_chunk_timeout(self.stream()?, timeout).await?;
        log::debug!("{} -> {:?}", self.name, String::from_utf8_lossy(&ret));
        Ok(ret)
    }

    /// Reads one line, without the terminator and without a trailing carriage return.
    pub async fn read_line(&mut self) -> crate::Result<String> {
        let term = self.options.read_termination;
        let timeout = self.options.timeout;
        let data = read_to_term_timeout(self.stream()?, term, timeout).await?;
        let mut ret = String::from_utf8(data).map_err(|_| Error::protocol(anyhow!("Cannot decode reply as UTF-8")))?;
        if ret.ends_with('\r') {
            ret.pop();
        }
        log::debug!("{} -> {:?}", self.name, ret);
        Ok(ret)
    }

    /// Discards whatever the instrument sent unsolicited.
    pub async fn drain(&mut self) -> crate::Result<Vec<u8>> {
        let ret = read_all(self.stream()?).await.map_err(Error::transport)?;
        if !ret.is_empty() {
            log::debug!("{} discarded {:?}", self.name, String::from_utf8_lossy(&ret));
        }
        Ok(ret)
    }

    async fn send_query(&mut self, cmd: &str) -> crate::Result<()> {
        self.drain().await?;
        self.write(cmd).await?;
        if let Framing::Prologix { .. } = self.framing {
            prologix::request_reply(self.stream()?).await?;
        }
        Ok(())
    }

    pub async fn query(&mut self, cmd: &str) -> crate::Result<String> {
        self.send_query(cmd).await?;
        let ret = self.read_line().await?;
        Ok(ret.trim().to_string())
    }

    /// Queries a separated list of numbers.
    pub async fn query_values(&mut self, cmd: &str, sep: char) -> crate::Result<Vec<f64>> {
        let reply = self.query(cmd).await?;
        scpi::parse_values(&reply, sep)
    }

    /// Queries an IEEE 488.2 definite-length binary block and returns its payload.
    pub async fn query_binary(&mut self, cmd: &str) -> crate::Result<Vec<u8>> {
        self.send_query(cmd).await?;
        self.read_binary_block(None).await
    }

    /// Like `query_binary` but checks that the block has the announced size.
    pub async fn query_binary_sized(&mut self, cmd: &str, expected: usize) -> crate::Result<Vec<u8>> {
        self.send_query(cmd).await?;
        self.read_binary_block(Some(expected)).await
    }

    async fn read_binary_block(&mut self, expected: Option<usize>) -> crate::Result<Vec<u8>> {
        let timeout = self.options.timeout;
        let term = self.options.read_termination;
        let stream = self.stream()?;
        let mut skipped = 0;
        loop {
            let x = read_exact_timeout(stream, 1, timeout).await?;
            if x[0] == b'#' {
                break;
            }
            skipped += 1;
            if skipped > MAX_BYTES_BEFORE_BLOCK {
                return Err(Error::Protocol(labinstr_protocol::ProtocolError::InvalidBinaryHeader));
            }
        }
        let digits = read_exact_timeout(stream, 1, timeout).await?;
        let digits = scpi::parse_digit_count(digits[0])?;
        let length = read_exact_timeout(stream, digits, timeout).await?;
        let length = scpi::parse_length_field(&length)?;
        if let Some(expected) = expected {
            if expected != length {
                return Err(Error::protocol(anyhow!(
                    "Binary block announced {} bytes, expected {}",
                    length,
                    expected
                )));
            }
        }
        let data = read_exact_timeout(stream, length, timeout).await?;
        let trailer = read_exact_timeout(stream, 1, timeout).await?;
        if trailer[0] != term {
            return Err(Error::unexpected_response(format!(
                "Expected terminator after binary block, got {:#x}",
                trailer[0]
            )));
        }
        log::debug!("{} -> binary block of {} bytes", self.name, data.len());
        Ok(data)
    }

    /// Reads and discards a greeting banner, returning the number of bytes skipped.
    /// The banner is complete once `wait` expires three times in a row without new data.
    pub async fn skip_opening_message(&mut self, wait: Duration) -> crate::Result<usize> {
        let mut empty_reads = 0;
        let mut skipped = 0;
        while empty_reads < EMPTY_READS_AFTER_BANNER {
            match read_chunk_timeout(self.stream()?, wait).await {
                Ok(data) => {
                    empty_reads = 0;
                    skipped += data.len();
                    log::debug!("{} banner: {:?}", self.name, String::from_utf8_lossy(&data));
                }
                Err(Error::Timeout) => empty_reads += 1,
                Err(x) => return Err(x),
            }
        }
        Ok(skipped)
    }

    /// Reads the status byte. Over GPIB a serial poll is used, elsewhere `*STB?`.
    pub async fn read_stb(&mut self) -> crate::Result<u8> {
        let reply = match self.framing {
            Framing::Prologix { .. } => {
                self.prepare_gpib().await?;
                self.drain().await?;
                prologix::serial_poll(self.stream()?).await?;
                self.read_line().await?
            }
            Framing::Plain => self.query("*STB?").await?,
        };
        let value = reply
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::unexpected_response(reply.clone()))?;
        if !(0.0..=255.0).contains(&value) {
            return Err(Error::unexpected_response(reply));
        }
        Ok(value as u8)
    }

    /// Sends a device clear. Over GPIB this is the bus command, elsewhere `*CLS`.
    pub async fn clear(&mut self) -> crate::Result<()> {
        if let Framing::Prologix { .. } = self.framing {
            self.prepare_gpib().await?;
            return prologix::device_clear(self.stream()?).await;
        }
        self.write("*CLS").await
    }

    /// Closes the link. Closing an already closed session does nothing.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(x) = stream.shutdown().await {
                log::warn!("Error while closing {}: {}", self.name, x);
            }
            log::info!("Closed session to {}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_instrument, options};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn query_strips_terminators() {
        let (stream, log) = fake_instrument(|cmd| match cmd {
            "FREQ?" => Some(b"1.000000000E+09\r\n".to_vec()),
            _ => None,
        });
        let mut session = Session::from_stream(stream, options());
        let reply = session.query("FREQ?").await.unwrap();
        assert_eq!(reply, "1.000000000E+09");
        assert_eq!(log.commands(), vec!["FREQ?"]);
    }

    #[tokio::test]
    async fn unanswered_query_times_out() {
        let (stream, _log) = fake_instrument(|_| None);
        let mut session = Session::from_stream(stream, options());
        let ret = session.query("*IDN?").await;
        assert!(matches!(ret, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn query_values_with_separator() {
        let (stream, _log) = fake_instrument(|_| Some(b"5;21;12.5\n".to_vec()));
        let mut session = Session::from_stream(stream, options());
        let ret = session.query_values("OFLT?;SCAL?;PHAS?", ';').await.unwrap();
        assert_eq!(ret, vec![5.0, 21.0, 12.5]);
    }

    #[tokio::test]
    async fn binary_block() {
        let (stream, _log) = fake_instrument(|_| Some(b"#14\x01\x02\x03\x04\n".to_vec()));
        let mut session = Session::from_stream(stream, options());
        let data = session.query_binary(":WAV:DATA?").await.unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
        let ret = session.query_binary_sized(":WAV:DATA?", 6).await;
        assert!(matches!(ret, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn skips_banner() {
        let (a, mut b) = tokio::io::duplex(256);
        b.write_all(b"Welcome to the wavemeter\r\n\r\n").await.unwrap();
        let mut session = Session::from_stream(a, options());
        let skipped = session.skip_opening_message(Duration::from_millis(20)).await.unwrap();
        assert_eq!(skipped, 28);
    }

    #[tokio::test]
    async fn status_byte() {
        let (stream, _log) = fake_instrument(|cmd| match cmd {
            "*STB?" => Some(b"+68\r\n".to_vec()),
            _ => None,
        });
        let mut session = Session::from_stream(stream, options());
        assert_eq!(session.read_stb().await.unwrap(), 68);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (stream, _log) = fake_instrument(|_| None);
        let mut session = Session::from_stream(stream, options());
        session.close().await;
        session.close().await;
        assert!(!session.is_open());
        let ret = session.write("*CLS").await;
        assert!(matches!(ret, Err(Error::Transport(_))));
    }
}
