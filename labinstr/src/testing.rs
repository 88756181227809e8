//! In-process stand-ins for instruments.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::session::SessionOptions;

#[derive(Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Number of received commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|x| x.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear()
    }

    fn push(&self, cmd: String) {
        self.0.lock().unwrap().push(cmd)
    }
}

/// Spawns a fake instrument that records every received line and answers with whatever
/// `respond` returns for it.
pub fn fake_instrument<F>(mut respond: F) -> (DuplexStream, CommandLog)
where
    F: FnMut(&str) -> Option<Vec<u8>> + Send + 'static,
{
    let (ours, theirs) = tokio::io::duplex(1 << 16);
    let log = CommandLog::default();
    let task_log = log.clone();
    tokio::spawn(async move {
        let (rx, mut tx) = tokio::io::split(theirs);
        let mut lines = BufReader::new(rx).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end_matches('\r').to_string();
            task_log.push(line.clone());
            if let Some(reply) = respond(&line) {
                if tx.write_all(&reply).await.is_err() {
                    break;
                }
            }
        }
    });
    (ours, log)
}

pub fn options() -> SessionOptions {
    SessionOptions {
        timeout: Duration::from_millis(200),
        ..Default::default()
    }
}
