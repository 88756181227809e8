/// Low-level helpers on top of async byte streams. All reads accept a timeout and report
/// an expired timeout as `Error::Timeout`.
use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::time;

use crate::Error;

/// Returns whatever is buffered right now without waiting for more. Stops early at the end
/// of the stream.
pub async fn read_all<T: AsyncRead + Unpin>(stream: &mut T) -> io::Result<Vec<u8>> {
    let mut ret = Vec::new();
    let mut chunk = [0_u8; 1024];
    poll_fn(|cx| loop {
        let mut buf = ReadBuf::new(&mut chunk);
        match Pin::new(&mut *stream).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) if buf.filled().is_empty() => return Poll::Ready(Ok(())),
            Poll::Ready(Ok(())) => ret.extend_from_slice(buf.filled()),
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Ready(Ok(())),
        }
    })
    .await?;
    Ok(ret)
}

async fn with_timeout<F, R>(timeout: Duration, fut: F) -> crate::Result<R>
where
    F: Future<Output = crate::Result<R>>,
{
    time::timeout(timeout, fut).await.unwrap_or_else(|_| Err(Error::timeout()))
}

/// Reads up to (and consumes, but does not return) `term`.
pub async fn read_to_term_timeout<T: AsyncRead + Unpin>(
    stream: &mut T,
    term: u8,
    timeout: Duration,
) -> crate::Result<Vec<u8>> {
    let mut line = Vec::new();
    with_timeout(timeout, async {
        loop {
            match stream.read_u8().await.map_err(Error::transport)? {
                x if x == term => return Ok(()),
                x => line.push(x),
            }
        }
    })
    .await?;
    Ok(line)
}

pub async fn read_exact_timeout<T: AsyncRead + Unpin>(
    stream: &mut T,
    count: usize,
    timeout: Duration,
) -> crate::Result<Vec<u8>> {
    let mut data = vec![0; count];
    with_timeout(timeout, async {
        stream.read_exact(&mut data).await.map_err(Error::transport)?;
        Ok(())
    })
    .await?;
    Ok(data)
}

/// Waits for the next chunk of data, whatever its size. A closed stream is an error.
pub async fn read_chunk_timeout<T: AsyncRead + Unpin>(stream: &mut T, timeout: Duration) -> crate::Result<Vec<u8>> {
    let mut data = vec![0; 1024];
    let count = with_timeout(timeout, async { stream.read(&mut data).await.map_err(Error::transport) }).await?;
    if count == 0 {
        return Err(Error::transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Connection closed by instrument",
        )));
    }
    data.truncate(count);
    Ok(data)
}

pub fn check_term(term: u8) -> crate::Result<()> {
    if term == 0 || term > 127 {
        Err(Error::argument(anyhow::anyhow!("Invalid termination: {:#x}", term)))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_line_and_leave_rest() {
        let (mut a, mut b) = tokio::io::duplex(64);
        b.write_all(b"1.5\nrest").await.unwrap();
        let line = read_to_term_timeout(&mut a, b'\n', Duration::from_millis(200)).await.unwrap();
        assert_eq!(line, b"1.5");
        let rest = read_all(&mut a).await.unwrap();
        assert_eq!(rest, b"rest");
    }

    #[tokio::test]
    async fn missing_terminator_times_out() {
        let (mut a, mut b) = tokio::io::duplex(64);
        b.write_all(b"no newline").await.unwrap();
        let ret = read_to_term_timeout(&mut a, b'\n', Duration::from_millis(50)).await;
        assert!(matches!(ret, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn read_all_stops_at_eof() {
        let (mut a, mut b) = tokio::io::duplex(64);
        b.write_all(b"bye").await.unwrap();
        drop(b);
        assert_eq!(read_all(&mut a).await.unwrap(), b"bye");
        let ret = read_chunk_timeout(&mut a, Duration::from_millis(50)).await;
        assert!(matches!(ret, Err(Error::Transport(_))));
    }

    #[test]
    fn terminations() {
        assert!(check_term(b'\n').is_ok());
        assert!(check_term(0).is_err());
    }
}
