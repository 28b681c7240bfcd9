//! In-memory duplex pipe for tests. `tokio::io::duplex` doesn't exist until
//! tokio 0.3; this crate pins tokio 0.2 (matching the teacher), so tests
//! that need a fake socket use this instead — two `AsyncRead + AsyncWrite`
//! halves wired back to back over unbounded byte channels. Dropping a half
//! closes its outgoing channel, which the other half observes as EOF,
//! matching what a real socket close looks like to a reader.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub struct DuplexHalf {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    rx_buf: VecDeque<u8>,
}

/// Build a pair of connected in-memory halves. `_buffer` is accepted for
/// signature parity with `tokio::io::duplex` but unused — the underlying
/// channel is unbounded, since these tests never need back-pressure.
pub fn duplex(_buffer: usize) -> (DuplexHalf, DuplexHalf) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    (
        DuplexHalf {
            tx: Some(tx_a),
            rx: rx_b,
            rx_buf: VecDeque::new(),
        },
        DuplexHalf {
            tx: Some(tx_b),
            rx: rx_a,
            rx_buf: VecDeque::new(),
        },
    )
}

impl AsyncRead for DuplexHalf {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            if !self.rx_buf.is_empty() {
                let n = buf.len().min(self.rx_buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = self.rx_buf.pop_front().unwrap();
                }
                return Poll::Ready(Ok(n));
            }
            match Pin::new(&mut self.rx).poll_next(cx) {
                Poll::Ready(Some(chunk)) => self.rx_buf.extend(chunk),
                Poll::Ready(None) => return Poll::Ready(Ok(0)), // EOF
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for DuplexHalf {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match &this.tx {
            Some(tx) => match tx.send(buf.to_vec()) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(_) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))),
            },
            None => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "shut down"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().tx.take();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn writes_on_one_half_are_read_on_the_other() {
        let (mut a, mut b) = duplex(16);
        a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn dropping_one_half_is_observed_as_eof_on_the_other() {
        let (a, mut b) = duplex(16);
        drop(a);
        let mut buf = [0u8; 4];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
