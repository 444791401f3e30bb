//! In-memory socket for driving transports deterministically in tests.

use super::Socket;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

#[derive(Debug, Default)]
struct Pipe {
    data: VecDeque<u8>,
    /// Writer side is gone, the reader sees EOF once drained.
    closed: bool,
    reader: Option<Waker>,
}

impl Pipe {
    fn wake(&mut self) {
        if let Some(waker) = self.reader.take() {
            waker.wake();
        }
    }
}

/// A socket backed by in-memory pipes.
///
/// Clones share the same pipes, so a test can keep one clone to feed and
/// inspect the socket a transport owns.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockSocket {
    inbox: Arc<Mutex<Pipe>>,
    outbox: Arc<Mutex<Pipe>>,
    closes: Arc<AtomicUsize>,
}

impl MockSocket {
    /// A socket whose peer is the test itself.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Two sockets connected to each other.
    pub(crate) fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(Pipe::default()));
        let b_to_a = Arc::new(Mutex::new(Pipe::default()));
        let a = Self {
            inbox: b_to_a.clone(),
            outbox: a_to_b.clone(),
            closes: Arc::default(),
        };
        let b = Self {
            inbox: a_to_b,
            outbox: b_to_a,
            closes: Arc::default(),
        };
        (a, b)
    }

    /// Makes bytes available to read.
    pub(crate) fn push_incoming(&self, bytes: &[u8]) {
        let mut inbox = self.inbox.lock();
        inbox.data.extend(bytes);
        inbox.wake();
    }

    /// Simulates the peer closing its side.
    pub(crate) fn close_incoming(&self) {
        let mut inbox = self.inbox.lock();
        inbox.closed = true;
        inbox.wake();
    }

    /// Everything written so far.
    pub(crate) fn take_outgoing(&self) -> Vec<u8> {
        self.outbox.lock().data.drain(..).collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn not_connected() -> io::Error {
        io::Error::from(io::ErrorKind::NotConnected)
    }
}

impl Socket for MockSocket {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.is_closed() {
            return Poll::Ready(Err(Self::not_connected()));
        }
        let mut inbox = self.inbox.lock();
        if !inbox.data.is_empty() || inbox.closed {
            Poll::Ready(Ok(()))
        } else {
            inbox.reader = Some(cx.waker().clone());
            Poll::Pending
        }
    }

    fn poll_write_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.is_closed() {
            Poll::Ready(Err(Self::not_connected()))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(Self::not_connected());
        }
        let mut inbox = self.inbox.lock();
        if inbox.data.is_empty() {
            return if inbox.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(inbox.data.len());
        for (slot, byte) in buf.iter_mut().zip(inbox.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(Self::not_connected());
        }
        let mut outbox = self.outbox.lock();
        outbox.data.extend(buf);
        outbox.wake();
        Ok(buf.len())
    }

    fn close(&mut self) {
        // Counts every call so tests can check the owner closes exactly once.
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            let mut outbox = self.outbox.lock();
            outbox.closed = true;
            outbox.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

    #[test]
    fn test_incoming_bytes_wake_reader() {
        let (a, b) = MockSocket::pair();
        let mut ready = task::spawn(std::future::poll_fn(|cx| b.poll_read_ready(cx)));
        assert_pending!(ready.poll());

        a.try_write(b"x").unwrap();
        assert!(ready.is_woken());
        assert_ready_ok!(ready.poll());
    }

    #[test]
    fn test_peer_close_reads_as_eof() {
        let (mut a, b) = MockSocket::pair();
        a.try_write(b"bye").unwrap();
        a.close();
        a.close();
        assert_eq!(a.close_count(), 2);

        let mut buf = [0u8; 8];
        assert_eq!(b.try_read(&mut buf).unwrap(), 3);
        assert_eq!(b.try_read(&mut buf).unwrap(), 0);

        let mut ready = task::spawn(std::future::poll_fn(|cx| a.poll_read_ready(cx)));
        assert!(assert_ready!(ready.poll()).is_err());
    }
}
