//! A single-shot, idempotent, multi-reader "this is done" signal.
//!
//! Several places need to tell an unbounded number of waiters that something
//! happened exactly once (a socket closing, a handshake completing).
//! `tokio::sync::watch` already gives us a
//! multi-reader edge: we wrap it so that "firing" is idempotent and "reset"
//! means handing out a brand new channel rather than reopening the old one.

use tokio::sync::watch;

/// The write side of a [`Closer`]. Firing it more than once is a no-op.
#[derive(Debug)]
pub struct CloserHandle {
    tx: watch::Sender<bool>,
}

impl CloserHandle {
    /// Release every current and future waiter.
    pub fn fire(&self) {
        // watch::Sender::broadcast only errors if every receiver was
        // dropped, which just means nobody is listening anymore.
        let _ = self.tx.broadcast(true);
    }
}

/// The read side of a [`Closer`]. Cloning it is how multiple readers share
/// one signal; each clone observes the same edge exactly once via
/// [`Closer::wait`], then returns immediately afterwards.
#[derive(Debug, Clone)]
pub struct Closer {
    rx: watch::Receiver<bool>,
}

impl Closer {
    /// Create a fresh, unfired closer and its firing handle.
    pub fn new() -> (CloserHandle, Closer) {
        let (tx, rx) = watch::channel(false);
        (CloserHandle { tx }, Closer { rx })
    }

    /// Resolves once the closer has fired. Resolves immediately if it
    /// already has.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while let Some(fired) = rx.recv().await {
            if fired {
                return;
            }
        }
    }

    /// Non-blocking check of whether the closer has fired yet.
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_once_for_every_reader() {
        let (handle, closer) = Closer::new();
        let r1 = closer.clone();
        let r2 = closer.clone();
        handle.fire();
        r1.wait().await;
        r2.wait().await;
        assert!(closer.is_fired());
    }

    #[tokio::test]
    async fn wait_blocks_until_fired() {
        let (handle, closer) = Closer::new();
        assert!(!closer.is_fired());
        let waiter = tokio::spawn(async move {
            closer.wait().await;
        });
        tokio::task::yield_now().await;
        handle.fire();
        waiter.await.unwrap();
    }
}
