//! Cross-thread submission into an I/O driver
//!
//! Callers on any thread post commands; the waker interrupts the driver's
//! poll so the command is picked up on the next loop iteration.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use mio::{Registry, Token, Waker};

use crate::error::{Error, Result};

pub(crate) struct Mailbox<C> {
    sender: Sender<C>,
    waker: Arc<Waker>,
}

impl<C> Clone for Mailbox<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<C> Mailbox<C> {
    pub(crate) fn new(registry: &Registry, token: Token) -> Result<(Self, Receiver<C>)> {
        let waker = Waker::new(registry, token).map_err(|e| Error::io("creating waker", e))?;
        let (sender, receiver) = channel();
        Ok((
            Self {
                sender,
                waker: Arc::new(waker),
            },
            receiver,
        ))
    }

    /// Queue a command and wake the driver.
    ///
    /// Fails with `Error::Stopped` once the driver has exited.
    pub(crate) fn post(&self, command: C) -> Result<()> {
        self.sender.send(command).map_err(|_| Error::Stopped)?;
        self.waker.wake().map_err(|e| Error::io("waking driver", e))
    }
}
