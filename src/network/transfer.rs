//! Receive/send state shared by server connections and client sessions
//!
//! Sockets are edge-triggered, so a readiness event is only re-delivered
//! after the socket reports `WouldBlock`. Both helpers drain until the
//! kernel says so; reads stop early at a budget and the driver resumes
//! them on its next turn.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use tracing::trace;

use crate::core::Descriptor;

/// Reads per readiness event before the driver goes back to `poll`
pub(crate) const READ_BUDGET: usize = 16;

/// Outcome of draining a readable socket
#[derive(Debug)]
pub(crate) enum ReceiveStatus {
    /// Nothing more to read this cycle
    Open,
    /// Budget used up before `WouldBlock`; more data may be waiting
    Pending,
    /// Peer closed (`None`) or the socket failed
    Closed(Option<io::Error>),
}

/// Read into `descriptor` until `WouldBlock`, at most `budget` reads.
///
/// Each successful read is one receive completion, handed to `on_chunk`
/// as soon as it is read. The bytes are copied out because the descriptor
/// is reused by the next read.
pub(crate) fn receive<R: Read>(
    stream: &mut R,
    descriptor: &mut Descriptor,
    budget: usize,
    mut on_chunk: impl FnMut(Vec<u8>),
) -> ReceiveStatus {
    let mut reads = 0;
    while reads < budget {
        match stream.read(descriptor.buffer_mut()) {
            Ok(0) => return ReceiveStatus::Closed(None),
            Ok(n) => {
                reads += 1;
                trace!(len = n, slot = descriptor.slot(), "Read from socket");
                on_chunk(descriptor.copy_filled(n));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReceiveStatus::Open,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReceiveStatus::Closed(Some(e)),
        }
    }
    ReceiveStatus::Pending
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushStatus {
    /// Every queued buffer was written
    Drained,
    /// The socket is full; wait for a writable event
    Blocked,
}

/// Per-connection outbound queue with one buffer in flight at a time
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    queue: VecDeque<Vec<u8>>,
    // Bytes of the front buffer already written
    offset: usize,
}

impl Outbound {
    pub(crate) fn push(&mut self, data: Vec<u8>) {
        self.queue.push_back(data);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes still waiting to be written
    pub(crate) fn pending(&self) -> usize {
        self.queue.iter().map(Vec::len).sum::<usize>() - self.offset
    }

    /// Write queued buffers until drained or the socket would block.
    ///
    /// The length of every fully written buffer is appended to `completed`.
    pub(crate) fn flush<W: Write>(
        &mut self,
        stream: &mut W,
        completed: &mut Vec<usize>,
    ) -> io::Result<FlushStatus> {
        while let Some(front) = self.queue.front() {
            if self.offset == front.len() {
                completed.push(front.len());
                self.queue.pop_front();
                self.offset = 0;
                continue;
            }

            match stream.write(&front[self.offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "Failed to write to socket",
                    ));
                }
                Ok(n) => {
                    self.offset += n;
                    trace!(len = n, remaining = front.len() - self.offset, "Wrote to socket");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Blocked)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(FlushStatus::Drained)
    }
}
