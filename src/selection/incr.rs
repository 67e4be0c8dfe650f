//! Host -> X selection data with INCR flow control
//!
//! Bytes read from the host offer accumulate in a buffer that grows in
//! [`INCR_CHUNK_SIZE`] steps. A transfer that ends before the buffer fills is
//! written as one property. One that fills it switches to INCR exactly once:
//! the requestor gets an `INCR` marker, and from then on each chunk is
//! written only after the requestor deleted the previous one. An empty chunk
//! ends the transfer.

use log::{debug, trace};

/// Size of one INCR step.
pub const INCR_CHUNK_SIZE: usize = 64 * 1024;

/// What the caller must do after feeding the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendAction {
    /// Write the INCR marker property (type INCR, format 32, value `size`).
    StartIncr { size: u32 },
    /// Write one data chunk to the requestor's property.
    Chunk(Vec<u8>),
    /// Send SelectionNotify naming the requestor's property.
    Notify,
    /// Send SelectionNotify with property None: the transfer failed.
    NotifyFailed,
    /// Stop polling the receive descriptor.
    PauseReading,
    /// Start polling the receive descriptor again.
    ResumeReading,
    /// The transfer is over; the sender can be dropped.
    Done,
}

#[derive(Debug)]
pub struct IncrSender {
    buffer: Vec<u8>,
    len: usize,
    incremental: bool,
    ack_pending: bool,
    source_open: bool,
    reading: bool,
    chunks_sent: usize,
}

impl Default for IncrSender {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrSender {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            len: 0,
            incremental: false,
            ack_pending: false,
            source_open: true,
            reading: true,
            chunks_sent: 0,
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn buffered(&self) -> usize {
        self.len
    }

    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent
    }

    /// Space to read the next bytes into. Grows the buffer one chunk at a
    /// time while it holds less than a chunk.
    pub fn read_buf(&mut self) -> &mut [u8] {
        if self.len < INCR_CHUNK_SIZE {
            self.buffer.resize(self.len + INCR_CHUNK_SIZE, 0);
        }
        &mut self.buffer[self.len..]
    }

    fn take_chunk(&mut self) -> SendAction {
        let chunk = self.buffer[..self.len].to_vec();
        self.len = 0;
        self.ack_pending = true;
        self.chunks_sent += 1;
        trace!("📋 Selection chunk of {} bytes", chunk.len());
        SendAction::Chunk(chunk)
    }

    fn pause(&mut self, actions: &mut Vec<SendAction>) {
        if self.reading {
            self.reading = false;
            actions.push(SendAction::PauseReading);
        }
    }

    /// Result of reading into [`read_buf`](Self::read_buf).
    pub fn on_read(&mut self, result: std::io::Result<usize>) -> Vec<SendAction> {
        let mut actions = Vec::new();
        let n = match result {
            Ok(n) => n,
            Err(err) => {
                debug!("⚠️ Selection read failed: {}", err);
                self.source_open = false;
                self.pause(&mut actions);
                actions.push(SendAction::NotifyFailed);
                actions.push(SendAction::Done);
                return actions;
            }
        };

        self.len += n;
        if self.len >= INCR_CHUNK_SIZE {
            if !self.incremental {
                debug!("📋 Selection switching to INCR");
                self.incremental = true;
                self.ack_pending = true;
                actions.push(SendAction::StartIncr {
                    size: INCR_CHUNK_SIZE as u32,
                });
                actions.push(SendAction::Notify);
            } else if !self.ack_pending {
                actions.push(self.take_chunk());
            }
            self.pause(&mut actions);
        } else if n == 0 {
            if !self.ack_pending {
                actions.push(self.take_chunk());
            }
            self.source_open = false;
            self.pause(&mut actions);
            if !self.incremental {
                actions.push(SendAction::Notify);
                actions.push(SendAction::Done);
            }
        }
        actions
    }

    /// The requestor deleted the property, asking for the next chunk.
    pub fn on_property_deleted(&mut self) -> Vec<SendAction> {
        let mut actions = Vec::new();
        if !self.incremental {
            return actions;
        }
        self.ack_pending = false;

        if self.source_open {
            // empty chunks are reserved for the end of the transfer
            if self.len > 0 {
                actions.push(self.take_chunk());
            }
            if !self.reading {
                self.reading = true;
                actions.push(SendAction::ResumeReading);
            }
            return actions;
        }

        let last = self.len == 0;
        actions.push(self.take_chunk());
        if last {
            actions.push(SendAction::Done);
        }
        actions
    }
}
