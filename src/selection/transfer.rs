//! X -> host selection data
//!
//! The host asks for the X clipboard one `send(mime, fd)` at a time. Only one
//! conversion runs against the X owner at once; later requests wait in FIFO
//! order. Property values are written to the host descriptor without
//! blocking, resuming when it becomes writable.

use log::{debug, warn};
use std::collections::VecDeque;
use std::io::{ErrorKind, Write};

/// Result of pushing buffered property bytes into the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Everything was written.
    Complete,
    /// The sink is full; call again once it is writable.
    Blocked,
    /// The sink failed and was dropped.
    Failed,
}

/// Bytes of one property value on their way to a host descriptor.
#[derive(Debug)]
pub struct PropertyWriter {
    data: Vec<u8>,
    offset: usize,
}

impl PropertyWriter {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn write_to<W: Write>(&mut self, sink: &mut W) -> WriteProgress {
        while self.offset < self.data.len() {
            match sink.write(&self.data[self.offset..]) {
                Ok(0) => return WriteProgress::Failed,
                Ok(n) => self.offset += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return WriteProgress::Blocked,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("⚠️ Selection write to host failed: {}", err);
                    return WriteProgress::Failed;
                }
            }
        }
        WriteProgress::Complete
    }
}

/// A host `send` request: the target atom for `mime` and the descriptor.
#[derive(Debug)]
pub struct SendRequest<W> {
    pub target: u32,
    pub sink: W,
}

#[derive(Debug)]
struct ActiveSend<W> {
    sink: W,
    incremental: bool,
    writer: Option<PropertyWriter>,
}

/// What the caller must do after feeding the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAction {
    /// ConvertSelection(CLIPBOARD, target) into our property.
    Convert { target: u32 },
    /// Poll the active sink for writability.
    AwaitWritable,
    /// Delete our property to ask the owner for the next INCR chunk.
    RequestNextChunk,
}

#[derive(Debug)]
pub struct SendQueue<W> {
    active: Option<ActiveSend<W>>,
    waiting: VecDeque<SendRequest<W>>,
}

impl<W> Default for SendQueue<W> {
    fn default() -> Self {
        Self {
            active: None,
            waiting: VecDeque::new(),
        }
    }
}

impl<W: Write> SendQueue<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_incremental(&self) -> bool {
        self.active.as_ref().map_or(false, |a| a.incremental)
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Descriptor of the send being served.
    pub fn active_sink(&self) -> Option<&W> {
        self.active.as_ref().map(|a| &a.sink)
    }

    pub fn push(&mut self, request: SendRequest<W>) -> Vec<QueueAction> {
        self.waiting.push_back(request);
        if self.active.is_some() {
            debug!("📋 Selection send queued ({} waiting)", self.waiting.len());
            return Vec::new();
        }
        self.start_next()
    }

    fn start_next(&mut self) -> Vec<QueueAction> {
        self.active = None;
        match self.waiting.pop_front() {
            Some(request) => {
                self.active = Some(ActiveSend {
                    sink: request.sink,
                    incremental: false,
                    writer: None,
                });
                vec![QueueAction::Convert {
                    target: request.target,
                }]
            }
            None => Vec::new(),
        }
    }

    /// The owner refused the conversion: drop the active send, closing its
    /// sink, and start the next one.
    pub fn abort(&mut self) -> Vec<QueueAction> {
        if self.active.is_none() {
            return Vec::new();
        }
        debug!("📋 Selection conversion refused");
        self.start_next()
    }

    /// The owner's reply was an `INCR` marker.
    pub fn begin_incremental(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.incremental = true;
        }
    }

    /// A complete value, or the next chunk when incremental.
    pub fn property_value(&mut self, data: Vec<u8>) -> Vec<QueueAction> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        if active.incremental && data.is_empty() {
            debug!("📋 Incremental selection transfer finished");
            return self.start_next();
        }
        active.writer = Some(PropertyWriter::new(data));
        self.flush()
    }

    /// The sink became writable.
    pub fn flush(&mut self) -> Vec<QueueAction> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let Some(writer) = active.writer.as_mut() else {
            return Vec::new();
        };
        match writer.write_to(&mut active.sink) {
            WriteProgress::Blocked => vec![QueueAction::AwaitWritable],
            WriteProgress::Complete if active.incremental => {
                active.writer = None;
                vec![QueueAction::RequestNextChunk]
            }
            WriteProgress::Complete | WriteProgress::Failed => self.start_next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records writes and accepts at most `budget` bytes before blocking.
    #[derive(Clone, Default)]
    struct Sink {
        bytes: Rc<RefCell<Vec<u8>>>,
        budget: Rc<RefCell<usize>>,
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut budget = self.budget.borrow_mut();
            if *budget == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(*budget);
            *budget -= n;
            self.bytes.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sink(budget: usize) -> Sink {
        let s = Sink::default();
        *s.budget.borrow_mut() = budget;
        s
    }

    #[test]
    fn test_requests_are_served_in_order() {
        let mut queue = SendQueue::new();
        let first = sink(usize::MAX);
        assert_eq!(
            queue.push(SendRequest { target: 10, sink: first.clone() }),
            vec![QueueAction::Convert { target: 10 }]
        );
        assert!(queue.push(SendRequest { target: 11, sink: sink(usize::MAX) }).is_empty());
        assert!(queue.push(SendRequest { target: 12, sink: sink(usize::MAX) }).is_empty());

        assert_eq!(
            queue.property_value(b"hello".to_vec()),
            vec![QueueAction::Convert { target: 11 }]
        );
        assert_eq!(first.bytes.borrow().as_slice(), b"hello");
        assert_eq!(queue.property_value(Vec::new()), vec![QueueAction::Convert { target: 12 }]);
    }

    #[test]
    fn test_partial_write_resumes() {
        let mut queue = SendQueue::new();
        let s = sink(3);
        queue.push(SendRequest { target: 1, sink: s.clone() });
        assert_eq!(queue.property_value(b"abcdef".to_vec()), vec![QueueAction::AwaitWritable]);
        *s.budget.borrow_mut() = 10;
        assert!(queue.flush().is_empty());
        assert_eq!(s.bytes.borrow().as_slice(), b"abcdef");
        assert!(!queue.is_active());
    }

    #[test]
    fn test_incremental_chunks_then_terminator() {
        let mut queue = SendQueue::new();
        let s = sink(usize::MAX);
        queue.push(SendRequest { target: 1, sink: s.clone() });
        queue.begin_incremental();
        assert_eq!(queue.property_value(vec![1; 4]), vec![QueueAction::RequestNextChunk]);
        assert_eq!(queue.property_value(vec![2; 4]), vec![QueueAction::RequestNextChunk]);
        assert!(queue.is_active());
        assert!(queue.property_value(Vec::new()).is_empty());
        assert!(!queue.is_active());
        assert_eq!(s.bytes.borrow().len(), 8);
    }

    #[test]
    fn test_value_without_request_is_ignored() {
        let mut queue: SendQueue<Sink> = SendQueue::new();
        assert!(queue.property_value(b"x".to_vec()).is_empty());
        assert!(queue.flush().is_empty());
    }
}
