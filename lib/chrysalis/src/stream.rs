// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequential byte-stream halves for the migration protocol.
//!
//! [`StreamWriter`] and [`StreamReader`] wrap any `Write`/`Read` transport
//! and expose the big-endian primitives the framing layer is written in
//! terms of.  Both halves are *error-sticky*: the first failure is latched
//! and every subsequent primitive is a no-op that reports that same first
//! error.  The latch is shared (via [`StreamWriter::latch`]) so a failure
//! observed on one thread is visible to every other user of the stream
//! before their next operation completes.

use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{MigrateError, Result};

/// Write-side buffer capacity; flushed to the transport when full or on an
/// explicit [`StreamWriter::flush`].
const IO_BUF_SIZE: usize = 32 * 1024;

/// Shared sticky error slot.  Only the first `set` wins.
#[derive(Default)]
pub struct ErrorLatch {
    failed: AtomicBool,
    slot: Mutex<Option<MigrateError>>,
}

impl ErrorLatch {
    pub fn set(&self, err: MigrateError) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
            // Publish after the slot is populated so a reader that observes
            // `failed` can always retrieve the error itself.
            self.failed.store(true, Ordering::Release);
        }
    }

    pub fn get(&self) -> Option<MigrateError> {
        if !self.failed.load(Ordering::Acquire) {
            return None;
        }
        self.slot.lock().unwrap().clone()
    }

    pub fn is_set(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Buffered, error-sticky writer half of a migration stream.
pub struct StreamWriter {
    sink: Box<dyn Write + Send>,
    buf: Vec<u8>,
    latch: Arc<ErrorLatch>,
    rate_limit: Option<u64>,
    rate_bytes: u64,
    total_bytes: u64,
}

impl StreamWriter {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self::with_latch(sink, Arc::new(ErrorLatch::default()))
    }

    /// Construct a writer sharing an existing latch, so that (for example)
    /// both directions of one transport fail together.
    pub fn with_latch(
        sink: Box<dyn Write + Send>,
        latch: Arc<ErrorLatch>,
    ) -> Self {
        Self {
            sink,
            buf: Vec::with_capacity(IO_BUF_SIZE),
            latch,
            rate_limit: None,
            rate_bytes: 0,
            total_bytes: 0,
        }
    }

    pub fn latch(&self) -> Arc<ErrorLatch> {
        Arc::clone(&self.latch)
    }

    pub fn error(&self) -> Option<MigrateError> {
        self.latch.get()
    }

    pub fn set_error(&self, err: MigrateError) {
        self.latch.set(err);
    }

    /// Bytes accepted over the writer's lifetime, buffered or not.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Install (or clear) the per-round write budget consulted by
    /// [`StreamWriter::rate_limit_exceeded`].
    pub fn set_rate_limit(&mut self, limit: Option<u64>) {
        self.rate_limit = limit;
        self.rate_bytes = 0;
    }

    /// True once the current round's budget is spent; the iterate loop backs
    /// off rather than queueing more data.
    pub fn rate_limit_exceeded(&self) -> bool {
        match self.rate_limit {
            Some(limit) => self.rate_bytes > limit,
            None => false,
        }
    }

    /// Open the next budget window without touching the limit itself.
    pub fn reset_rate_budget(&mut self) {
        self.rate_bytes = 0;
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.latch.is_set() {
            return;
        }
        self.buf.extend_from_slice(bytes);
        self.rate_bytes += bytes.len() as u64;
        self.total_bytes += bytes.len() as u64;
        if self.buf.len() >= IO_BUF_SIZE {
            self.drain_buf();
        }
    }

    fn drain_buf(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if let Err(err) = self.sink.write_all(&self.buf) {
            self.latch.set(MigrateError::from(err));
        }
        self.buf.clear();
    }

    pub fn put_u8(&mut self, v: u8) {
        self.push(&[v]);
    }

    pub fn put_be16(&mut self, v: u16) {
        self.push(&v.to_be_bytes());
    }

    pub fn put_be32(&mut self, v: u32) {
        self.push(&v.to_be_bytes());
    }

    pub fn put_be64(&mut self, v: u64) {
        self.push(&v.to_be_bytes());
    }

    pub fn put_buffer(&mut self, bytes: &[u8]) {
        self.push(bytes);
    }

    /// Identifier strings go on the wire as a single length octet followed
    /// by the bytes, no terminator.
    pub fn put_counted_string(&mut self, s: &str) {
        debug_assert!(s.len() <= u8::MAX as usize);
        self.put_u8(s.len() as u8);
        self.put_buffer(s.as_bytes());
    }

    /// Push everything buffered to the transport.  Returns the first latched
    /// error, which may long predate this call.
    pub fn flush(&mut self) -> Result<()> {
        if !self.latch.is_set() {
            self.drain_buf();
            if let Err(err) = self.sink.flush() {
                self.latch.set(MigrateError::from(err));
            }
        }
        match self.latch.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Error-sticky reader half of a migration stream.
pub struct StreamReader {
    source: Box<dyn Read + Send>,
    latch: Arc<ErrorLatch>,
}

impl StreamReader {
    pub fn new(source: Box<dyn Read + Send>) -> Self {
        Self { source, latch: Arc::new(ErrorLatch::default()) }
    }

    /// A reader over an in-memory buffer, as used for PACKAGED sub-streams
    /// and checkpoint buffers.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::new(Box::new(Cursor::new(bytes)))
    }

    pub fn latch(&self) -> Arc<ErrorLatch> {
        Arc::clone(&self.latch)
    }

    pub fn error(&self) -> Option<MigrateError> {
        self.latch.get()
    }

    pub fn set_error(&self, err: MigrateError) {
        self.latch.set(err);
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        if let Some(err) = self.latch.get() {
            return Err(err);
        }
        if let Err(err) = self.source.read_exact(buf) {
            let err = MigrateError::from(err);
            self.latch.set(err.clone());
            return Err(err);
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0])
    }

    pub fn get_be16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.fill(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    pub fn get_be32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    pub fn get_be64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    pub fn get_buffer(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    pub fn get_counted_string(&mut self) -> Result<String> {
        let len = self.get_u8()? as usize;
        let bytes = self.get_buffer(len)?;
        String::from_utf8(bytes).map_err(|_| {
            let err = MigrateError::Format(
                "identifier string is not UTF-8".to_string(),
            );
            self.latch.set(err.clone());
            err
        })
    }
}

/// A shared, growable byte buffer usable as a write sink and then re-read,
/// backing PACKAGED payload assembly and the checkpoint staging buffer.
#[derive(Clone, Default)]
pub struct MemBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl MemBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().clone()
    }

    /// Replace the contents wholesale (e.g. with bytes pulled off a stream).
    pub fn fill(&self, bytes: Vec<u8>) {
        *self.inner.lock().unwrap() = bytes;
    }

    pub fn writer(&self) -> StreamWriter {
        StreamWriter::new(Box::new(self.clone()))
    }

    pub fn reader(&self) -> StreamReader {
        StreamReader::from_bytes(self.snapshot())
    }
}

impl Write for MemBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
