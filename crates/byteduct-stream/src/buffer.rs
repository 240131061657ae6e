//! Single-use buffer handles.
//!
//! A buffer handle is the capability to read from or write into a region
//! owned by the component that granted it, for exactly one outstanding local
//! operation. Handles are linear: the closing methods take `self`, so a
//! closed handle cannot be touched again, and dropping an unclosed handle is
//! a programming error caught by a debug assertion. In release builds a
//! dropped handle completes with zero bytes so the stream stays consistent.

use bytes::{Bytes, BytesMut};

pub(crate) type WriteDone = Box<dyn FnOnce(BytesMut, usize, Option<i32>)>;
pub(crate) type ReadDone = Box<dyn FnOnce(usize, Option<i32>)>;

/// A writable region granted to a local producer.
///
/// The producer fills some prefix and closes the handle with the number of
/// bytes actually written, optionally together with an error to forward to
/// the peer.
pub struct WriteBuffer {
    data: BytesMut,
    done: Option<WriteDone>,
}

impl WriteBuffer {
    pub(crate) fn new(capacity: usize, done: WriteDone) -> Self {
        let mut data = BytesMut::with_capacity(capacity);
        data.resize(capacity, 0);
        Self {
            data,
            done: Some(done),
        }
    }

    /// Size of the granted region.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The writable region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Close the handle: the first `bytes_written` bytes are valid.
    ///
    /// # Panics
    /// Panics if `bytes_written` exceeds the granted region.
    pub fn done(mut self, bytes_written: usize) {
        self.finish(bytes_written, None);
    }

    /// Close the handle with an error. Any bytes written up to the fault are
    /// still transmitted before the error is forwarded.
    ///
    /// # Panics
    /// Panics if `bytes_written` exceeds the granted region.
    pub fn done_with_error(mut self, bytes_written: usize, error: i32) {
        self.finish(bytes_written, Some(error));
    }

    fn finish(&mut self, bytes_written: usize, error: Option<i32>) {
        assert!(
            bytes_written <= self.data.len(),
            "closed write buffer with {bytes_written} bytes but only {} granted",
            self.data.len()
        );
        let done = self.done.take().expect("write buffer closed twice");
        done(std::mem::take(&mut self.data), bytes_written, error);
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if let Some(done) = self.done.take() {
            debug_assert!(false, "WriteBuffer dropped without calling done()");
            done(std::mem::take(&mut self.data), 0, None);
        }
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("len", &self.data.len())
            .field("closed", &self.done.is_none())
            .finish()
    }
}

/// A readable view over the unconsumed suffix of one frame.
///
/// The consumer reads some prefix and closes the handle with the number of
/// bytes consumed, optionally together with an error.
pub struct ReadBuffer {
    data: Bytes,
    done: Option<ReadDone>,
}

impl ReadBuffer {
    pub(crate) fn new(data: Bytes, done: ReadDone) -> Self {
        Self {
            data,
            done: Some(done),
        }
    }

    /// Close the handle: the first `bytes_consumed` bytes were consumed.
    ///
    /// # Panics
    /// Panics if `bytes_consumed` exceeds the readable region.
    pub fn done(mut self, bytes_consumed: usize) {
        self.finish(bytes_consumed, None);
    }

    /// Close the handle with an error after consuming `bytes_consumed`
    /// bytes.
    ///
    /// # Panics
    /// Panics if `bytes_consumed` exceeds the readable region.
    pub fn done_with_error(mut self, bytes_consumed: usize, error: i32) {
        self.finish(bytes_consumed, Some(error));
    }

    fn finish(&mut self, bytes_consumed: usize, error: Option<i32>) {
        assert!(
            bytes_consumed <= self.data.len(),
            "closed read buffer with {bytes_consumed} bytes but only {} readable",
            self.data.len()
        );
        let done = self.done.take().expect("read buffer closed twice");
        done(bytes_consumed, error);
    }
}

impl std::ops::Deref for ReadBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for ReadBuffer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if let Some(done) = self.done.take() {
            debug_assert!(false, "ReadBuffer dropped without calling done()");
            done(0, None);
        }
    }
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("len", &self.data.len())
            .field("closed", &self.done.is_none())
            .finish()
    }
}
