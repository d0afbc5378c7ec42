//! Bridge between in-flight message buffers and the pluggable serializer.
//!
//! The engine frames bytes; it never interprets them. Applications plug in a
//! serializer through the two-method `MessageSerializer` contract. A bincode
//! implementation is provided for serde types.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CallError, Result};

/// Encodes and decodes one application message type.
pub trait MessageSerializer<T>: Send + Sync {
    /// Serializes `message` into `dest`.
    fn serialize(&self, message: &T, dest: &mut BytesMut) -> Result<()>;

    /// Deserializes a message from `payload`.
    fn deserialize(&self, payload: Bytes) -> Result<T>;
}

/// Bincode-backed serializer for serde-compatible message types.
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> BincodeSerializer<T> {
    /// Creates a new serializer.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageSerializer<T> for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn serialize(&self, message: &T, dest: &mut BytesMut) -> Result<()> {
        let encoded =
            bincode::serialize(message).map_err(|e| CallError::Serialization(e.to_string()))?;
        dest.put_slice(&encoded);
        Ok(())
    }

    fn deserialize(&self, payload: Bytes) -> Result<T> {
        bincode::deserialize(&payload).map_err(|e| CallError::Serialization(e.to_string()))
    }
}

/// Default capacity of buffers handed out by the pool.
const POOL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Maximum number of idle buffers the pool retains.
const POOL_MAX_RETAINED: usize = 32;

/// A small pool of reusable `BytesMut` buffers for outbound framing.
///
/// Buffers that grew past four times the default capacity are dropped on
/// release rather than retained.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<VecDeque<BytesMut>>,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(VecDeque::new()),
        }
    }

    /// Takes a cleared buffer from the pool, allocating if none is idle.
    pub fn acquire(&self) -> BytesMut {
        let mut buffers = self.buffers.lock().unwrap();
        match buffers.pop_front() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(POOL_BUFFER_CAPACITY),
        }
    }

    /// Returns a buffer to the pool for reuse.
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > POOL_BUFFER_CAPACITY * 4 {
            return;
        }
        buf.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < POOL_MAX_RETAINED {
            buffers.push_back(buf);
        }
    }

    /// Number of idle buffers currently retained.
    pub fn idle(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
