//! Fallible memory resources
//!
//! All stack allocations are admitted through a [`MemoryResource`]: payload
//! buffers, per-session state, executor callback slots. Exhaustion is a
//! value (`None`), never a panic, so an embedder with a fixed pool degrades
//! gracefully under load.
//!
//! A [`Payload`] handle owns its bytes. When dropped, the backing storage is
//! returned to the resource it came from, which keeps the accounting of
//! metering resources exact: after every object built on top of a resource
//! is gone, `total_allocated_bytes == total_deallocated_bytes`.

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::Cell;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// A provider of fallible byte storage.
///
/// Implementations decide admission (quota, pool occupancy) and may recycle
/// returned storage. `deallocate` receives the exact storage previously
/// handed out by `allocate`, with its original length intact.
pub trait MemoryResource {
    /// Allocates zero-filled storage of exactly `size` bytes.
    /// `None` models exhaustion.
    fn allocate(&self, size: usize) -> Option<Vec<u8>>;

    /// Accepts storage back. Called from `Payload::drop`.
    fn deallocate(&self, storage: Vec<u8>);
}

/// Shared handle to a memory resource.
///
/// The stack is single-threaded by design, so the handle is an `Rc`; cloning
/// it is cheap and every clone refers to the same resource.
#[derive(Clone)]
pub struct Memory(Rc<dyn MemoryResource>);

impl Memory {
    pub fn new(resource: Rc<dyn MemoryResource>) -> Self {
        Self(resource)
    }

    /// Allocates a zero-filled payload buffer of exactly `size` bytes.
    pub fn allocate(&self, size: usize) -> Option<Payload> {
        let storage = self.0.allocate(size)?;
        debug_assert_eq!(storage.len(), size);
        Some(Payload {
            storage: Some(storage),
            length: size,
            memory: self.clone(),
        })
    }

    /// Allocates a payload holding the concatenation of `fragments`.
    pub fn concat(&self, fragments: &[&[u8]]) -> Option<Payload> {
        let total = fragments.iter().map(|f| f.len()).sum();
        let mut payload = self.allocate(total)?;
        let mut offset = 0;
        for fragment in fragments {
            payload[offset..offset + fragment.len()].copy_from_slice(fragment);
            offset += fragment.len();
        }
        Some(payload)
    }

    fn release(&self, storage: Vec<u8>) {
        self.0.deallocate(storage);
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Memory")
    }
}

/// An owned byte buffer charged against a [`MemoryResource`].
///
/// The visible length may be shortened with [`Payload::set_len`] (e.g. after
/// an extent-limited reassembly); the full storage is still returned to the
/// originating resource on drop.
pub struct Payload {
    /// `None` only transiently during drop.
    storage: Option<Vec<u8>>,
    length: usize,
    memory: Memory,
}

impl Payload {
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The allocated storage size, which bounds `set_len`.
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map_or(0, Vec::len)
    }

    /// Shortens (or restores, up to capacity) the visible length.
    pub fn set_len(&mut self, length: usize) {
        self.length = length.min(self.capacity());
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let storage = self.storage.as_ref().expect("payload storage consumed");
        &storage[..self.length]
    }
}

impl DerefMut for Payload {
    fn deref_mut(&mut self) -> &mut [u8] {
        let storage = self.storage.as_mut().expect("payload storage consumed");
        &mut storage[..self.length]
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("length", &self.length)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            let memory = self.memory.clone();
            memory.release(storage);
        }
    }
}

/// The reference resource: admits everything, backed by the process heap.
#[derive(Debug, Default)]
pub struct HeapMemory;

impl MemoryResource for HeapMemory {
    fn allocate(&self, size: usize) -> Option<Vec<u8>> {
        Some(vec![0; size])
    }

    fn deallocate(&self, storage: Vec<u8>) {
        drop(storage);
    }
}

/// A metering resource: heap-backed, with exact byte accounting.
///
/// Intended for instrumentation and tests; the invariant checked throughout
/// the test suite is that once every stack object is dropped,
/// `total_allocated_bytes() == total_deallocated_bytes()` and
/// `live_allocations() == 0`.
#[derive(Debug, Default)]
pub struct TrackingMemory {
    allocated_bytes: Cell<u64>,
    deallocated_bytes: Cell<u64>,
    live: Cell<usize>,
}

impl TrackingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_allocated_bytes(&self) -> u64 {
        self.allocated_bytes.get()
    }

    pub fn total_deallocated_bytes(&self) -> u64 {
        self.deallocated_bytes.get()
    }

    pub fn live_allocations(&self) -> usize {
        self.live.get()
    }
}

impl MemoryResource for TrackingMemory {
    fn allocate(&self, size: usize) -> Option<Vec<u8>> {
        self.allocated_bytes
            .set(self.allocated_bytes.get() + size as u64);
        self.live.set(self.live.get() + 1);
        Some(vec![0; size])
    }

    fn deallocate(&self, storage: Vec<u8>) {
        self.deallocated_bytes
            .set(self.deallocated_bytes.get() + storage.len() as u64);
        self.live.set(self.live.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let resource = Rc::new(TrackingMemory::new());
        let memory = Memory::new(resource.clone());

        let mut payload = memory.allocate(16).unwrap();
        payload[0] = 0xab;
        assert_eq!(payload.len(), 16);
        assert_eq!(payload[0], 0xab);
        assert_eq!(resource.live_allocations(), 1);

        drop(payload);
        assert_eq!(resource.live_allocations(), 0);
        assert_eq!(
            resource.total_allocated_bytes(),
            resource.total_deallocated_bytes()
        );
    }

    #[test]
    fn test_set_len_keeps_accounting_exact() {
        let resource = Rc::new(TrackingMemory::new());
        let memory = Memory::new(resource.clone());

        let mut payload = memory.allocate(32).unwrap();
        payload.set_len(5);
        assert_eq!(payload.len(), 5);
        assert_eq!(payload.capacity(), 32);

        drop(payload);
        assert_eq!(resource.total_deallocated_bytes(), 32);
    }

    #[test]
    fn test_concat() {
        let memory = Memory::new(Rc::new(HeapMemory));
        let payload = memory.concat(&[b"ab", b"", b"cde"]).unwrap();
        assert_eq!(&payload[..], b"abcde");
    }
}
