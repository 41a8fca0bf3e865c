//! Received packets and the steal/release ownership handoff.
//!
//! A [`Received`] owns the driver memory holding one incoming packet. If the
//! transport is done with the packet before the envelope goes away, dropping
//! the envelope returns the memory. If the transport wants to keep the bytes
//! (for example while an RPC is processed on a worker thread) it calls
//! [`Received::steal`], which consumes the envelope and yields a
//! [`StolenPacket`]. The stolen handle returns the memory when it is released
//! or dropped, from whatever thread holds it.
//!
//! Both handles are move-only, so a buffer can be returned at most once and
//! never read after it has been returned.

use crate::address::Address;
use std::fmt;
use std::sync::Arc;

/// A fixed-capacity block of packet memory.
///
/// The payload is the `len` bytes starting at `offset`; bytes before
/// `offset` are fabric headers the driver has stripped.
pub struct PacketBuf {
    data: Box<[u8]>,
    offset: usize,
    len: usize,
}

impl PacketBuf {
    /// Allocate a zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            offset: 0,
            len: 0,
        }
    }

    /// Total bytes of backing memory.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whole backing memory, for drivers filling the buffer.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Mark `len` bytes starting at `offset` as the payload.
    ///
    /// The range is clamped to the buffer capacity.
    pub fn set_payload(&mut self, offset: usize, len: usize) {
        let offset = offset.min(self.data.len());
        self.offset = offset;
        self.len = len.min(self.data.len() - offset);
    }

    /// Copy `bytes` into the buffer at `offset` and mark them as the payload.
    ///
    /// Returns the number of bytes copied, which is less than `bytes.len()`
    /// only if the buffer is too small.
    pub fn fill(&mut self, offset: usize, bytes: &[u8]) -> usize {
        let offset = offset.min(self.data.len());
        let n = bytes.len().min(self.data.len() - offset);
        self.data[offset..offset + n].copy_from_slice(&bytes[..n]);
        self.offset = offset;
        self.len = n;
        n
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Forget the payload so the buffer can be reused.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.len = 0;
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf")
            .field("capacity", &self.data.len())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Where a driver takes back receive buffers.
///
/// Implementations must tolerate calls from any thread while the driver's
/// poll loop is running.
pub trait PacketRecycler: Send + Sync + 'static {
    /// Take back a buffer previously handed out in a [`Received`].
    fn recycle(&self, buf: PacketBuf);
}

/// One incoming packet, borrowed from its driver.
pub struct Received {
    sender: Address,
    buf: Option<PacketBuf>,
    recycler: Arc<dyn PacketRecycler>,
}

impl Received {
    /// Wrap a filled buffer. `recycler` gets the buffer back when the
    /// envelope (or the stolen handle) is dropped.
    pub fn new(sender: Address, buf: PacketBuf, recycler: Arc<dyn PacketRecycler>) -> Self {
        Self {
            sender,
            buf: Some(buf),
            recycler,
        }
    }

    /// Where the packet came from.
    pub fn sender(&self) -> &Address {
        &self.sender
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, PacketBuf::len)
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        self.buf.as_ref().map(PacketBuf::payload).unwrap_or_default()
    }

    /// `len` bytes at `offset` within the payload, or `None` if the range
    /// does not fit entirely inside it.
    pub fn get_range(&self, offset: usize, len: usize) -> Option<&[u8]> {
        checked_range(self.payload(), offset, len)
    }

    /// Take over the packet memory. The caller must eventually drop or
    /// [`release`](StolenPacket::release) the returned handle.
    pub fn steal(mut self) -> StolenPacket {
        StolenPacket {
            sender: self.sender,
            buf: self.buf.take(),
            recycler: Arc::clone(&self.recycler),
        }
    }
}

impl Drop for Received {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.recycler.recycle(buf);
        }
    }
}

impl fmt::Debug for Received {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Received")
            .field("sender", &self.sender)
            .field("len", &self.len())
            .finish()
    }
}

/// Packet memory taken over from a [`Received`].
///
/// Returns the memory to the owning driver exactly once: on
/// [`release`](Self::release) or on drop, whichever comes first.
pub struct StolenPacket {
    sender: Address,
    buf: Option<PacketBuf>,
    recycler: Arc<dyn PacketRecycler>,
}

impl StolenPacket {
    /// Where the packet came from. Valid for as long as the packet is held.
    pub fn sender(&self) -> &Address {
        &self.sender
    }

    /// Payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().map(PacketBuf::payload).unwrap_or_default()
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `len` bytes at `offset` within the payload.
    pub fn get_range(&self, offset: usize, len: usize) -> Option<&[u8]> {
        checked_range(self.as_slice(), offset, len)
    }

    /// Return the memory to the driver now.
    pub fn release(self) {
        drop(self);
    }
}

impl AsRef<[u8]> for StolenPacket {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for StolenPacket {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.recycler.recycle(buf);
        }
    }
}

impl fmt::Debug for StolenPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StolenPacket")
            .field("sender", &self.sender)
            .field("len", &self.len())
            .finish()
    }
}

fn checked_range(payload: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    let end = offset.checked_add(len)?;
    payload.get(offset..end)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::address::MacAddress;
    use std::sync::Mutex;

    /// Collects recycled buffers so tests can count returns.
    #[derive(Default)]
    pub(crate) struct CountingRecycler {
        pub(crate) returned: Mutex<Vec<PacketBuf>>,
    }

    impl CountingRecycler {
        pub(crate) fn count(&self) -> usize {
            self.returned.lock().unwrap().len()
        }
    }

    impl PacketRecycler for CountingRecycler {
        fn recycle(&self, buf: PacketBuf) {
            self.returned.lock().unwrap().push(buf);
        }
    }

    pub(crate) fn received(bytes: &[u8], recycler: &Arc<CountingRecycler>) -> Received {
        let mut buf = PacketBuf::new(64);
        buf.fill(4, bytes);
        let recycler: Arc<dyn PacketRecycler> = recycler.clone();
        Received::new(Address::Mac(MacAddress([2, 0, 0, 0, 0, 9])), buf, recycler)
    }

    #[test]
    fn test_packet_buf_fill() {
        let mut buf = PacketBuf::new(8);
        assert_eq!(buf.fill(2, b"abcdefgh"), 6);
        assert_eq!(buf.payload(), b"abcdef");
        buf.reset();
        assert!(buf.is_empty());
        buf.set_payload(6, 10);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_drop_returns_memory() {
        let recycler = Arc::new(CountingRecycler::default());
        let pkt = received(b"hello", &recycler);
        assert_eq!(pkt.payload(), b"hello");
        assert_eq!(pkt.len(), 5);
        drop(pkt);
        assert_eq!(recycler.count(), 1);
    }

    #[test]
    fn test_steal_defers_return() {
        let recycler = Arc::new(CountingRecycler::default());
        let stolen = received(b"hello", &recycler).steal();
        assert_eq!(recycler.count(), 0);
        assert_eq!(stolen.as_slice(), b"hello");
        assert_eq!(stolen.sender().to_string(), "02:00:00:00:00:09");
        stolen.release();
        assert_eq!(recycler.count(), 1);
    }

    #[test]
    fn test_release_from_other_thread() {
        let recycler = Arc::new(CountingRecycler::default());
        let stolen = received(b"worker", &recycler).steal();
        std::thread::spawn(move || {
            assert_eq!(stolen.as_slice(), b"worker");
        })
        .join()
        .unwrap();
        assert_eq!(recycler.count(), 1);
    }

    #[test]
    fn test_get_range() {
        let recycler = Arc::new(CountingRecycler::default());
        let pkt = received(b"0123456789", &recycler);
        assert_eq!(pkt.get_range(2, 3), Some(&b"234"[..]));
        assert_eq!(pkt.get_range(8, 2), Some(&b"89"[..]));
        assert_eq!(pkt.get_range(8, 3), None);
        assert_eq!(pkt.get_range(usize::MAX, 2), None);
        let stolen = pkt.steal();
        assert_eq!(stolen.get_range(0, 1), Some(&b"0"[..]));
    }
}
