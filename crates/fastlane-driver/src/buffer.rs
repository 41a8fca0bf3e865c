//! Chunked message buffers with zero-copy payload splicing.
//!
//! A [`Buffer`] is an ordered list of [`Chunk`]s. Ordinary chunks own their
//! bytes. Payload chunks reference a [`StolenPacket`] in place, so a received
//! datagram can become part of a message without copying; the packet memory
//! goes back to its driver when the chunk is dropped (on [`Buffer::reset`]
//! or when the buffer itself goes away).
//!
//! Readers see no difference between the two kinds of chunk. Outbound,
//! drivers walk a buffer through a [`BufferIter`] and gather the segments
//! into a transmit descriptor.

use crate::received::StolenPacket;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::collections::vec_deque;

/// A slice of received packet memory owned by a buffer.
#[derive(Debug)]
pub struct PayloadChunk {
    packet: StolenPacket,
    offset: usize,
    len: usize,
}

impl PayloadChunk {
    /// Reference `len` bytes at `offset` within `packet`.
    ///
    /// Hands the packet back if the range does not fit in its payload.
    pub fn new(packet: StolenPacket, offset: usize, len: usize) -> Result<Self, StolenPacket> {
        if packet.get_range(offset, len).is_none() {
            return Err(packet);
        }
        Ok(Self {
            packet,
            offset,
            len,
        })
    }

    /// Referenced bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.packet.as_slice()[self.offset..self.offset + self.len]
    }

    /// The underlying packet.
    pub fn packet(&self) -> &StolenPacket {
        &self.packet
    }
}

/// One contiguous segment of a [`Buffer`].
#[derive(Debug)]
pub enum Chunk {
    /// Bytes owned by the buffer
    Inline(Vec<u8>),
    /// Bytes still living in a driver's receive memory
    Payload(PayloadChunk),
}

impl Chunk {
    /// Bytes in this chunk.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Inline(bytes) => bytes,
            Chunk::Payload(chunk) => chunk.as_slice(),
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the chunk holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the chunk references driver memory.
    pub fn is_payload(&self) -> bool {
        matches!(self, Chunk::Payload(_))
    }
}

/// A message assembled from owned and spliced segments.
#[derive(Debug, Default)]
pub struct Buffer {
    chunks: VecDeque<Chunk>,
    len: usize,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes across all chunks.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The chunks, front to back.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Append a copy of `data`.
    pub fn append_copy(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.chunks.push_back(Chunk::Inline(data.to_vec()));
    }

    /// Prepend a copy of `data`.
    pub fn prepend_copy(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.chunks.push_front(Chunk::Inline(data.to_vec()));
    }

    /// Splice `len` bytes at `offset` within `packet` onto the end without
    /// copying. On a bad range the packet is handed back untouched.
    pub fn append_payload(
        &mut self,
        packet: StolenPacket,
        offset: usize,
        len: usize,
    ) -> Result<(), StolenPacket> {
        let chunk = PayloadChunk::new(packet, offset, len)?;
        self.len += len;
        self.chunks.push_back(Chunk::Payload(chunk));
        Ok(())
    }

    /// Splice `len` bytes at `offset` within `packet` onto the front.
    pub fn prepend_payload(
        &mut self,
        packet: StolenPacket,
        offset: usize,
        len: usize,
    ) -> Result<(), StolenPacket> {
        let chunk = PayloadChunk::new(packet, offset, len)?;
        self.len += len;
        self.chunks.push_front(Chunk::Payload(chunk));
        Ok(())
    }

    /// Drop every chunk, returning spliced packets to their drivers.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Copy the whole buffer into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in self.iter() {
            out.extend_from_slice(segment);
        }
        out
    }

    /// `len` bytes at `offset`, or `None` if the range runs past the end.
    ///
    /// Borrowed when the range lies within one chunk, copied otherwise.
    pub fn get_range(&self, offset: usize, len: usize) -> Option<Cow<'_, [u8]>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        let mut iter = self.iter_range(offset, len);
        let first = iter.next().unwrap_or(&[]);
        if first.len() == len {
            return Some(Cow::Borrowed(first));
        }
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(first);
        for segment in iter {
            out.extend_from_slice(segment);
        }
        Some(Cow::Owned(out))
    }

    /// Iterate over every contiguous segment.
    pub fn iter(&self) -> BufferIter<'_> {
        self.iter_range(0, self.len)
    }

    /// Iterate over the segments covering `len` bytes at `offset`, clipped
    /// to the end of the buffer.
    pub fn iter_range(&self, offset: usize, len: usize) -> BufferIter<'_> {
        let offset = offset.min(self.len);
        BufferIter {
            chunks: self.chunks.iter(),
            skip: offset,
            remaining: len.min(self.len - offset),
        }
    }
}

impl<'a> IntoIterator for &'a Buffer {
    type Item = &'a [u8];
    type IntoIter = BufferIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Walks a [`Buffer`] range as contiguous byte slices.
#[derive(Debug, Clone)]
pub struct BufferIter<'a> {
    chunks: vec_deque::Iter<'a, Chunk>,
    skip: usize,
    remaining: usize,
}

impl<'a> BufferIter<'a> {
    /// Bytes not yet yielded.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl<'a> Iterator for BufferIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let bytes = self.chunks.next()?.as_slice();
            if self.skip >= bytes.len() {
                self.skip -= bytes.len();
                continue;
            }
            let bytes = &bytes[self.skip..];
            self.skip = 0;
            let n = bytes.len().min(self.remaining);
            self.remaining -= n;
            return Some(&bytes[..n]);
        }
        None
    }
}
