//! Incremental reassembly of packets from arbitrary byte chunks.

use heapless::Vec;

use crate::packet::{self, Decoded, Packet};

/// Accumulates bytes until whole packets can be decoded.
///
/// `N` bounds the largest packet the parser can hold. A framing error halts
/// the parser: every later [`Parser::feed`] returns the same error until
/// [`Parser::reset`] is called for a fresh stream.
pub struct Parser<const N: usize> {
    buf: Vec<u8, N>,
    halted: Option<crate::Error>,
}

impl<const N: usize> Default for Parser<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Parser<N> {
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            halted: None,
        }
    }

    /// Bytes held back waiting for the rest of a packet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.halted = None;
    }

    /// Appends `chunk` and hands every complete packet to `on_packet`, in
    /// arrival order, before returning the number of packets emitted.
    ///
    /// An error from `on_packet` stops processing and is returned as is; the
    /// packet that caused it counts as consumed.
    pub fn feed<F>(&mut self, mut chunk: &[u8], mut on_packet: F) -> Result<usize, crate::Error>
    where
        F: FnMut(Packet<'_>) -> Result<(), crate::Error>,
    {
        if let Some(err) = self.halted {
            return Err(err);
        }

        let mut emitted = 0;

        loop {
            let free = N - self.buf.len();
            let take = free.min(chunk.len());

            self.buf
                .extend_from_slice(&chunk[..take])
                .map_err(|_| crate::Error::BufferTooSmall)?;
            chunk = &chunk[take..];

            let drained = self.drain(&mut on_packet)?;
            emitted += drained;

            if chunk.is_empty() {
                return Ok(emitted);
            }

            if drained == 0 && self.buf.len() == N {
                return Err(self.halt(crate::Error::BufferTooSmall));
            }
        }
    }

    fn drain<F>(&mut self, on_packet: &mut F) -> Result<usize, crate::Error>
    where
        F: FnMut(Packet<'_>) -> Result<(), crate::Error>,
    {
        let mut emitted = 0;

        loop {
            let step = match packet::decode(&self.buf) {
                Ok(Decoded::Packet(packet, consumed)) => Ok(Some((consumed, on_packet(packet)))),
                Ok(Decoded::NeedMoreData) => Ok(None),
                Err(err) => Err(err),
            };

            match step {
                Ok(Some((consumed, result))) => {
                    self.consume(consumed);
                    result?;
                    emitted += 1;
                }
                Ok(None) => return Ok(emitted),
                Err(err) => {
                    error!("framing error: {:?}", err);
                    return Err(self.halt(err));
                }
            }
        }
    }

    fn consume(&mut self, n: usize) {
        let len = self.buf.len();
        self.buf.copy_within(n..len, 0);
        self.buf.truncate(len - n);
    }

    fn halt(&mut self, err: crate::Error) -> crate::Error {
        self.buf.clear();
        self.halted = Some(err);
        err
    }
}
