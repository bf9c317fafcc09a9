use crate::protocol::{LENGTH_CONTINUATION, LENGTH_MASK};

pub(crate) trait DecodePacket<'buf>: Sized {
    fn decode(flags: u8, cursor: &mut Cursor<'buf>) -> Result<Self, crate::Error>;
}

/// Reads the variable-length remaining-length field from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` ends inside the field, otherwise the decoded
/// value together with the number of bytes it occupied.
pub(crate) fn remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, crate::Error> {
    let mut remaining_len: usize = 0;
    let mut multiplier = 1;

    for (i, byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(crate::Error::MalformedRemainingLength);
        }

        remaining_len += (byte & LENGTH_MASK) as usize * multiplier;

        if byte & LENGTH_CONTINUATION == 0 {
            return Ok(Some((remaining_len, i + 1)));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(crate::Error::MalformedRemainingLength);
    }

    Ok(None)
}

pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, crate::Error> {
        self.ensure_remaining(1)?;
        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    pub fn read_u16(&mut self) -> Result<u16, crate::Error> {
        self.ensure_remaining(2)?;
        let res = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;

        Ok(res)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], crate::Error> {
        self.ensure_remaining(len)?;
        let res = &self.buf[self.pos..self.pos + len];
        self.pos += len;

        Ok(res)
    }

    pub fn read_binary_chunk(&mut self) -> Result<&'a [u8], crate::Error> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    pub fn read_utf8(&mut self) -> Result<&'a str, crate::Error> {
        let bytes = self.read_binary_chunk()?;
        let value = core::str::from_utf8(bytes).map_err(|_| crate::Error::InvalidUtf8)?;

        if value.contains('\0') {
            return Err(crate::Error::InvalidUtf8);
        }

        Ok(value)
    }

    /// Everything left in the packet body.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let res = &self.buf[self.pos..];
        self.pos = self.buf.len();
        res
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn expect_empty(&self) -> Result<(), crate::Error> {
        if !self.is_empty() {
            Err(crate::Error::MalformedPacket)
        } else {
            Ok(())
        }
    }

    fn ensure_remaining(&self, n: usize) -> Result<(), crate::Error> {
        if self.remaining() < n {
            Err(crate::Error::UnexpectedEof)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_len_single_byte() {
        assert_eq!(remaining_length(&[0x00]), Ok(Some((0, 1))));
        assert_eq!(remaining_length(&[0x7F, 0xAA]), Ok(Some((127, 1))));
    }

    #[test]
    fn remaining_len_multibyte() {
        // 321 = 0x41 + 2 * 128
        assert_eq!(remaining_length(&[0xC1, 0x02]), Ok(Some((321, 2))));
        assert_eq!(
            remaining_length(&[0xFF, 0xFF, 0xFF, 0x7F]),
            Ok(Some((268_435_455, 4)))
        );
    }

    #[test]
    fn remaining_len_incomplete() {
        assert_eq!(remaining_length(&[]), Ok(None));
        assert_eq!(remaining_length(&[0x80]), Ok(None));
        assert_eq!(remaining_length(&[0xFF, 0xFF, 0xFF]), Ok(None));
    }

    #[test]
    fn remaining_len_too_long() {
        assert_eq!(
            remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(crate::Error::MalformedRemainingLength)
        );
        assert_eq!(
            remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(crate::Error::MalformedRemainingLength)
        );
    }

    #[test]
    fn truncated_string() {
        let body = [0x00, 0x05, b'a', b'b'];
        let mut cursor = Cursor::new(&body);

        assert_eq!(cursor.read_utf8(), Err(crate::Error::UnexpectedEof));
    }

    #[test]
    fn null_character_rejected() {
        let body = [0x00, 0x02, b'a', 0x00];
        let mut cursor = Cursor::new(&body);

        assert_eq!(cursor.read_utf8(), Err(crate::Error::InvalidUtf8));
    }
}
