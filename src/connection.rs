//! One open transport bound to a [`Session`].

use embedded_io_async::{Read, Write};

use crate::{parser::Parser, session::Session};

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 256;

/// Owns a transport stream and the parser reassembling its bytes.
///
/// Dropping a `Connection` closes the transport. It never changes session
/// state on its own: errors are returned and the owner reports them through
/// [`Session::transport_closed`].
pub struct Connection<T, const BUF: usize> {
    transport: T,
    parser: Parser<BUF>,
}

impl<T, const BUF: usize> Connection<T, BUF>
where
    T: Read + Write,
{
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            parser: Parser::new(),
        }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Writes every queued frame in order, then flushes.
    pub async fn write_outgoing<const N_PUB_IN: usize, const N_PUB_OUT: usize, const N_SUB: usize>(
        &mut self,
        session: &mut Session<N_PUB_IN, N_PUB_OUT, N_SUB>,
    ) -> Result<usize, crate::Error> {
        let mut written = 0;

        while let Some(frame) = session.take_outgoing() {
            self.transport
                .write_all(&frame)
                .await
                .map_err(|_| crate::Error::TransportError)?;
            written += 1;
        }

        if written > 0 {
            self.transport
                .flush()
                .await
                .map_err(|_| crate::Error::TransportError)?;
            trace!("wrote {} frames", written);
        }

        Ok(written)
    }

    /// Reads one chunk and hands each complete packet to `session`.
    ///
    /// `now` is sampled once the bytes are in. Returns the number of packets
    /// handled. Waits for as long as the transport does; dropping the future
    /// before it completes loses no buffered bytes.
    pub async fn read_into<const N_PUB_IN: usize, const N_PUB_OUT: usize, const N_SUB: usize, F>(
        &mut self,
        session: &mut Session<N_PUB_IN, N_PUB_OUT, N_SUB>,
        now: F,
    ) -> Result<usize, crate::Error>
    where
        F: FnOnce() -> Result<u64, crate::Error>,
    {
        let mut chunk = [0u8; READ_CHUNK];

        let n = self
            .transport
            .read(&mut chunk)
            .await
            .map_err(|_| crate::Error::TransportError)?;

        if n == 0 {
            debug!("transport reached end of stream");
            return Err(crate::Error::RemoteClosed);
        }

        let now = now()?;
        self.parser
            .feed(&chunk[..n], |packet| session.handle_packet(packet, now))
    }
}
