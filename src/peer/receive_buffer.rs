use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes read from a socket that have not been parsed yet.
///
/// `packet_size` is how many bytes make up the next logical unit (a frame
/// header, a whole message, an HTTP line). Consumed prefixes are split off
/// as [`Bytes`] views, so handing a block on never copies it.
#[derive(Debug)]
pub struct ReceiveBuffer {
    buf: BytesMut,
    packet_size: usize,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            packet_size: 0,
        }
    }

    /// Bytes received and not yet consumed.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn set_packet_size(&mut self, size: usize) {
        self.packet_size = size;
    }

    /// Whether the expected unit has fully arrived.
    pub fn packet_finished(&self) -> bool {
        self.buf.len() >= self.packet_size
    }

    /// Bytes still missing from the expected unit.
    pub fn missing(&self) -> usize {
        self.packet_size.saturating_sub(self.buf.len())
    }

    /// The first `n` bytes, if that many are buffered.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        self.buf.get(..n)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Splits off the first `n` bytes.
    pub fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Takes everything buffered.
    pub fn consume_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Discards the first `n` bytes.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Discards `n` bytes and sets the size of the next unit.
    pub fn cut(&mut self, n: usize, next_packet_size: usize) {
        self.advance(n);
        self.packet_size = next_packet_size;
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Reads at most `max` bytes from `reader`.
    ///
    /// Returns the number of bytes read; zero means end of stream.
    pub async fn fill_from<R>(&mut self, reader: &mut R, max: usize) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        if max == 0 {
            return Ok(0);
        }
        self.buf.reserve(max);
        let mut limited = reader.take(max as u64);
        limited.read_buf(&mut self.buf).await
    }

    /// Drops all buffered bytes and frees the allocation.
    pub fn release(&mut self) {
        self.buf = BytesMut::new();
        self.packet_size = 0;
    }
}
