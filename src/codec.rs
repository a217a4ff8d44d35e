use crate::{
    config::{Config, MIN_BUFFER_SIZE},
    error::{Result, SmuxError},
    frame::{
        ChannelId, FrameHeader, CHANNEL_BYTES, DEFAULT_CHANNEL, HEADER_SIZE, MAX_FRAME_PAYLOAD,
        SIZE_BYTES,
    },
    ring::RingBuffer,
};
use std::io;

/// Encoder and decoder for one end of a smux link.
///
/// Both directions are decoupled from I/O readiness by a ring buffer: `send`
/// appends framed bytes to the outbound ring and `write_out` drains it to a
/// sink; `read_in`/`ingest` fill the inbound ring and `recv` extracts
/// per-channel payload from it. None of the calls block and none of them
/// fail: partial progress is reported through the returned counts, and only
/// the I/O drivers can surface an error (the one their callback produced).
///
/// The codec is deliberately not thread-safe; callers serialise access.
#[derive(Debug)]
pub struct Codec {
    /// Outbound ring: framed bytes awaiting transmission.
    wring: RingBuffer,
    /// Inbound ring: wire bytes awaiting decoding.
    rring: RingBuffer,
    /// Channel the decoder is currently delivering for.
    recv_ch: ChannelId,
    /// Payload bytes still owed to `recv_ch`; ignored while `recv_ch` is 0.
    recv_remaining: usize,
    esc: u8,
}

impl Codec {
    pub fn new(config: &Config) -> Result<Self> {
        if config.write_buffer_size < MIN_BUFFER_SIZE || config.read_buffer_size < MIN_BUFFER_SIZE
        {
            return Err(SmuxError::Config(format!(
                "smux requires ring buffers of at least {MIN_BUFFER_SIZE} bytes"
            )));
        }

        Ok(Self {
            wring: RingBuffer::with_capacity(config.write_buffer_size),
            rring: RingBuffer::with_capacity(config.read_buffer_size),
            recv_ch: DEFAULT_CHANNEL,
            recv_remaining: 0,
            esc: config.esc,
        })
    }

    /// Framed bytes buffered for transmission.
    pub fn pending_out(&self) -> usize {
        self.wring.used()
    }

    /// Wire bytes buffered for decoding.
    pub fn pending_in(&self) -> usize {
        self.rring.used()
    }

    /// Queue payload bytes for transmission on `channel`.
    ///
    /// Returns how many payload bytes were accepted into the outbound ring;
    /// the caller retries with the unaccepted tail once `write_out` has made
    /// room. A non-default channel costs a four-byte header, which is only
    /// emitted when the ring can hold it plus at least one payload byte.
    /// A single call accepts at most [`MAX_FRAME_PAYLOAD`] bytes; larger
    /// writes are chunked across calls.
    pub fn send(&mut self, channel: ChannelId, input: &[u8]) -> usize {
        if input.is_empty() {
            return 0;
        }
        let count = input.len().min(MAX_FRAME_PAYLOAD);

        // The size field is not known until the payload loop finishes, so
        // remember where it lives and patch it afterwards.
        let mut size_at = None;
        if channel != DEFAULT_CHANNEL {
            if self.wring.free() < HEADER_SIZE + 1 {
                return 0;
            }
            let header = FrameHeader::new(channel, 0).encode(self.esc);
            self.wring.push(header[0]);
            self.wring.push(header[1]);
            let at = self.wring.head_index();
            self.wring.push(header[2]);
            self.wring.push(header[3]);
            size_at = Some(at);
        }

        let mut accepted = 0;
        for &byte in &input[..count] {
            if byte == self.esc {
                // A literal escape byte expands to two wire bytes.
                if self.wring.free() < 2 {
                    break;
                }
                self.wring.push(self.esc);
                self.wring.push(0);
            } else {
                if self.wring.is_full() {
                    break;
                }
                self.wring.push(byte);
            }
            accepted += 1;
        }

        if let Some(at) = size_at {
            self.wring.set(at, (accepted >> 8) as u8);
            self.wring.set(self.wring.next_index(at), (accepted & 0xff) as u8);
        }

        accepted
    }

    /// Extract decoded payload bytes into `buf`.
    ///
    /// Returns the channel the bytes belong to and their count, or `None`
    /// when nothing could be delivered. One call delivers bytes from exactly
    /// one channel; it stops early at a channel boundary even if `buf` still
    /// has room. A partially received escape sequence or channel-switch
    /// header is left in the ring untouched until more wire bytes arrive.
    pub fn recv(&mut self, buf: &mut [u8]) -> Option<(ChannelId, usize)> {
        let mut ch = self.recv_ch;
        let mut remaining = self.recv_remaining;
        let mut out_ch = ch;
        let mut consumed = 0;
        let mut delivered = 0;
        let used = self.rring.used();

        while delivered < buf.len()
            && (ch == DEFAULT_CHANNEL || remaining > 0)
            && consumed < used
        {
            let token_start = consumed;
            let byte = self.rring.get(consumed);

            if byte != self.esc {
                buf[delivered] = byte;
                delivered += 1;
                consumed += 1;
                if ch != DEFAULT_CHANNEL {
                    remaining -= 1;
                }
                continue;
            }

            consumed += 1;
            if consumed == used {
                // Escape with no follow byte yet; rewind and wait.
                consumed = token_start;
                break;
            }

            if self.rring.get(consumed) == 0 {
                buf[delivered] = self.esc;
                delivered += 1;
                consumed += 1;
                if ch != DEFAULT_CHANNEL {
                    remaining -= 1;
                }
                continue;
            }

            // Channel-switch header.
            if used - consumed < CHANNEL_BYTES + SIZE_BYTES {
                consumed = token_start;
                break;
            }
            let header = FrameHeader::parse(
                self.rring.get(consumed),
                self.rring.get(consumed + 1),
                self.rring.get(consumed + 2),
            );
            consumed += CHANNEL_BYTES + SIZE_BYTES;
            ch = header.channel;
            remaining = usize::from(header.size);
            if delivered > 0 {
                // One delivery serves one channel. The header is committed;
                // the next call starts delivering for the new channel.
                break;
            }
            out_ch = ch;
        }

        self.rring.consume(consumed);
        if ch != DEFAULT_CHANNEL && remaining == 0 {
            // Frame exhausted: fall back to the default channel before the
            // next byte is classified.
            ch = DEFAULT_CHANNEL;
        }
        self.recv_ch = ch;
        self.recv_remaining = remaining;

        if delivered > 0 {
            Some((out_ch, delivered))
        } else {
            None
        }
    }

    /// Drain the outbound ring through `sink`.
    ///
    /// The sink is handed the largest contiguous region of the ring and
    /// reports how many bytes it accepted; only accepted bytes are dropped
    /// from the ring, so a failing write is effectively undone. Returns the
    /// bytes still pending: 0 means drained, anything above is backpressure
    /// (the sink returned 0 or would have blocked).
    pub fn write_out<W>(&mut self, mut sink: W) -> Result<usize>
    where
        W: FnMut(&[u8]) -> Result<usize>,
    {
        while !self.wring.is_empty() {
            let span = self.wring.read_span();
            let span_len = span.len();
            match sink(span) {
                Ok(0) => break,
                Ok(n) => self.wring.consume(n.min(span_len)),
                Err(SmuxError::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(SmuxError::Io(ref e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self.wring.used())
    }

    /// Fill the inbound ring from `source`.
    ///
    /// The source writes into the largest contiguous free region of the ring
    /// (one slot is always held back so full and empty stay distinguishable).
    /// Stops when the ring is full, when the source delivers less than asked
    /// for, or on error. Returns the free bytes left in the ring: 0 means the
    /// ring is full and `recv` must run before more wire bytes fit.
    pub fn read_in<R>(&mut self, mut source: R) -> Result<usize>
    where
        R: FnMut(&mut [u8]) -> Result<usize>,
    {
        loop {
            let span = self.rring.write_span();
            if span.is_empty() {
                return Ok(0);
            }
            let want = span.len();
            match source(span) {
                Ok(0) => return Ok(self.rring.free()),
                Ok(n) => {
                    self.rring.commit_write(n.min(want));
                    if n < want {
                        return Ok(self.rring.free());
                    }
                }
                Err(SmuxError::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(self.rring.free());
                }
                Err(SmuxError::Io(ref e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Copy wire bytes into the inbound ring without a callback, for
    /// pull-based integrations. Returns how many bytes fit.
    pub fn ingest(&mut self, mut bytes: &[u8]) -> usize {
        let mut copied = 0;
        while !bytes.is_empty() {
            let span = self.rring.write_span();
            if span.is_empty() {
                break;
            }
            let n = span.len().min(bytes.len());
            span[..n].copy_from_slice(&bytes[..n]);
            self.rring.commit_write(n);
            copied += n;
            bytes = &bytes[n..];
        }
        copied
    }

    /// Copy framed bytes out of the outbound ring into `buf`, the pull-based
    /// sibling of `write_out`. Returns how many bytes were copied.
    pub fn emit(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let span = self.wring.read_span();
            if span.is_empty() {
                break;
            }
            let n = span.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&span[..n]);
            self.wring.consume(n);
            copied += n;
        }
        copied
    }
}
