//! Per-connection framing state for the SSH agent wire protocol.
//!
//! Every request and reply is a length-prefixed frame:
//!
//! ```text
//! [u32 BE length] [payload: length bytes]
//! ```
//!
//! [`FrameBuffer`] assembles one request at a time from arbitrarily
//! fragmented reads, hands the complete frame out for dispatch, then
//! streams the reply back through partial writes. The protocol is strictly
//! request/reply per connection, so the buffer only ever holds one of the
//! two directions.

use std::cmp::Ordering;
use std::io::{self, Write};

use bytes::{Bytes, BytesMut};

use crate::constants::{FAILURE_REPLY, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};

/// Progress reported by [`FrameBuffer::feed`] and [`FrameBuffer::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// More bytes are needed (read side) or still unsent (write side).
    Incomplete,
    /// The frame is fully received, or the reply fully sent.
    Complete,
}

/// Which half of the request/reply cycle a connection is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accumulating bytes of the next request.
    AwaitingRequest,
    /// A complete request is waiting for its reply to be produced.
    AwaitingDispatch,
    /// A reply is buffered and partly (or not yet) written.
    SendingReply,
}

/// Connection-level failure. Always fatal to the connection, never to the server.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed its end (a zero-length read).
    #[error("peer closed the connection")]
    PeerClosed,

    /// The length prefix declares a frame above [`MAX_FRAME_LEN`].
    #[error("frame too large: {declared} bytes (max {MAX_FRAME_LEN})")]
    Oversized {
        /// Total frame size implied by the prefix.
        declared: usize,
    },

    /// More bytes arrived than the length prefix declared.
    #[error("received {received} bytes for a {declared}-byte frame")]
    Overrun {
        /// Total frame size implied by the prefix.
        declared: usize,
        /// Bytes actually accumulated.
        received: usize,
    },

    /// The writer claimed to have sent more than the reply holds.
    #[error("writer reported {sent} bytes sent of a {total}-byte reply")]
    SendOverrun {
        /// Bytes reported sent so far.
        sent: usize,
        /// Total reply length.
        total: usize,
    },

    /// An operation was attempted in the wrong half of the cycle.
    #[error("operation not valid while {0:?}")]
    OutOfTurn(ConnectionState),

    /// Underlying socket error.
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Total frame length (prefix included) declared by the first four bytes.
///
/// Returns `None` until at least [`LENGTH_PREFIX_LEN`] bytes are present.
pub fn declared_frame_len(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_LEN] = buf.get(..LENGTH_PREFIX_LEN)?.try_into().ok()?;
    // Saturates on 32-bit targets; anything that large is oversized anyway.
    let payload = usize::try_from(u32::from_be_bytes(prefix)).unwrap_or(usize::MAX);
    Some(payload.saturating_add(LENGTH_PREFIX_LEN))
}

/// Returns `true` if `frame` is exactly one frame within the size limit.
pub fn is_well_formed(frame: &[u8]) -> bool {
    declared_frame_len(frame)
        .is_some_and(|total| total == frame.len() && total <= MAX_FRAME_LEN)
}

/// Encode `payload` as a single frame.
///
/// # Panics
///
/// Panics if `payload` cannot be described by a `u32` length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let length = u32::try_from(payload.len()).expect("payload length exceeds u32");
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Request/reply buffer for one client connection.
#[derive(Debug)]
pub struct FrameBuffer {
    request: BytesMut,
    reply: Bytes,
    sent: usize,
    state: ConnectionState,
}

impl FrameBuffer {
    /// Create an empty buffer awaiting its first request.
    pub fn new() -> Self {
        Self {
            request: BytesMut::new(),
            reply: Bytes::new(),
            sent: 0,
            state: ConnectionState::AwaitingRequest,
        }
    }

    /// Current position in the request/reply cycle.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns true if part of a request has been buffered.
    pub fn has_partial_request(&self) -> bool {
        !self.request.is_empty()
    }

    /// Append bytes read from the client.
    ///
    /// Returns [`FrameStatus::Complete`] once exactly one whole frame is
    /// buffered; the frame is then available from [`take_request`].
    ///
    /// An empty `bytes` slice is a zero-length read and means the peer
    /// closed the connection.
    ///
    /// [`take_request`]: FrameBuffer::take_request
    pub fn feed(&mut self, bytes: &[u8]) -> Result<FrameStatus, FrameError> {
        if self.state != ConnectionState::AwaitingRequest {
            return Err(FrameError::OutOfTurn(self.state));
        }
        if bytes.is_empty() {
            return Err(FrameError::PeerClosed);
        }

        self.request.extend_from_slice(bytes);

        let Some(declared) = declared_frame_len(&self.request) else {
            return Ok(FrameStatus::Incomplete);
        };
        if declared > MAX_FRAME_LEN {
            return Err(FrameError::Oversized { declared });
        }

        match self.request.len().cmp(&declared) {
            Ordering::Less => Ok(FrameStatus::Incomplete),
            Ordering::Equal => {
                self.state = ConnectionState::AwaitingDispatch;
                Ok(FrameStatus::Complete)
            }
            Ordering::Greater => Err(FrameError::Overrun {
                declared,
                received: self.request.len(),
            }),
        }
    }

    /// Hand out the complete request frame, prefix included.
    ///
    /// Returns `None` unless a frame has just completed.
    pub fn take_request(&mut self) -> Option<Bytes> {
        if self.state != ConnectionState::AwaitingDispatch || self.request.is_empty() {
            return None;
        }
        Some(self.request.split().freeze())
    }

    /// Install the backend's reply and switch to the write side.
    ///
    /// `None`, or anything that is not a single well-formed frame, is
    /// replaced by [`FAILURE_REPLY`]. Returns `true` when the fallback
    /// was used.
    pub fn set_reply(&mut self, reply: Option<Vec<u8>>) -> Result<bool, FrameError> {
        if self.state != ConnectionState::AwaitingDispatch {
            return Err(FrameError::OutOfTurn(self.state));
        }

        let (reply, fallback) = match reply {
            Some(frame) if is_well_formed(&frame) => (Bytes::from(frame), false),
            _ => (Bytes::from_static(&FAILURE_REPLY), true),
        };

        self.request.clear();
        self.reply = reply;
        self.sent = 0;
        self.state = ConnectionState::SendingReply;
        Ok(fallback)
    }

    /// The part of the reply not yet confirmed sent.
    pub fn pending_reply(&self) -> &[u8] {
        self.reply.get(self.sent..).unwrap_or_default()
    }

    /// Write as much of the pending reply as `writer` accepts.
    ///
    /// A `WouldBlock` from the writer yields [`FrameStatus::Incomplete`];
    /// call again when the socket is writable. On [`FrameStatus::Complete`]
    /// the buffer is reset and ready for the next request.
    pub fn drain<W: Write>(&mut self, writer: &mut W) -> Result<FrameStatus, FrameError> {
        if self.state != ConnectionState::SendingReply {
            return Err(FrameError::OutOfTurn(self.state));
        }

        loop {
            let total = self.reply.len();
            if self.sent == total {
                self.finish_reply();
                return Ok(FrameStatus::Complete);
            }

            match writer.write(&self.reply[self.sent..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    if self.sent + n > total {
                        return Err(FrameError::SendOverrun {
                            sent: self.sent + n,
                            total,
                        });
                    }
                    self.sent += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FrameStatus::Incomplete);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn finish_reply(&mut self) {
        self.reply = Bytes::new();
        self.sent = 0;
        self.request.clear();
        self.state = ConnectionState::AwaitingRequest;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts at most `chunk` bytes per call and reports
    /// `WouldBlock` on every other call.
    struct TrickleWriter {
        out: Vec<u8>,
        chunk: usize,
        block_next: bool,
    }

    impl TrickleWriter {
        fn new(chunk: usize) -> Self {
            Self { out: Vec::new(), chunk, block_next: false }
        }
    }

    impl Write for TrickleWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.block_next = true;
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer that lies about how much it wrote.
    struct BoastingWriter;

    impl Write for BoastingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len() + 1)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn drain_fully(buf: &mut FrameBuffer, writer: &mut TrickleWriter) -> usize {
        let mut calls = 0;
        loop {
            calls += 1;
            match buf.drain(writer).unwrap() {
                FrameStatus::Complete => return calls,
                FrameStatus::Incomplete => {}
            }
        }
    }

    #[test]
    fn test_whole_frame_completes() {
        let frame = encode_frame(&[11, 1, 2, 3]);
        let mut buf = FrameBuffer::new();
        assert_eq!(buf.feed(&frame).unwrap(), FrameStatus::Complete);
        assert_eq!(buf.state(), ConnectionState::AwaitingDispatch);
        assert_eq!(buf.take_request().unwrap().as_ref(), frame.as_slice());
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = encode_frame(b"request-payload");
        let mut buf = FrameBuffer::new();
        for (i, byte) in frame.iter().enumerate() {
            let status = buf.feed(&[*byte]).unwrap();
            if i < frame.len() - 1 {
                assert_eq!(status, FrameStatus::Incomplete);
                assert!(buf.has_partial_request());
            } else {
                assert_eq!(status, FrameStatus::Complete);
            }
        }
        assert_eq!(buf.take_request().unwrap().as_ref(), frame.as_slice());
    }

    #[test]
    fn test_split_inside_length_prefix() {
        let frame = encode_frame(&[0xAA; 300]);
        let mut buf = FrameBuffer::new();
        assert_eq!(buf.feed(&frame[..2]).unwrap(), FrameStatus::Incomplete);
        assert_eq!(buf.feed(&frame[2..150]).unwrap(), FrameStatus::Incomplete);
        assert_eq!(buf.feed(&frame[150..]).unwrap(), FrameStatus::Complete);
        assert_eq!(buf.take_request().unwrap().len(), frame.len());
    }

    #[test]
    fn test_empty_payload_is_a_complete_frame() {
        let mut buf = FrameBuffer::new();
        assert_eq!(buf.feed(&[0, 0, 0, 0]).unwrap(), FrameStatus::Complete);
    }

    #[test]
    fn test_zero_length_read_is_peer_close() {
        let mut buf = FrameBuffer::new();
        assert!(matches!(buf.feed(&[]), Err(FrameError::PeerClosed)));
    }

    #[test]
    fn test_oversized_declared_length_rejected() {
        let length = (MAX_FRAME_LEN - LENGTH_PREFIX_LEN + 1) as u32;
        let mut buf = FrameBuffer::new();
        let err = buf.feed(&length.to_be_bytes()).unwrap_err();
        assert!(
            matches!(err, FrameError::Oversized { declared } if declared == MAX_FRAME_LEN + 1),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_maximal_u32_length_rejected_without_overflow() {
        let mut buf = FrameBuffer::new();
        let err = buf.feed(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(
            matches!(err, FrameError::Oversized { declared } if declared > MAX_FRAME_LEN),
            "unexpected error: {err}"
        );
        assert!(declared_frame_len(&[0xFF; 4]).is_some_and(|total| total >= u32::MAX as usize));
        assert!(!is_well_formed(&[0xFF, 0xFF, 0xFF, 0xFF, 11]));
    }

    #[test]
    fn test_largest_legal_frame_accepted() {
        let payload = vec![0x42u8; MAX_FRAME_LEN - LENGTH_PREFIX_LEN];
        let frame = encode_frame(&payload);
        let mut buf = FrameBuffer::new();
        assert_eq!(buf.feed(&frame).unwrap(), FrameStatus::Complete);
    }

    #[test]
    fn test_trailing_bytes_are_an_overrun() {
        let mut bytes = encode_frame(b"abc");
        bytes.push(0xFF);
        let mut buf = FrameBuffer::new();
        let err = buf.feed(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::Overrun { declared: 7, received: 8 }));
    }

    #[test]
    fn test_feed_while_awaiting_dispatch_is_out_of_turn() {
        let mut buf = FrameBuffer::new();
        buf.feed(&encode_frame(b"x")).unwrap();
        assert!(matches!(
            buf.feed(b"more"),
            Err(FrameError::OutOfTurn(ConnectionState::AwaitingDispatch))
        ));
    }

    #[test]
    fn test_missing_reply_becomes_failure_frame() {
        let mut buf = FrameBuffer::new();
        buf.feed(&encode_frame(&[11])).unwrap();
        buf.take_request().unwrap();
        assert!(buf.set_reply(None).unwrap());
        assert_eq!(buf.pending_reply(), &[0, 0, 0, 1, 5]);
    }

    #[test]
    fn test_malformed_reply_becomes_failure_frame() {
        let mut buf = FrameBuffer::new();
        buf.feed(&encode_frame(&[11])).unwrap();
        // Declares 9 payload bytes but carries 2.
        assert!(buf.set_reply(Some(vec![0, 0, 0, 9, 1, 2])).unwrap());
        assert_eq!(buf.pending_reply(), &FAILURE_REPLY);
    }

    #[test]
    fn test_reply_drains_in_single_byte_writes() {
        let reply = encode_frame(b"identities-answer");
        let mut buf = FrameBuffer::new();
        buf.feed(&encode_frame(&[11])).unwrap();
        assert!(!buf.set_reply(Some(reply.clone())).unwrap());

        let mut writer = TrickleWriter::new(1);
        drain_fully(&mut buf, &mut writer);
        assert_eq!(writer.out, reply);
        assert_eq!(buf.state(), ConnectionState::AwaitingRequest);
        assert!(buf.pending_reply().is_empty());
    }

    #[test]
    fn test_reply_drains_in_chunks() {
        let reply = encode_frame(&[7u8; 1000]);
        let mut buf = FrameBuffer::new();
        buf.feed(&encode_frame(&[11])).unwrap();
        buf.set_reply(Some(reply.clone())).unwrap();

        let mut writer = TrickleWriter::new(333);
        drain_fully(&mut buf, &mut writer);
        assert_eq!(writer.out, reply);
    }

    #[test]
    fn test_overreporting_writer_is_a_violation() {
        let mut buf = FrameBuffer::new();
        buf.feed(&encode_frame(&[11])).unwrap();
        buf.set_reply(None).unwrap();
        let err = buf.drain(&mut BoastingWriter).unwrap_err();
        assert!(matches!(err, FrameError::SendOverrun { sent: 6, total: 5 }));
    }

    #[test]
    fn test_drain_before_reply_is_out_of_turn() {
        let mut buf = FrameBuffer::new();
        let mut writer = TrickleWriter::new(8);
        assert!(matches!(
            buf.drain(&mut writer),
            Err(FrameError::OutOfTurn(ConnectionState::AwaitingRequest))
        ));
    }

    #[test]
    fn test_second_cycle_has_no_residue() {
        let mut buf = FrameBuffer::new();
        let mut writer = TrickleWriter::new(2);

        let first = encode_frame(b"first request");
        buf.feed(&first).unwrap();
        assert_eq!(buf.take_request().unwrap().as_ref(), first.as_slice());
        buf.set_reply(Some(encode_frame(b"one"))).unwrap();
        drain_fully(&mut buf, &mut writer);

        let second = encode_frame(b"2nd");
        assert!(!buf.has_partial_request());
        assert_eq!(buf.feed(&second).unwrap(), FrameStatus::Complete);
        assert_eq!(buf.take_request().unwrap().as_ref(), second.as_slice());
        buf.set_reply(Some(encode_frame(b"two"))).unwrap();
        drain_fully(&mut buf, &mut writer);

        let mut expected = encode_frame(b"one");
        expected.extend_from_slice(&encode_frame(b"two"));
        assert_eq!(writer.out, expected);
    }

    #[test]
    fn test_is_well_formed() {
        assert!(is_well_formed(&FAILURE_REPLY));
        assert!(is_well_formed(&[0, 0, 0, 0]));
        assert!(!is_well_formed(&[0, 0, 0]));
        assert!(!is_well_formed(&[0, 0, 0, 2, 1]));
    }
}
