//! An in-memory [`Transport`] double for exercising the applier without a
//! real connection. Used by this crate's own tests; exposed publicly so
//! an embedding application can write its own applier tests the same way.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// A queue of pre-framed messages, each a `(kind, payload)` pair.
/// `ensure_chunk` drip-feeds bytes from the current message's payload,
/// returning `Ok` (possibly short of `min_len`) once the payload is
/// exhausted, matching a real transport's "message ended" behavior.
pub struct MemoryTransport {
    pub messages: VecDeque<(u8, BytesMut)>,
    pending: BytesMut,
}

impl MemoryTransport {
    pub fn new(kind: u8, payload: &[u8]) -> Self {
        Self {
            messages: VecDeque::from([(kind, BytesMut::from(payload))]),
            pending: BytesMut::new(),
        }
    }
}

impl Transport for MemoryTransport {
    fn begin_message(&mut self, _deadline: Instant) -> Result<u8> {
        let (kind, payload) = self
            .messages
            .pop_front()
            .ok_or_else(|| Error::network("no more messages"))?;
        self.pending = payload;
        Ok(kind)
    }

    fn ensure_chunk(&mut self, buf: &mut BytesMut, min_len: usize, _deadline: Instant) -> Result<()> {
        if buf.len() < min_len {
            let need = min_len - buf.len();
            let take = need.min(self.pending.len());
            let chunk = self.pending.split_to(take);
            buf.extend_from_slice(&chunk);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_up_to_min_len_when_available() {
        let mut t = MemoryTransport::new(1, b"0123456789");
        let mut buf = BytesMut::new();
        t.ensure_chunk(&mut buf, 5, Instant::now()).unwrap();
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn returns_short_buffer_on_message_end() {
        let mut t = MemoryTransport::new(1, b"ab");
        let mut buf = BytesMut::new();
        t.ensure_chunk(&mut buf, 10, Instant::now()).unwrap();
        assert_eq!(&buf[..], b"ab");
    }
}
