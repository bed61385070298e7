//! Chunked message reader (C2).
//!
//! The applier never talks to a socket directly: it drives an abstract
//! [`Transport`], backed by a real connection in production and an
//! in-memory double in tests. The transport is assumed to deliver a
//! reliable, chunked byte stream with a header byte per message and a
//! deadline on every blocking read; producing or framing that stream is
//! the transport's job, not the applier's.

use std::time::Instant;

use bytes::BytesMut;

use crate::error::Result;

/// Minimum top-up size used opportunistically to amortize transport reads.
/// Correctness never depends on this value: callers always re-check
/// `buf.len()` against the exact length they actually need and raise their
/// own `Network` error if it's short, the same way the original
/// implementation calls `get_message_chunk` with this as a convenience
/// batch size and then checks lengths explicitly afterward.
pub const REASONABLE_CHANGESET_SIZE: usize = 4096;

/// A source of framed, deadline-bounded bytes.
///
/// Implementations block the calling thread, appending bytes to `buf` as
/// they arrive, until either `buf.len() >= min_len`, the current message
/// is exhausted (nothing more to read until the next message), or
/// `deadline` passes while more bytes are still expected. Only the last
/// case is a failure; an exhausted message is reported as `Ok` with
/// `buf` possibly still short of `min_len` — it is the caller's job to
/// notice that and raise its own `Error::Network` ("unexpected end of
/// changeset"), exactly as callers in this crate do.
pub trait Transport {
    /// Consume the next framed message header, returning its type byte.
    fn begin_message(&mut self, deadline: Instant) -> Result<u8>;

    /// See the trait-level documentation for the blocking contract.
    fn ensure_chunk(&mut self, buf: &mut BytesMut, min_len: usize, deadline: Instant)
        -> Result<()>;
}
