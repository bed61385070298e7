//! Revision comparator (C5).
//!
//! A revision token is an opaque byte string whose contents are a single
//! C1-encoded unsigned integer. Two tokens are comparable by decoding both
//! and comparing the integers; malformed tokens are the peer's fault
//! (`Error::Network`), since they only ever arrive over the wire.

use crate::codec::{encode_uint_vec, Cursor};
use crate::error::{Error, Result};

/// A committed revision number of a database directory.
pub type Revision = u64;

/// Decode a revision token previously produced by [`encode_revision`].
pub fn decode_revision(token: &[u8]) -> Result<Revision> {
    let mut cursor = Cursor::new(token);
    let value = cursor
        .decode_uint()
        .map_err(|_| Error::network("Invalid revision string supplied"))?;
    Ok(value)
}

/// Re-encode a revision number as an opaque token, the form the applier
/// hands back to the caller for the master's requested next revision.
pub fn encode_revision(rev: Revision) -> Vec<u8> {
    encode_uint_vec(rev)
}

/// Decode both tokens and return whether `a >= b`.
pub fn revision_at_least(a: &[u8], b: &[u8]) -> Result<bool> {
    Ok(decode_revision(a)? >= decode_revision(b)?)
}
