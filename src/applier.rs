//! Changeset applier (C6) — the core driver.
//!
//! Drives a single changeset stream end to end: acquires the directory
//! write lock, validates the header, enforces the revision precondition,
//! dispatches each item to the base-file rewriter (C7) or block patcher
//! (C8), validates the trailer, and returns the master's requested next
//! revision as a re-encoded token.
//!
//! State machine (one session):
//!
//! ```text
//! INIT -> LOCKED -> HEADER_OK -> ITEMS* -> TRAILER_OK -> DONE
//!                                 \-> any decode/IO failure -> FAIL (lock released)
//! ```

use std::path::Path;
use std::time::Instant;

use bytes::BytesMut;

use crate::basefile::{apply_base_chunk, DrainConsumed};
use crate::blockfile::apply_blocks_chunk;
use crate::codec::{Cursor, DecodeError};
use crate::error::{Error, Result};
use crate::lock::DirectoryLock;
use crate::revision::{encode_revision, Revision};
use crate::transport::{Transport, REASONABLE_CHANGESET_SIZE};

/// The changeset wire format's fixed magic, distinct from the version
/// file's magic.
pub const CHANGES_MAGIC_STRING: &[u8; 12] = b"FLINTCHANGE\0";
/// The changeset format version this applier understands.
pub const CHANGES_VERSION: u64 = 1;
/// The inbound message kind byte that precedes a changeset stream.
pub const REPL_REPLY_CHANGESET: u8 = 0x02;

const CHUNK_TYPE_END: u8 = 0;
const CHUNK_TYPE_BASE: u8 = 1;
const CHUNK_TYPE_BLOCKS: u8 = 2;

/// Supplies the database's current on-disk revision number, when it is
/// known. This is an external collaborator by design: the table engine
/// that reads the patched files is someone else's concern, so the
/// applier only needs to compare a single integer against
/// `start_revision`, not to understand table internals.
pub trait RevisionSource {
    /// Return the revision the record table is currently open at.
    fn current_revision(&self, dir: &Path) -> Result<Revision>;
}

/// Tunables for a single apply session. The only knob is the opportunistic
/// transport top-up size (§4.2): correctness never depends on its value,
/// only how many `Transport::ensure_chunk` round-trips a session needs, so
/// tests can shrink it to exercise the refill-retry loops without faking a
/// slow transport.
#[derive(Debug, Clone, Copy)]
pub struct ApplierConfig {
    pub reasonable_changeset_size: usize,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self { reasonable_changeset_size: REASONABLE_CHANGESET_SIZE }
    }
}

/// Entry point for the core algorithm. `valid` indicates whether the
/// local database is known to be at a well-defined revision (if not, the
/// revision precondition check in step 4 is skipped, since there is no
/// trustworthy `R_now` to compare against).
pub fn apply_changeset_from_conn(
    dir: &Path,
    transport: &mut dyn Transport,
    deadline: Instant,
    valid: bool,
    revision_source: &dyn RevisionSource,
) -> Result<Vec<u8>> {
    apply_changeset_from_conn_with_config(
        dir,
        transport,
        deadline,
        valid,
        revision_source,
        &ApplierConfig::default(),
    )
}

/// Same as [`apply_changeset_from_conn`], but with the transport top-up
/// size overridable via `config`.
pub fn apply_changeset_from_conn_with_config(
    dir: &Path,
    transport: &mut dyn Transport,
    deadline: Instant,
    valid: bool,
    revision_source: &dyn RevisionSource,
    config: &ApplierConfig,
) -> Result<Vec<u8>> {
    let chunk_hint = config.reasonable_changeset_size;
    tracing::debug!(dir = %dir.display(), valid, "applying changeset");

    let _lock = DirectoryLock::acquire(dir, true)?;

    let kind = transport.begin_message(deadline)?;
    if kind != REPL_REPLY_CHANGESET {
        return Err(Error::network(format!(
            "Expected REPL_REPLY_CHANGESET, got message kind {kind}"
        )));
    }

    let mut buf = BytesMut::new();
    transport.ensure_chunk(&mut buf, chunk_hint, deadline)?;

    let (start_revision, end_revision, header_len) = loop {
        match try_read_header(&buf)? {
            Some(parsed) => break parsed,
            None => {
                let before = buf.len();
                transport.ensure_chunk(&mut buf, before + chunk_hint, deadline)?;
                if buf.len() == before {
                    return Err(Error::network("Unexpected end of changeset"));
                }
            }
        }
    };
    buf.advance_consumed(header_len);

    if valid {
        let r_now = revision_source.current_revision(dir)?;
        if r_now != start_revision {
            return Err(Error::network("Changeset supplied is for wrong revision number"));
        }
    }

    loop {
        transport.ensure_chunk(&mut buf, chunk_hint, deadline)?;
        if buf.is_empty() {
            return Err(Error::network("Unexpected end of changeset"));
        }

        let chunk_type = buf[0];
        buf.advance_consumed(1);

        match chunk_type {
            CHUNK_TYPE_END => break,
            CHUNK_TYPE_BASE | CHUNK_TYPE_BLOCKS => {
                let table = read_table_name(&mut buf, transport, deadline, chunk_hint)?;
                transport.ensure_chunk(&mut buf, 1, deadline)?;
                if buf.is_empty() {
                    return Err(Error::network("Unexpected end of changeset"));
                }
                if chunk_type == CHUNK_TYPE_BASE {
                    apply_base_chunk(dir, &table, &mut buf, transport, deadline)?;
                } else {
                    apply_blocks_chunk(dir, &table, &mut buf, transport, deadline)?;
                }
            }
            other => {
                return Err(Error::network(format!(
                    "Unrecognised item type in changeset: {other}"
                )))
            }
        }
    }

    let required_revision = read_trailer(&mut buf, transport, deadline, end_revision, chunk_hint)?;

    tracing::debug!(required_revision, "changeset applied successfully");

    Ok(encode_revision(required_revision))
}

/// Try to parse the fixed changeset prefix (magic, version, start/end
/// revision, changes_type) out of `buf`. Returns `Ok(None)` when `buf`
/// doesn't yet hold enough bytes to tell (the caller should pull more and
/// retry); returns `Err` for anything that can never become valid no
/// matter how much more arrives (bad magic, bad version, non-monotonic
/// revisions, DANGEROUS mode). On success, also returns how many bytes of
/// `buf` the prefix occupied, so the caller can drain them.
fn try_read_header(buf: &BytesMut) -> Result<Option<(Revision, Revision, usize)>> {
    if buf.len() < CHANGES_MAGIC_STRING.len() {
        return Ok(None);
    }
    if &buf[..CHANGES_MAGIC_STRING.len()] != CHANGES_MAGIC_STRING.as_slice() {
        return Err(Error::network("Invalid ChangeSet magic string"));
    }

    let mut cursor = Cursor::new(&buf[CHANGES_MAGIC_STRING.len()..]);

    let version = match cursor.decode_uint() {
        Ok(v) => v,
        Err(DecodeError::NeedMore) => return Ok(None),
        Err(DecodeError::Malformed) => {
            return Err(Error::network("Couldn't read a valid version number from changeset"))
        }
    };
    if version != CHANGES_VERSION {
        return Err(Error::network("Unsupported changeset version"));
    }

    let start_revision = match cursor.decode_uint() {
        Ok(v) => v,
        Err(DecodeError::NeedMore) => return Ok(None),
        Err(DecodeError::Malformed) => {
            return Err(Error::network("Couldn't read a valid start revision from changeset"))
        }
    };
    let end_revision = match cursor.decode_uint() {
        Ok(v) => v,
        Err(DecodeError::NeedMore) => return Ok(None),
        Err(DecodeError::Malformed) => {
            return Err(Error::network("Couldn't read a valid end revision from changeset"))
        }
    };
    if end_revision <= start_revision {
        return Err(Error::network(
            "End revision in changeset is not later than start revision",
        ));
    }

    let changes_type = match cursor.decode_byte() {
        Ok(b) => b,
        Err(_) => return Ok(None),
    };
    if changes_type != 0 {
        return Err(Error::network(format!(
            "Unsupported changeset type (got {changes_type})"
        )));
    }

    let header_len = CHANGES_MAGIC_STRING.len() + cursor.consumed();
    Ok(Some((start_revision, end_revision, header_len)))
}

fn read_table_name(
    buf: &mut BytesMut,
    transport: &mut dyn Transport,
    deadline: Instant,
    chunk_hint: usize,
) -> Result<String> {
    loop {
        let mut cursor = Cursor::new(&buf[..]);
        match cursor.decode_string() {
            Ok(name) => {
                if name.is_empty() {
                    return Err(Error::network("Missing tablename in changeset"));
                }
                if !name.iter().all(|&b| b.is_ascii_lowercase()) {
                    return Err(Error::network("Invalid character in tablename in changeset"));
                }
                let name = String::from_utf8(name.to_vec())
                    .map_err(|_| Error::network("Invalid character in tablename in changeset"))?;
                let consumed = cursor.consumed();
                buf.advance_consumed(consumed);
                return Ok(name);
            }
            Err(DecodeError::NeedMore) => {
                let before = buf.len();
                transport.ensure_chunk(buf, before + chunk_hint, deadline)?;
                if buf.len() == before {
                    return Err(Error::network("Unexpected end of changeset"));
                }
            }
            Err(DecodeError::Malformed) => {
                return Err(Error::network("Unexpected end of changeset"))
            }
        }
    }
}

fn read_trailer(
    buf: &mut BytesMut,
    transport: &mut dyn Transport,
    deadline: Instant,
    end_revision: Revision,
    chunk_hint: usize,
) -> Result<Revision> {
    transport.ensure_chunk(buf, chunk_hint, deadline)?;

    let mut cursor = Cursor::new(&buf[..]);
    let required_revision = cursor
        .decode_uint()
        .map_err(|_| Error::network("Couldn't read a valid required revision from changeset"))?;
    if required_revision < end_revision {
        return Err(Error::network(
            "Required revision in changeset is earlier than end revision",
        ));
    }

    if !cursor.is_empty() {
        return Err(Error::network("Junk found at end of changeset"));
    }

    let consumed = cursor.consumed();
    buf.advance_consumed(consumed);

    if !buf.is_empty() {
        return Err(Error::network("Junk found at end of changeset"));
    }

    Ok(required_revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_string, encode_uint};
    use crate::error::LockFailure;
    use crate::revision::decode_revision;
    use crate::testing::MemoryTransport;
    use std::fs;

    struct FixedRevision(Revision);

    impl RevisionSource for FixedRevision {
        fn current_revision(&self, _dir: &Path) -> Result<Revision> {
            Ok(self.0)
        }
    }

    struct UnreachableRevision;

    impl RevisionSource for UnreachableRevision {
        fn current_revision(&self, _dir: &Path) -> Result<Revision> {
            panic!("revision source should not be consulted when valid=false")
        }
    }

    fn header(start: u64, end: u64, changes_type: u8) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(CHANGES_MAGIC_STRING.as_slice());
        encode_uint(CHANGES_VERSION, &mut out);
        encode_uint(start, &mut out);
        encode_uint(end, &mut out);
        out.push(changes_type);
        out
    }

    fn item_base(table: &str, letter: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![CHUNK_TYPE_BASE];
        encode_string(table.as_bytes(), &mut out);
        out.push(letter);
        encode_uint(data.len() as u64, &mut out);
        out.extend_from_slice(data);
        out
    }

    fn end_marker_and_trailer(required: u64) -> Vec<u8> {
        let mut out = vec![CHUNK_TYPE_END];
        encode_uint(required, &mut out);
        out
    }

    #[test]
    fn empty_item_list_succeeds_and_returns_required_revision() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(7, 8, 0);
        stream.extend(end_marker_and_trailer(8));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        let result = apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
        )
        .unwrap();

        assert_eq!(decode_revision(&result).unwrap(), 8);
    }

    #[test]
    fn base_file_rewrite_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(7, 8, 0);
        stream.extend(item_base("p", b'A', b"HELLO"));
        stream.extend(end_marker_and_trailer(8));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
        )
        .unwrap();

        assert_eq!(fs::read(dir.path().join("p.baseA")).unwrap(), b"HELLO");
        assert!(!dir.path().join("ptmp").exists());
    }

    #[test]
    fn revision_mismatch_is_rejected_before_any_file_touched() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(6, 7, 0);
        stream.extend(item_base("p", b'A', b"HELLO"));
        stream.extend(end_marker_and_trailer(7));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        let err = apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Network(_)));
        assert!(!dir.path().join("p.baseA").exists());
    }

    #[test]
    fn skips_revision_check_when_not_valid() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(1, 2, 0);
        stream.extend(end_marker_and_trailer(2));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            false,
            &UnreachableRevision,
        )
        .unwrap();
    }

    #[test]
    fn dangerous_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(7, 8, 1);
        stream.extend(end_marker_and_trailer(8));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        let err = apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn monotonicity_violation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(8, 8, 0);
        stream.extend(end_marker_and_trailer(8));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        let err = apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(8),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn charset_violation_in_table_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(7, 8, 0);
        stream.extend(item_base("Table1", b'A', b"x"));
        stream.extend(end_marker_and_trailer(8));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        let err = apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn junk_after_trailer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(7, 8, 0);
        stream.extend(end_marker_and_trailer(8));
        stream.push(0xff);

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        let err = apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn required_revision_before_end_revision_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(7, 8, 0);
        stream.extend(end_marker_and_trailer(7));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        let err = apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn lock_is_released_after_session_so_a_fresh_lock_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(7, 8, 0);
        stream.extend(end_marker_and_trailer(8));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
        )
        .unwrap();

        DirectoryLock::acquire(dir.path(), true).unwrap();
    }

    #[test]
    fn small_chunk_hint_still_applies_a_multi_round_refill() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = header(7, 8, 0);
        stream.extend(item_base("p", b'A', b"a longer payload than one byte at a time"));
        stream.extend(end_marker_and_trailer(8));

        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);
        let config = ApplierConfig { reasonable_changeset_size: 1 };
        apply_changeset_from_conn_with_config(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
            &config,
        )
        .unwrap();

        assert_eq!(
            fs::read(dir.path().join("p.baseA")).unwrap(),
            b"a longer payload than one byte at a time"
        );
    }

    #[test]
    fn concurrent_applier_fails_with_in_use_before_reading_transport() {
        let dir = tempfile::tempdir().unwrap();
        let _held = DirectoryLock::acquire(dir.path(), true).unwrap();

        let mut stream = header(7, 8, 0);
        stream.extend(end_marker_and_trailer(8));
        let mut transport = MemoryTransport::new(REPL_REPLY_CHANGESET, &stream);

        let err = apply_changeset_from_conn(
            dir.path(),
            &mut transport,
            Instant::now(),
            true,
            &FixedRevision(7),
        )
        .unwrap_err();

        match err {
            Error::DatabaseLock(_, LockFailure::InUse) => {}
            other => panic!("expected DatabaseLock(InUse), got {other:?}"),
        }
        assert_eq!(transport.messages.len(), 1, "transport was never touched");
    }
}
