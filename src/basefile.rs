//! Base-file rewriter (C7).
//!
//! Consumes a `(letter, size, bytes[size])` triple from the wire and
//! atomically replaces `<table>.base<letter>` via tmp-file + fsync +
//! rename, with NFS-aware recovery from a lost rename acknowledgement.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use bytes::BytesMut;

use crate::codec::Cursor;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Process one base-file item: `buf` is positioned at the start of the
/// payload (`letter`, `base_size`, `base_bytes`). On return, the consumed
/// bytes have been drained from the front of `buf`.
pub fn apply_base_chunk(
    dir: &Path,
    table: &str,
    buf: &mut BytesMut,
    transport: &mut dyn Transport,
    deadline: Instant,
) -> Result<()> {
    let (letter, base_size, header_len) = loop {
        if let Some(parsed) = try_read_base_header(buf)? {
            break parsed;
        }
        let before = buf.len();
        transport.ensure_chunk(buf, before + 1, deadline)?;
        if buf.len() == before {
            return Err(Error::network("Unexpected end of changeset"));
        }
    };
    buf.advance_consumed(header_len);

    if buf.len() < base_size {
        transport.ensure_chunk(buf, base_size, deadline)?;
    }
    if buf.len() < base_size {
        return Err(Error::network("Unexpected end of changeset"));
    }

    let letter_char = letter as char;
    let tmp_path = dir.join(format!("{table}tmp"));
    let base_path = dir.join(format!("{table}.base{letter_char}"));

    tracing::trace!(table, letter = %letter_char, bytes = base_size, "rewriting base file");

    write_tmp_file(&tmp_path, &buf[..base_size]).map_err(|e| {
        Error::database(
            format!("Couldn't write temporary base file for {table}.base{letter_char}"),
            &e,
        )
    })?;

    rename_with_nfs_recovery(&tmp_path, &base_path, table, letter_char)?;

    buf.advance_consumed(base_size);

    Ok(())
}

/// Try to parse the `(letter, base_size)` pair at the front of `buf`.
/// Returns `Ok(None)` when more bytes are needed, `Err` for an invalid
/// letter or a malformed size varint.
fn try_read_base_header(buf: &BytesMut) -> Result<Option<(u8, usize, usize)>> {
    let mut cursor = Cursor::new(&buf[..]);
    let letter = match cursor.decode_byte() {
        Ok(b) => b,
        Err(_) => return Ok(None),
    };
    if letter != b'A' && letter != b'B' {
        return Err(Error::network("Invalid base file letter in changeset"));
    }

    let base_size = match cursor.decode_uint() {
        Ok(v) => v as usize,
        Err(crate::codec::DecodeError::NeedMore) => return Ok(None),
        Err(crate::codec::DecodeError::Malformed) => {
            return Err(Error::network("Invalid base file size in changeset"))
        }
    };

    Ok(Some((letter, base_size, cursor.consumed())))
}

fn write_tmp_file(tmp_path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

/// Rename `tmp_path` to `base_path`. If the rename itself reports failure,
/// probe with `unlink(tmp_path)`: if that succeeds, or fails for any
/// reason other than "already gone", the rename really did fail and we
/// raise `Database`. If the tmp file is already gone (`ENOENT`), the
/// rename actually succeeded server-side and only its acknowledgement was
/// lost — an NFS-characteristic behavior — so we treat it as success.
fn rename_with_nfs_recovery(
    tmp_path: &Path,
    base_path: &Path,
    table: &str,
    letter: char,
) -> Result<()> {
    match fs::rename(tmp_path, base_path) {
        Ok(()) => Ok(()),
        Err(rename_err) => match fs::remove_file(tmp_path) {
            Ok(()) => Err(Error::database(
                format!("Couldn't update base file {table}.base{letter}"),
                &rename_err,
            )),
            Err(unlink_err) if unlink_err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    table,
                    letter = %letter,
                    "rename reported failure but tmp file was already gone; treating as success (NFS ack loss)"
                );
                Ok(())
            }
            Err(_) => Err(Error::database(
                format!("Couldn't update base file {table}.base{letter}"),
                &rename_err,
            )),
        },
    }
}

/// Small helper trait so callers can drain consumed bytes from the front
/// of the shared buffer without re-borrowing through a `Cursor` (which
/// only ever sees an immutable slice).
pub(crate) trait DrainConsumed {
    fn advance_consumed(&mut self, n: usize);
}

impl DrainConsumed for BytesMut {
    fn advance_consumed(&mut self, n: usize) {
        let _ = self.split_to(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_uint;
    use crate::testing::MemoryTransport;

    fn payload(letter: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![letter];
        encode_uint(data.len() as u64, &mut out);
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn writes_base_file_and_removes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MemoryTransport::new(1, b"");
        let mut buf = BytesMut::from(&payload(b'A', b"HELLO")[..]);
        apply_base_chunk(dir.path(), "p", &mut buf, &mut transport, Instant::now()).unwrap();

        let contents = fs::read(dir.path().join("p.baseA")).unwrap();
        assert_eq!(contents, b"HELLO");
        assert!(!dir.path().join("ptmp").exists());
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_invalid_letter() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MemoryTransport::new(1, b"");
        let mut buf = BytesMut::from(&payload(b'C', b"x")[..]);
        let err = apply_base_chunk(dir.path(), "p", &mut buf, &mut transport, Instant::now())
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn rewrite_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("p.baseA"), b"OLD_CONTENTS_HERE").unwrap();

        let mut transport = MemoryTransport::new(1, b"");
        let mut buf = BytesMut::from(&payload(b'A', b"NEW")[..]);
        apply_base_chunk(dir.path(), "p", &mut buf, &mut transport, Instant::now()).unwrap();

        assert_eq!(fs::read(dir.path().join("p.baseA")).unwrap(), b"NEW");
    }
}
