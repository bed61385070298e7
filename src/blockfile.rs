//! Block patcher (C8).
//!
//! Consumes a stream of `(block_number, bytes[blocksize])` pairs
//! terminated by `block_number == 0` and overwrites the corresponding
//! blocks of `<table>.DB` in place, fsyncing once at the end.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use bytes::BytesMut;

use crate::basefile::DrainConsumed;
use crate::codec::Cursor;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Process one blocks item: `buf` is positioned at the start of the
/// payload (`blocksize`, then `(block_number, bytes)*` terminated by
/// `block_number == 0`).
pub fn apply_blocks_chunk(
    dir: &Path,
    table: &str,
    buf: &mut BytesMut,
    transport: &mut dyn Transport,
    deadline: Instant,
) -> Result<()> {
    let blocksize = decode_blocksize(buf, transport, deadline)?;
    tracing::trace!(table, blocksize, "patching blocks");

    let db_path = dir.join(format!("{table}.DB"));
    let mut file = OpenOptions::new().write(true).open(&db_path).map_err(|e| {
        Error::database(format!("Couldn't open block file for table {table}"), &e)
    })?;

    let mut blocks_written: u64 = 0;
    loop {
        let block_number_wire = decode_block_number(buf, transport, deadline)?;
        if block_number_wire == 0 {
            break;
        }
        let block_index = block_number_wire - 1;

        if buf.len() < blocksize {
            transport.ensure_chunk(buf, blocksize, deadline)?;
        }
        if buf.len() < blocksize {
            return Err(Error::network("Incomplete block in changeset"));
        }

        let offset = block_index
            .checked_mul(blocksize as u64)
            .ok_or_else(|| Error::network("Block number too large in changeset"))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| {
            Error::database(format!("Failed to seek to block {block_index}"), &e)
        })?;
        file.write_all(&buf[..blocksize]).map_err(|e| {
            Error::database(format!("Failed to write block {block_index}"), &e)
        })?;
        tracing::trace!(table, block_index, bytes = blocksize, "wrote block");

        buf.advance_consumed(blocksize);
        blocks_written += 1;
    }

    file.sync_all()
        .map_err(|e| Error::database(format!("Failed to fsync block file for {table}"), &e))?;
    tracing::trace!(
        table,
        blocks_written,
        total_bytes = blocks_written * blocksize as u64,
        "block patch complete"
    );

    Ok(())
}

fn decode_blocksize(
    buf: &mut BytesMut,
    transport: &mut dyn Transport,
    deadline: Instant,
) -> Result<usize> {
    loop {
        let mut cursor = Cursor::new(&buf[..]);
        match cursor.decode_uint() {
            Ok(v) => {
                let consumed = cursor.consumed();
                buf.advance_consumed(consumed);
                return Ok(v as usize);
            }
            Err(crate::codec::DecodeError::NeedMore) => {
                let before = buf.len();
                transport.ensure_chunk(buf, before + 1, deadline)?;
                if buf.len() == before {
                    return Err(Error::network("Invalid blocksize in changeset"));
                }
            }
            Err(crate::codec::DecodeError::Malformed) => {
                return Err(Error::network("Invalid blocksize in changeset"))
            }
        }
    }
}

fn decode_block_number(
    buf: &mut BytesMut,
    transport: &mut dyn Transport,
    deadline: Instant,
) -> Result<u64> {
    loop {
        let mut cursor = Cursor::new(&buf[..]);
        match cursor.decode_uint() {
            Ok(v) => {
                let consumed = cursor.consumed();
                buf.advance_consumed(consumed);
                return Ok(v);
            }
            Err(crate::codec::DecodeError::NeedMore) => {
                let before = buf.len();
                transport.ensure_chunk(buf, before + 1, deadline)?;
                if buf.len() == before {
                    return Err(Error::network("Invalid block number in changeset"));
                }
            }
            Err(crate::codec::DecodeError::Malformed) => {
                return Err(Error::network("Invalid block number in changeset"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_uint;
    use crate::testing::MemoryTransport;
    use std::fs;

    fn make_db(dir: &Path, table: &str, size: usize) {
        fs::write(dir.join(format!("{table}.DB")), vec![0u8; size]).unwrap();
    }

    fn payload(blocksize: u64, blocks: &[(u64, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_uint(blocksize, &mut out);
        for (num, bytes) in blocks {
            encode_uint(*num, &mut out);
            out.extend_from_slice(bytes);
        }
        encode_uint(0, &mut out);
        out
    }

    #[test]
    fn patches_two_blocks_at_correct_offsets() {
        let dir = tempfile::tempdir().unwrap();
        make_db(dir.path(), "t", 64);

        let a = [b'A'; 16];
        let b = [b'B'; 16];
        let mut buf = BytesMut::from(&payload(16, &[(3, &a), (1, &b)])[..]);
        let mut transport = MemoryTransport::new(2, b"");

        apply_blocks_chunk(dir.path(), "t", &mut buf, &mut transport, Instant::now()).unwrap();

        let contents = fs::read(dir.path().join("t.DB")).unwrap();
        assert_eq!(&contents[0..16], &b[..]);
        assert_eq!(&contents[32..48], &a[..]);
        assert_eq!(&contents[16..32], &[0u8; 16][..]);
        assert_eq!(&contents[48..64], &[0u8; 16][..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_block_is_network_error() {
        let dir = tempfile::tempdir().unwrap();
        make_db(dir.path(), "t", 64);

        let mut out = Vec::new();
        encode_uint(16, &mut out);
        encode_uint(1, &mut out);
        out.extend_from_slice(&[b'X'; 10]); // short by 6 bytes, no terminator follows

        let mut buf = BytesMut::from(&out[..]);
        let mut transport = MemoryTransport::new(2, b"");
        let err = apply_blocks_chunk(dir.path(), "t", &mut buf, &mut transport, Instant::now())
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
