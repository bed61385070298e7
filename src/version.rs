//! Version file reader (C4).
//!
//! Reads the database's version file to extract a stable UUID used to
//! match a replica to the master it is replicating from. Absence or
//! corruption of the file is not an error to this reader's caller — it
//! simply means "this replica hasn't been initialized yet" (an empty
//! string), matching the original `get_uuid` which swallows
//! `DatabaseError` and returns an empty string rather than propagating.
//!
//! The on-disk layout is a 12-byte magic distinct from the changeset
//! magic, a C1-encoded format version, and a 16-byte UUID; see
//! `DESIGN.md` for the rationale behind this particular choice of layout.

use std::fs;
use std::path::Path;

use crate::codec::Cursor;

pub const VERSION_FILE_NAME: &str = "version";
const VERSION_MAGIC: &[u8; 12] = b"FLINTVERSON\0";
const FLINT_VERSION: u64 = 1;
const UUID_LEN: usize = 16;

/// Open `dir`'s version file and return its UUID as a hex string, or an
/// empty string if the file is absent, truncated, or fails the magic /
/// format check.
pub fn get_uuid(dir: &Path) -> String {
    match try_get_uuid(dir) {
        Some(uuid) => uuid,
        None => {
            tracing::debug!(dir = %dir.display(), "version file absent or malformed");
            String::new()
        }
    }
}

fn try_get_uuid(dir: &Path) -> Option<String> {
    let path = dir.join(VERSION_FILE_NAME);
    let bytes = fs::read(path).ok()?;

    let mut cursor = Cursor::new(&bytes);
    let magic = cursor.take(VERSION_MAGIC.len()).ok()?;
    if magic != VERSION_MAGIC.as_slice() {
        return None;
    }
    let format_version = cursor.decode_uint().ok()?;
    if format_version != FLINT_VERSION {
        return None;
    }
    let uuid_bytes = cursor.take(UUID_LEN).ok()?;
    Some(hex_encode(uuid_bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").unwrap();
    }
    s
}

/// Write a version file in the layout this reader expects. Exposed for
/// tests and for callers that need to initialize a fresh replica
/// directory before the first changeset arrives.
pub fn write_version_file(dir: &Path, uuid: &uuid::Uuid) -> std::io::Result<()> {
    use bytes::BufMut;
    let mut out = Vec::new();
    out.put_slice(VERSION_MAGIC.as_slice());
    crate::codec::encode_uint(FLINT_VERSION, &mut out);
    out.put_slice(uuid.as_bytes());
    fs::write(dir.join(VERSION_FILE_NAME), out)
}
