//! Replica-side changeset applier for the flint on-disk table format.
//!
//! A producer (the master) streams a sequence of binary changesets
//! describing how its on-disk tables have evolved between two revisions;
//! [`applier::apply_changeset_from_conn`] consumes one such stream and
//! brings a local replica database directory from one revision to the
//! next, atomically with respect to concurrent readers on that directory.
//!
//! This crate implements only the replica side: producing changesets, the
//! network transport itself, and the table engine that later reads the
//! patched files are all external collaborators, represented here as
//! traits ([`transport::Transport`], [`applier::RevisionSource`]) rather
//! than concrete implementations.

pub mod applier;
pub mod basefile;
pub mod blockfile;
pub mod codec;
pub mod error;
pub mod lock;
pub mod revision;
pub mod testing;
pub mod transport;
pub mod version;

pub use applier::{
    apply_changeset_from_conn, apply_changeset_from_conn_with_config, ApplierConfig, RevisionSource,
};
pub use error::{DatabaseError, Error, LockFailure, Result};
pub use lock::DirectoryLock;
pub use revision::{decode_revision, encode_revision, revision_at_least, Revision};
pub use transport::Transport;
