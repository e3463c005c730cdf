//! # The mnemo runtime's document core
//!
//! ## Entities and spaces
//! State lives in JSON documents addressed by content-derived entity ids
//! within named spaces. An id is the blake3 hash of the canonicalized
//! `(source, cause)` pair that created the document, so equal creations
//! converge on the same entity. Ids serialize as `{"/": "<hash>"}` and as
//! `of:` URIs; the two forms convert losslessly.
//!
//! ## Links
//! A value position inside a document can hold a link to
//! `(space, entity, path)` instead of inlined data. Links are ordinary
//! JSON objects distinguished by a sigil field, so they survive any JSON
//! transport. Value traversal is cycle safe: it terminates on any finite
//! graph, including self- and mutually-referential links.
//!
//! ## Reactivity
//! Every action registers the set of paths it reads, sorted and compacted
//! so that no watched path extends another. When a document changes, the
//! engine walks the before and after values once, in path order, and
//! returns exactly the actions with a watched difference.
//!
//! ## Transactions
//! Reads and writes go through transactions. Readers may span spaces;
//! the first writer binds the transaction to a single write space. Every
//! read and write appends an invariant to the transaction log. Commit
//! re-validates the read invariants against the current
//! confirmed-plus-pending state, applies the writes to the document store
//! and queues one pending commit for the write space.
//!
//! ## Replication
//! Each space keeps two tiers: server-confirmed entries and an ordered
//! queue of optimistic pending commits. Reads prefer the newest pending
//! write. When the server rejects a commit, every later commit that read
//! from it is rejected too, transitively.
#![warn(missing_docs)]

mod cursor;
mod error;
mod id;
mod link;
pub mod path;
#[cfg(test)]
mod props;
mod reactivity;
mod refs;
mod replica;
pub mod schema;
mod store;
mod transaction;
pub mod value;

pub use crate::cursor::{Cursor, CursorIter, OpaqueRef, ID, ID_FIELD, MAX_RECURSION_DEPTH};
pub use crate::error::{Error, Result};
pub use crate::id::{EntityId, MediaType, SpaceId, ENTITY_URI_PREFIX};
pub use crate::link::{
    discover_links, is_link, normalize_link, parse_link, traverse_links, Address, Link,
    LinkContext, LinkId, NormalizedFullLink, LINK_V1_TAG,
};
pub use crate::path::{compare_paths, get_value_at, set_value_at, sort_and_compact_paths, PathBuf};
pub use crate::reactivity::{
    determine_triggered_actions, group_by_document, DocKey, SortedAndCompactPaths,
};
pub use crate::refs::{create_ref, derive_ref};
pub use crate::replica::{
    commit_hash, CommitHash, CommitReceipt, ConfirmedEntry, ConfirmedRead, EntityChange,
    Operation, PendingCommit, PendingRead, PendingWrite, ReadResult, ReadSource, Replica,
    ReplicaSet,
};
pub use crate::schema::Labels;
pub use crate::store::{Doc, DocSubscription, DocUpdate, DocumentStore};
pub use crate::transaction::{
    DocChange, Invariant, InvariantKind, ReadTier, Reader, Status, Transaction, TxCommit, Writer,
};
pub use crate::value::{deep_equal, Object, Value};
