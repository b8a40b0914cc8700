//! Backend-engine contract shared by every Yokan storage engine.
//!
//! This crate is the analogue of `kvdb`: it defines
//! the uniform operation set (point, batch, packed, iterated, filtered,
//! fetched — spec §4.3), the document-store mixin (spec §4.4), the
//! pluggable filter abstraction (spec §4.5), and the migration handle
//! (spec §4.9). Concrete engines live in sibling crates and depend on
//! this one, exactly as `kvdb-memorydb`/`kvdb-rocksdb` depend on `kvdb`.

pub mod backend;
pub mod dbid;
pub mod docstore;
pub mod filter;
pub mod migration;
pub mod mode;
pub mod registry;
pub mod slice;
pub mod status;

pub use backend::{Backend, BackendConfig, ControlFlow, FileList, OpenBackend};
pub use dbid::DatabaseId;
pub use docstore::DocumentStore;
pub use filter::{DocFilter, KeyValueFilter};
pub use migration::MigrationHandle;
pub use mode::Mode;
pub use slice::{BitFieldMut, PackMode, PackedKeys, PackedWriter};
pub use status::{Result, Status};
