//! The backend-engine contract (spec §4.3, §4.4, §4.6, §9 "Polymorphism").
//!
//! `Backend` is the trait every concrete engine implements. Every method
//! has a default body returning `NotSupported`, so a concrete engine
//! overrides only the operations it can actually perform — the same shape
//! as the C++ abstract class in `include/yokan/backend.hpp`, and the same
//! idiom `kvdb::KeyValueDB` uses for its own optional methods (default
//! bodies for `transaction`/`write`, everything else is engine-supplied).
//!
//! Key/value operations (§4.3) and document operations (§4.4) both live on
//! this one trait: an engine that only supports key/value storage leaves
//! the document methods at their `NotSupported` default and is wrapped in
//! [`crate::docstore::DocumentStore`] to gain them; an engine with a native
//! document representation (the log and array engines) overrides the
//! document methods directly and leaves the key/value methods unsupported.

use crate::filter::KeyValueFilter;
use crate::mode::Mode;
use crate::slice::{BitFieldMut, PackedKeys, PackedWriter};
use crate::status::{Result, Status};
use std::path::Path;

/// What a scan callback tells the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
	Continue,
	Stop,
}

/// Callback type for `fetch`/`docFetch`: invoked once per key/id in input
/// order, with `None` standing in for the `KEY_NOT_FOUND` sentinel.
pub type FetchCallback<'a> = dyn FnMut(&[u8], Option<&[u8]>) -> ControlFlow + 'a;
pub type DocFetchCallback<'a> = dyn FnMut(u64, Option<&[u8]>) -> ControlFlow + 'a;

/// Callback type for `iter`/`docIter`: the streaming analogue of
/// `listKeys`/`docList` that never materializes an output buffer.
pub type IterCallback<'a> = dyn FnMut(&[u8], &[u8]) -> ControlFlow + 'a;
pub type DocIterCallback<'a> = dyn FnMut(u64, &[u8]) -> ControlFlow + 'a;

/// Engine-specific construction parameters, opaque to the core beyond the
/// common fields every engine recognizes (spec §6).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackendConfig {
	pub path: Option<String>,
	pub use_lock: bool,
	pub create_if_missing: bool,
	pub comparator: String,
	pub chunk_size: Option<u64>,
	pub initial_bucket_count: Option<u32>,
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BackendConfig {
	pub fn from_json(value: serde_json::Value) -> Result<Self> {
		serde_json::from_value(value).map_err(|_| Status::InvalidConf)
	}
}

/// A list of file paths an on-disk engine owns, relative to a root
/// directory — used both by `startMigration` (spec §4.9) and by
/// `recover`.
#[derive(Debug, Clone, Default)]
pub struct FileList {
	pub root: std::path::PathBuf,
	pub files: Vec<std::path::PathBuf>,
}

pub trait Backend: Send + Sync {
	/// The name this engine is registered under (spec §4.3 `type()`).
	fn engine_type(&self) -> &'static str;

	/// Echoes the effective configuration back to the caller (spec §6:
	/// "the engine echoes the effective configuration back via `config()`").
	fn config(&self) -> serde_json::Value {
		serde_json::Value::Null
	}

	/// The subset of mode bits this engine honors; callers passing bits
	/// outside this mask get `NotSupported`/`InvalidMode` (spec §4.2).
	fn supported_modes(&self) -> u32 {
		0
	}

	fn supports_mode(&self, mode: Mode) -> bool {
		mode.supported_by(self.supported_modes())
	}

	/// Whether iteration yields keys in byte-lexicographic order (spec §3).
	fn is_sorted(&self) -> bool {
		false
	}

	/// Removes any persisted files and leaves the instance unusable.
	fn destroy(&self) -> Result<()> {
		Err(Status::NotSupported)
	}

	// ---- key/value operations (spec §4.3) ----

	fn count(&self) -> Result<u64> {
		Err(Status::NotSupported)
	}

	fn exists(&self, keys: &PackedKeys, out: &mut BitFieldMut, mode: Mode) -> Result<()> {
		let _ = (keys, out, mode);
		Err(Status::NotSupported)
	}

	fn length(&self, keys: &PackedKeys, sizes_out: &mut [u64], mode: Mode) -> Result<()> {
		let _ = (keys, sizes_out, mode);
		Err(Status::NotSupported)
	}

	fn put(&self, keys: &PackedKeys, vals: &PackedKeys, mode: Mode) -> Result<()> {
		let _ = (keys, vals, mode);
		Err(Status::NotSupported)
	}

	/// Copies the value for each key into `writer` in input order, writing
	/// `KEY_NOT_FOUND` for absent keys. Whether slots are packed
	/// back-to-back or laid out at a fixed per-slot capacity is a property
	/// of the `writer` itself (spec §4.3 `get(..., packed)`); callers pick
	/// `PackedWriter::new` vs `PackedWriter::new_unpacked` and every engine
	/// honors it transparently by writing only through `writer.write(...)`.
	fn get(&self, keys: &PackedKeys, writer: &mut PackedWriter, mode: Mode) -> Result<()> {
		let _ = (keys, writer, mode);
		Err(Status::NotSupported)
	}

	fn fetch(&self, keys: &PackedKeys, mode: Mode, callback: &mut FetchCallback<'_>) -> Result<()> {
		let _ = (keys, mode, callback);
		Err(Status::NotSupported)
	}

	fn erase(&self, keys: &PackedKeys, mode: Mode) -> Result<()> {
		let _ = (keys, mode);
		Err(Status::NotSupported)
	}

	fn list_keys(
		&self,
		from_key: &[u8],
		filter: &dyn KeyValueFilter,
		mode: Mode,
		writer: &mut PackedWriter,
	) -> Result<()> {
		let _ = (from_key, filter, mode, writer);
		Err(Status::NotSupported)
	}

	fn list_key_values(
		&self,
		from_key: &[u8],
		filter: &dyn KeyValueFilter,
		mode: Mode,
		keys_out: &mut PackedWriter,
		vals_out: &mut PackedWriter,
	) -> Result<()> {
		let _ = (from_key, filter, mode, keys_out, vals_out);
		Err(Status::NotSupported)
	}

	fn iter(
		&self,
		max: usize,
		from_key: &[u8],
		filter: &dyn KeyValueFilter,
		mode: Mode,
		callback: &mut IterCallback<'_>,
	) -> Result<()> {
		let _ = (max, from_key, filter, mode, callback);
		Err(Status::NotSupported)
	}

	// ---- document-store operations (spec §4.4) ----

	fn coll_create(&self, name: &[u8]) -> Result<()> {
		let _ = name;
		Err(Status::NotSupported)
	}

	fn coll_drop(&self, name: &[u8]) -> Result<()> {
		let _ = name;
		Err(Status::NotSupported)
	}

	fn coll_exists(&self, name: &[u8]) -> Result<bool> {
		let _ = name;
		Err(Status::NotSupported)
	}

	fn coll_last_id(&self, name: &[u8]) -> Result<u64> {
		let _ = name;
		Err(Status::NotSupported)
	}

	fn coll_size(&self, name: &[u8]) -> Result<u64> {
		let _ = name;
		Err(Status::NotSupported)
	}

	fn doc_size(&self, coll: &[u8], ids: &[u64], sizes_out: &mut [u64]) -> Result<()> {
		let _ = (coll, ids, sizes_out);
		Err(Status::NotSupported)
	}

	fn doc_store(&self, coll: &[u8], docs: &PackedKeys, ids_out: &mut [u64]) -> Result<()> {
		let _ = (coll, docs, ids_out);
		Err(Status::NotSupported)
	}

	fn doc_update(&self, coll: &[u8], ids: &[u64], docs: &PackedKeys, mode: Mode) -> Result<()> {
		let _ = (coll, ids, docs, mode);
		Err(Status::NotSupported)
	}

	fn doc_load(&self, coll: &[u8], ids: &[u64], writer: &mut PackedWriter, mode: Mode) -> Result<()> {
		let _ = (coll, ids, writer, mode);
		Err(Status::NotSupported)
	}

	fn doc_fetch(&self, coll: &[u8], ids: &[u64], mode: Mode, callback: &mut DocFetchCallback<'_>) -> Result<()> {
		let _ = (coll, ids, mode, callback);
		Err(Status::NotSupported)
	}

	fn doc_erase(&self, coll: &[u8], ids: &[u64]) -> Result<()> {
		let _ = (coll, ids);
		Err(Status::NotSupported)
	}

	fn doc_list(
		&self,
		coll: &[u8],
		from_id: u64,
		filter: &dyn crate::filter::DocFilter,
		mode: Mode,
		ids_out: &mut [u64],
		writer: &mut PackedWriter,
	) -> Result<()> {
		let _ = (coll, from_id, filter, mode, ids_out, writer);
		Err(Status::NotSupported)
	}

	fn doc_iter(
		&self,
		coll: &[u8],
		max: usize,
		from_id: u64,
		filter: &dyn crate::filter::DocFilter,
		mode: Mode,
		callback: &mut DocIterCallback<'_>,
	) -> Result<()> {
		let _ = (coll, max, from_id, filter, mode, callback);
		Err(Status::NotSupported)
	}

	// ---- migration (spec §4.9) ----

	/// Flushes in-memory state under a root directory and returns the file
	/// list the migration handle will expose; memory-only engines with no
	/// file representation return `NotSupported`.
	fn start_migration(&self, _root: &Path) -> Result<FileList> {
		Err(Status::NotSupported)
	}

	/// Marks the engine as migrated: every call except `destroy` must
	/// return `Migrated` from this point on.
	fn mark_migrated(&self) {}

	/// Undoes the effect of `start_migration`, leaving the engine usable.
	fn cancel_migration(&self) {}
}

/// Constructs a fresh engine instance from a configuration blob.
pub trait OpenBackend: Backend + Sized {
	fn create(config: &BackendConfig) -> Result<Self>;

	/// Rebuilds an engine from a `(config, migration-config, file-list)`
	/// tuple produced by a prior `startMigration` (spec §4.9). The default
	/// rejects recovery; single-file/directory engines override it.
	fn recover(_config: &BackendConfig, _migration_config: &serde_json::Value, _files: &FileList) -> Result<Self> {
		Err(Status::NotSupported)
	}
}
