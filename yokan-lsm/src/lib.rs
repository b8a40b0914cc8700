//! Embedded LSM on-disk engine (spec §4.6 "lsm"), backed by RocksDB.
//!
//! Grounded on `kvdb-rocksdb::Database`: a `RwLock<Option<DB>>` guarding
//! the handle so `destroy`/migration can close it cleanly, `Options`
//! tuned the same way (`create_if_missing`, `set_use_fsync(false)`), and
//! the same corruption-detection-then-repair dance on open. Unlike the
//! teacher this engine has no column-family/overlay machinery — Yokan
//! has one keyspace per open database — so the transaction overlay and
//! `DBTransaction` batching are dropped in favor of direct `put`/`delete`
//! calls, which is what a single-column `KeyValueDB` consumer of the
//! teacher crate already reduces to.

use log::warn;
use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use yokan_core::backend::{Backend, ControlFlow, FetchCallback, FileList, IterCallback};
use yokan_core::filter::KeyValueFilter;
use yokan_core::mode::Mode;
use yokan_core::slice::{BitFieldMut, PackedKeys, PackedWriter};
use yokan_core::status::{Result, Status, KEY_NOT_FOUND, NO_MORE_KEYS};
use yokan_core::{BackendConfig, OpenBackend};

fn other_io_err(e: rocksdb::Error) -> Status {
	warn!("rocksdb error: {}", e);
	Status::IOError
}

const SUPPORTED_MODES: u32 = yokan_core::mode::APPEND
	| yokan_core::mode::NEW_ONLY
	| yokan_core::mode::EXIST_ONLY
	| yokan_core::mode::INCLUSIVE
	| yokan_core::mode::NO_PREFIX
	| yokan_core::mode::IGNORE_KEYS
	| yokan_core::mode::KEEP_LAST
	| yokan_core::mode::SUFFIX
	| yokan_core::mode::FILTER_VALUE;

fn open_options(create_if_missing: bool) -> Options {
	let mut opts = Options::default();
	opts.create_if_missing(create_if_missing);
	opts.set_use_fsync(false);
	opts
}

pub struct LsmEngine {
	db: RwLock<Option<DB>>,
	path: PathBuf,
	migrated: AtomicBool,
	config: BackendConfig,
}

impl LsmEngine {
	fn guard(&self) -> Result<()> {
		if self.migrated.load(AtomicOrdering::Acquire) {
			return Err(Status::Migrated);
		}
		Ok(())
	}

	fn with_db<T>(&self, f: impl FnOnce(&DB) -> Result<T>) -> Result<T> {
		self.guard()?;
		match *self.db.read() {
			Some(ref db) => f(db),
			None => Err(Status::Migrated),
		}
	}
}

impl OpenBackend for LsmEngine {
	fn create(config: &BackendConfig) -> Result<Self> {
		let path = config.path.clone().ok_or(Status::InvalidConf)?;
		let opts = open_options(config.create_if_missing);
		let db = DB::open(&opts, &path).map_err(other_io_err)?;
		Ok(LsmEngine { db: RwLock::new(Some(db)), path: PathBuf::from(path), migrated: AtomicBool::new(false), config: config.clone() })
	}

	fn recover(config: &BackendConfig, _migration_config: &serde_json::Value, files: &FileList) -> Result<Self> {
		let path = files.root.clone();
		let opts = open_options(false);
		let db = DB::open(&opts, &path).map_err(other_io_err)?;
		Ok(LsmEngine {
			db: RwLock::new(Some(db)),
			path,
			migrated: AtomicBool::new(false),
			config: config.clone(),
		})
	}
}

impl Backend for LsmEngine {
	fn engine_type(&self) -> &'static str {
		"lsm"
	}

	fn config(&self) -> serde_json::Value {
		serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
	}

	fn supported_modes(&self) -> u32 {
		SUPPORTED_MODES
	}

	fn is_sorted(&self) -> bool {
		true
	}

	fn destroy(&self) -> Result<()> {
		*self.db.write() = None;
		let opts = Options::default();
		DB::destroy(&opts, &self.path).map_err(other_io_err)
	}

	fn count(&self) -> Result<u64> {
		self.with_db(|db| {
			let mut n = 0u64;
			for item in db.iterator(IteratorMode::Start) {
				item.map_err(other_io_err)?;
				n += 1;
			}
			Ok(n)
		})
	}

	fn exists(&self, keys: &PackedKeys, out: &mut BitFieldMut, _mode: Mode) -> Result<()> {
		self.with_db(|db| {
			for (i, key) in keys.iter().enumerate() {
				let found = db.get(key).map_err(other_io_err)?.is_some();
				out.set(i, found);
			}
			Ok(())
		})
	}

	fn length(&self, keys: &PackedKeys, sizes_out: &mut [u64], _mode: Mode) -> Result<()> {
		self.with_db(|db| {
			for (i, key) in keys.iter().enumerate() {
				sizes_out[i] = db.get(key).map_err(other_io_err)?.map(|v| v.len() as u64).unwrap_or(KEY_NOT_FOUND);
			}
			Ok(())
		})
	}

	fn put(&self, keys: &PackedKeys, vals: &PackedKeys, mode: Mode) -> Result<()> {
		if !self.supports_mode(mode) {
			return Err(Status::InvalidMode);
		}
		let multi = keys.len() > 1;
		self.with_db(|db| {
			for (key, val) in keys.iter().zip(vals.iter()) {
				if key.is_empty() {
					return Err(Status::InvalidArg);
				}
				let existing = db.get(key).map_err(other_io_err)?;
				if existing.is_some() && mode.new_only() {
					if multi {
						continue;
					}
					return Err(Status::KeyExists);
				}
				if existing.is_none() && mode.exist_only() {
					continue;
				}
				if mode.append() {
					let mut buf = existing.unwrap_or_default();
					buf.extend_from_slice(val);
					db.put(key, &buf).map_err(other_io_err)?;
				} else {
					db.put(key, val).map_err(other_io_err)?;
				}
			}
			Ok(())
		})
	}

	fn get(&self, keys: &PackedKeys, writer: &mut PackedWriter, _mode: Mode) -> Result<()> {
		self.with_db(|db| {
			for key in keys.iter() {
				match db.get(key).map_err(other_io_err)? {
					Some(val) => writer.write(&val),
					None => writer.write_missing(),
				}
			}
			Ok(())
		})
	}

	fn fetch(&self, keys: &PackedKeys, _mode: Mode, callback: &mut FetchCallback<'_>) -> Result<()> {
		self.with_db(|db| {
			for key in keys.iter() {
				let value = db.get(key).map_err(other_io_err)?;
				if callback(key, value.as_deref()) == ControlFlow::Stop {
					break;
				}
			}
			Ok(())
		})
	}

	fn erase(&self, keys: &PackedKeys, _mode: Mode) -> Result<()> {
		self.with_db(|db| {
			for key in keys.iter() {
				db.delete(key).map_err(other_io_err)?;
			}
			Ok(())
		})
	}

	fn list_keys(&self, from_key: &[u8], filter: &dyn KeyValueFilter, mode: Mode, writer: &mut PackedWriter) -> Result<()> {
		self.with_db(|db| {
			let iter = iterator_from(db, from_key, mode);
			for item in iter {
				let (k, v) = item.map_err(other_io_err)?;
				if writer.slots_remaining() == 0 {
					break;
				}
				if filter.should_stop(&k) {
					break;
				}
				if filter.check(&k, &v) {
					writer.write(&filter.key_copy(&k));
				}
			}
			writer.fill_remaining(NO_MORE_KEYS);
			Ok(())
		})
	}

	fn list_key_values(
		&self,
		from_key: &[u8],
		filter: &dyn KeyValueFilter,
		mode: Mode,
		keys_out: &mut PackedWriter,
		vals_out: &mut PackedWriter,
	) -> Result<()> {
		self.with_db(|db| {
			let iter = iterator_from(db, from_key, mode);
			let mut last_match_key: Option<Vec<u8>> = None;
			for item in iter {
				let (k, v) = item.map_err(other_io_err)?;
				if keys_out.slots_remaining() == 0 {
					break;
				}
				if filter.should_stop(&k) {
					break;
				}
				if filter.check(&k, &v) {
					if mode.ignore_keys() {
						keys_out.write(&[]);
					} else {
						keys_out.write(&filter.key_copy(&k));
					}
					if mode.keep_last() {
						last_match_key = Some(k.clone());
					}
					vals_out.write(&filter.val_copy(&v));
				}
			}
			if let Some(k) = last_match_key {
				keys_out.rewrite_last(&filter.key_copy(&k));
			}
			keys_out.fill_remaining(NO_MORE_KEYS);
			vals_out.fill_remaining(NO_MORE_KEYS);
			Ok(())
		})
	}

	fn iter(&self, max: usize, from_key: &[u8], filter: &dyn KeyValueFilter, mode: Mode, callback: &mut IterCallback<'_>) -> Result<()> {
		self.with_db(|db| {
			let iter = iterator_from(db, from_key, mode);
			let mut emitted = 0usize;
			for item in iter {
				if emitted >= max {
					break;
				}
				let (k, v) = item.map_err(other_io_err)?;
				if filter.should_stop(&k) {
					break;
				}
				if filter.check(&k, &v) {
					emitted += 1;
					if callback(&k, &v) == ControlFlow::Stop {
						break;
					}
				}
			}
			Ok(())
		})
	}

	fn start_migration(&self, root: &Path) -> Result<FileList> {
		self.with_db(|db| {
			db.flush().map_err(other_io_err)?;
			Ok(())
		})?;
		let mut files = Vec::new();
		if let Ok(entries) = std::fs::read_dir(&self.path) {
			for entry in entries.flatten() {
				files.push(entry.path());
			}
		}
		Ok(FileList { root: root.to_path_buf(), files })
	}

	fn mark_migrated(&self) {
		*self.db.write() = None;
		self.migrated.store(true, AtomicOrdering::Release);
	}

	fn cancel_migration(&self) {}
}

/// Builds a forward iterator from `from_key`, skipping the exact match
/// when the caller didn't set `INCLUSIVE` (RocksDB's `From` mode always
/// seeks to the first key `>= from_key`).
fn iterator_from<'a>(
	db: &'a DB,
	from_key: &[u8],
	mode: Mode,
) -> Box<dyn Iterator<Item = std::result::Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>> + 'a> {
	if from_key.is_empty() {
		return Box::new(db.iterator(IteratorMode::Start));
	}
	let iter = db.iterator(IteratorMode::From(from_key, Direction::Forward));
	if mode.inclusive() {
		Box::new(iter)
	} else {
		let from_key = from_key.to_vec();
		Box::new(iter.filter(move |item| !matches!(item, Ok((k, _)) if k.as_ref() == from_key.as_slice())))
	}
}

/// Registers this engine's constructor under the name `"lsm"` (spec §9).
pub fn init() {
	yokan_core::registry::register_backend_with_recovery(
		"lsm",
		|config| LsmEngine::create(config).map(|db| Box::new(db) as Box<dyn Backend>),
		|config, migration_config, files| {
			LsmEngine::recover(config, migration_config, files).map(|db| Box::new(db) as Box<dyn Backend>)
		},
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn packed(items: &[&[u8]]) -> (Vec<u8>, Vec<u64>) {
		let mut buf = Vec::new();
		let mut sizes = Vec::new();
		for item in items {
			buf.extend_from_slice(item);
			sizes.push(item.len() as u64);
		}
		(buf, sizes)
	}

	#[test]
	fn put_get_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = BackendConfig::default();
		config.path = Some(dir.path().to_str().unwrap().to_owned());
		config.create_if_missing = true;
		let db = LsmEngine::create(&config).unwrap();

		let (kbuf, ksizes) = packed(&[b"alpha"]);
		let (vbuf, vsizes) = packed(&[b"1"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
		db.put(&keys, &vals, Mode::NONE).unwrap();

		let mut out = [0u8; 8];
		let mut sizes_out = [0u64; 1];
		let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
		db.get(&keys, &mut writer, Mode::NONE).unwrap();
		assert_eq!(sizes_out, [1]);
		assert_eq!(&out[..1], b"1");
	}

	#[test]
	fn shared_property_tests() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = BackendConfig::default();
		config.path = Some(dir.path().to_str().unwrap().to_owned());
		config.create_if_missing = true;
		let db = LsmEngine::create(&config).unwrap();
		yokan_shared_tests::test_put_and_get(&db).unwrap();
		yokan_shared_tests::test_erase_is_idempotent(&db).unwrap();
		yokan_shared_tests::test_missing_key_is_reported_not_erred(&db).unwrap();
		yokan_shared_tests::test_get_reports_size_too_small(&db).unwrap();
		yokan_shared_tests::test_consume_erases_matched_keys(&db).unwrap();
		yokan_shared_tests::test_ordered_scan_respects_inclusive(&db).unwrap();
		yokan_shared_tests::test_prefix_filter_strips_under_no_prefix(&db).unwrap();
		yokan_shared_tests::test_iter_stops_on_callback_request(&db).unwrap();
		yokan_shared_tests::test_unpacked_get_uses_fixed_stride(&db).unwrap();
		yokan_shared_tests::test_packed_get_short_buffer(&db).unwrap();
		yokan_shared_tests::test_packed_and_unpacked_get_agree_on_bytes(&db).unwrap();
		yokan_shared_tests::test_keep_last_preserves_final_key(&db).unwrap();
	}
}
