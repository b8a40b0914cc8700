//! Embedded B-tree on-disk engine (spec §4.6 "btree"), backed by LMDB.
//!
//! Grounded on `kvdb-lmdb::EnvironmentWithDatabases`: one `Environment`
//! holding a single unnamed database, `RoTransaction`/`RwTransaction` for
//! reads and writes, and the cursor-based `iter_from` for ordered scans.
//! `kvdb-lmdb`'s multi-column-family layout collapses to a single `Db`
//! handle since this engine opens one keyspace per backend instance.

use log::warn;
use lmdb::{Cursor, Database as LmdbDb, DatabaseFlags, Environment, Error as LmdbError, Transaction, WriteFlags};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use yokan_core::backend::{Backend, ControlFlow, FetchCallback, FileList, IterCallback};
use yokan_core::filter::KeyValueFilter;
use yokan_core::mode::Mode;
use yokan_core::slice::{BitFieldMut, PackedKeys, PackedWriter};
use yokan_core::status::{Result, Status, KEY_NOT_FOUND, NO_MORE_KEYS};
use yokan_core::{BackendConfig, OpenBackend};

const DEFAULT_MAP_SIZE: usize = 1 << 30;

fn other_err(e: LmdbError) -> Status {
	warn!("lmdb error: {}", e);
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

struct EnvAndDb {
	env: Environment,
	db: LmdbDb,
}

pub struct BtreeEngine {
	handle: RwLock<Option<EnvAndDb>>,
	path: PathBuf,
	migrated: AtomicBool,
	config: BackendConfig,
}

impl BtreeEngine {
	fn open(path: &Path) -> Result<EnvAndDb> {
		std::fs::create_dir_all(path).map_err(|_| Status::IOError)?;
		let env = Environment::new().set_map_size(DEFAULT_MAP_SIZE).open(path).map_err(other_err)?;
		let db = env.create_db(None, DatabaseFlags::default()).map_err(other_err)?;
		Ok(EnvAndDb { env, db })
	}

	fn guard(&self) -> Result<()> {
		if self.migrated.load(AtomicOrdering::Acquire) {
			return Err(Status::Migrated);
		}
		Ok(())
	}

	fn with_env<T>(&self, f: impl FnOnce(&Environment, LmdbDb) -> Result<T>) -> Result<T> {
		self.guard()?;
		match *self.handle.read() {
			Some(ref h) => f(&h.env, h.db),
			None => Err(Status::Migrated),
		}
	}
}

impl OpenBackend for BtreeEngine {
	fn create(config: &BackendConfig) -> Result<Self> {
		let path = config.path.clone().ok_or(Status::InvalidConf)?;
		let handle = Self::open(Path::new(&path))?;
		Ok(BtreeEngine { handle: RwLock::new(Some(handle)), path: PathBuf::from(path), migrated: AtomicBool::new(false), config: config.clone() })
	}

	fn recover(config: &BackendConfig, _migration_config: &serde_json::Value, files: &FileList) -> Result<Self> {
		let handle = Self::open(&files.root)?;
		Ok(BtreeEngine { handle: RwLock::new(Some(handle)), path: files.root.clone(), migrated: AtomicBool::new(false), config: config.clone() })
	}
}

impl Backend for BtreeEngine {
	fn engine_type(&self) -> &'static str {
		"btree"
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
		*self.handle.write() = None;
		std::fs::remove_dir_all(&self.path).map_err(|_| Status::IOError)
	}

	fn count(&self) -> Result<u64> {
		self.with_env(|env, db| {
			let txn = env.begin_ro_txn().map_err(other_err)?;
			let stat = txn.stat(db).map_err(other_err)?;
			Ok(stat.entries() as u64)
		})
	}

	fn exists(&self, keys: &PackedKeys, out: &mut BitFieldMut, _mode: Mode) -> Result<()> {
		self.with_env(|env, db| {
			let txn = env.begin_ro_txn().map_err(other_err)?;
			for (i, key) in keys.iter().enumerate() {
				let found = matches!(txn.get(db, &key), Ok(_));
				out.set(i, found);
			}
			Ok(())
		})
	}

	fn length(&self, keys: &PackedKeys, sizes_out: &mut [u64], _mode: Mode) -> Result<()> {
		self.with_env(|env, db| {
			let txn = env.begin_ro_txn().map_err(other_err)?;
			for (i, key) in keys.iter().enumerate() {
				sizes_out[i] = match txn.get(db, &key) {
					Ok(val) => val.len() as u64,
					Err(LmdbError::NotFound) => KEY_NOT_FOUND,
					Err(e) => return Err(other_err(e)),
				};
			}
			Ok(())
		})
	}

	fn put(&self, keys: &PackedKeys, vals: &PackedKeys, mode: Mode) -> Result<()> {
		if !self.supports_mode(mode) {
			return Err(Status::InvalidMode);
		}
		let multi = keys.len() > 1;
		self.with_env(|env, db| {
			let mut txn = env.begin_rw_txn().map_err(other_err)?;
			for (key, val) in keys.iter().zip(vals.iter()) {
				if key.is_empty() {
					return Err(Status::InvalidArg);
				}
				let existing = match txn.get(db, &key) {
					Ok(v) => Some(v.to_vec()),
					Err(LmdbError::NotFound) => None,
					Err(e) => return Err(other_err(e)),
				};
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
					txn.put(db, &key, &buf, WriteFlags::empty()).map_err(other_err)?;
				} else {
					txn.put(db, &key, &val, WriteFlags::empty()).map_err(other_err)?;
				}
			}
			txn.commit().map_err(other_err)
		})
	}

	fn get(&self, keys: &PackedKeys, writer: &mut PackedWriter, _mode: Mode) -> Result<()> {
		self.with_env(|env, db| {
			let txn = env.begin_ro_txn().map_err(other_err)?;
			for key in keys.iter() {
				match txn.get(db, &key) {
					Ok(val) => writer.write(val),
					Err(LmdbError::NotFound) => writer.write_missing(),
					Err(e) => return Err(other_err(e)),
				}
			}
			Ok(())
		})
	}

	fn fetch(&self, keys: &PackedKeys, _mode: Mode, callback: &mut FetchCallback<'_>) -> Result<()> {
		self.with_env(|env, db| {
			let txn = env.begin_ro_txn().map_err(other_err)?;
			for key in keys.iter() {
				let value = match txn.get(db, &key) {
					Ok(val) => Some(val),
					Err(LmdbError::NotFound) => None,
					Err(e) => return Err(other_err(e)),
				};
				if callback(key, value) == ControlFlow::Stop {
					break;
				}
			}
			Ok(())
		})
	}

	fn erase(&self, keys: &PackedKeys, _mode: Mode) -> Result<()> {
		self.with_env(|env, db| {
			let mut txn = env.begin_rw_txn().map_err(other_err)?;
			for key in keys.iter() {
				match txn.del(db, &key, None) {
					Ok(()) | Err(LmdbError::NotFound) => {}
					Err(e) => return Err(other_err(e)),
				}
			}
			txn.commit().map_err(other_err)
		})
	}

	fn list_keys(&self, from_key: &[u8], filter: &dyn KeyValueFilter, mode: Mode, writer: &mut PackedWriter) -> Result<()> {
		self.with_env(|env, db| {
			let txn = env.begin_ro_txn().map_err(other_err)?;
			let mut cursor = txn.open_ro_cursor(db).map_err(other_err)?;
			let rows: Vec<(Vec<u8>, Vec<u8>)> = cursor_rows(&mut cursor, from_key, mode)?;
			for (k, v) in rows {
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
		self.with_env(|env, db| {
			let txn = env.begin_ro_txn().map_err(other_err)?;
			let mut cursor = txn.open_ro_cursor(db).map_err(other_err)?;
			let rows = cursor_rows(&mut cursor, from_key, mode)?;
			let mut last_match_key: Option<Vec<u8>> = None;
			for (k, v) in rows {
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
		self.with_env(|env, db| {
			let txn = env.begin_ro_txn().map_err(other_err)?;
			let mut cursor = txn.open_ro_cursor(db).map_err(other_err)?;
			let rows = cursor_rows(&mut cursor, from_key, mode)?;
			let mut emitted = 0usize;
			for (k, v) in rows {
				if emitted >= max {
					break;
				}
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
		self.with_env(|env, _db| env.sync(true).map_err(other_err))?;
		let mut files = Vec::new();
		if let Ok(entries) = std::fs::read_dir(&self.path) {
			for entry in entries.flatten() {
				files.push(entry.path());
			}
		}
		Ok(FileList { root: root.to_path_buf(), files })
	}

	fn mark_migrated(&self) {
		*self.handle.write() = None;
		self.migrated.store(true, AtomicOrdering::Release);
	}

	fn cancel_migration(&self) {}
}

/// Materializes a cursor scan into owned rows starting at `from_key`
/// (empty means "from the beginning"), honoring `INCLUSIVE`.
///
/// Collecting eagerly keeps the lifetime of the `RoCursor`/`RoTransaction`
/// from leaking past this function, at the cost of buffering the tail of
/// the keyspace for every bounded scan; acceptable for a reference engine,
/// revisit if a streaming cursor wrapper is worth the lifetime plumbing.
fn cursor_rows(cursor: &mut lmdb::RoCursor<'_>, from_key: &[u8], mode: Mode) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
	let iter = if from_key.is_empty() { cursor.iter_start() } else { cursor.iter_from(from_key) };
	let mut rows = Vec::new();
	for (idx, item) in iter.enumerate() {
		let (k, v) = item.map_err(other_err)?;
		if idx == 0 && !from_key.is_empty() && !mode.inclusive() && k == from_key {
			continue;
		}
		rows.push((k.to_vec(), v.to_vec()));
	}
	Ok(rows)
}

/// Registers this engine's constructor under the name `"btree"` (spec §9).
pub fn init() {
	yokan_core::registry::register_backend_with_recovery(
		"btree",
		|config| BtreeEngine::create(config).map(|db| Box::new(db) as Box<dyn Backend>),
		|config, migration_config, files| {
			BtreeEngine::recover(config, migration_config, files).map(|db| Box::new(db) as Box<dyn Backend>)
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
		let db = BtreeEngine::create(&config).unwrap();

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
		let db = BtreeEngine::create(&config).unwrap();
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
