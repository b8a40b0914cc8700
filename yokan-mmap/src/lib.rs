//! Memory-mapped growable-file engine (spec §4.6 "mmap"). Where
//! `yokan-hashfile` durs its log through ordinary `File::write_all` calls,
//! this engine keeps the log itself resident behind a `memmap2::MmapMut`
//! that is remapped (doubled) whenever the write cursor would overrun it —
//! the growable-mmap idiom `memmap2`'s own docs describe, and the same
//! "preallocate with `fs2`, map it, bump a cursor" shape the pack's other
//! mmap-based storage engines use. The serving index is an in-memory
//! `BTreeMap`, so this engine reports `is_sorted() == true` and backs
//! ordered scans directly, unlike the hash-table-indexed `yokan-hashfile`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs2::FileExt;
use log::warn;
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use yokan_core::backend::{Backend, ControlFlow, FetchCallback, FileList, IterCallback};
use yokan_core::filter::KeyValueFilter;
use yokan_core::mode::Mode;
use yokan_core::slice::{BitFieldMut, PackedKeys, PackedWriter};
use yokan_core::status::{Result, Status, KEY_NOT_FOUND, NO_MORE_KEYS};
use yokan_core::{BackendConfig, OpenBackend};

const HEADER_MAGIC: u64 = 0x594F_4B41_4E4D_4D01;
const HEADER_SIZE: u64 = 16;
const INITIAL_CAPACITY: u64 = 1 << 20;
const TAG_PUT: u8 = 1;
const TAG_ERASE: u8 = 2;

const SUPPORTED_MODES: u32 = yokan_core::mode::APPEND
	| yokan_core::mode::NEW_ONLY
	| yokan_core::mode::EXIST_ONLY
	| yokan_core::mode::INCLUSIVE
	| yokan_core::mode::NO_PREFIX
	| yokan_core::mode::IGNORE_KEYS
	| yokan_core::mode::KEEP_LAST
	| yokan_core::mode::SUFFIX
	| yokan_core::mode::FILTER_VALUE;

struct MappedLog {
	file: File,
	mmap: MmapMut,
	capacity: u64,
	cursor: AtomicU64,
}

impl MappedLog {
	fn grow_to(&mut self, required: u64) -> Result<()> {
		let mut new_capacity = self.capacity.max(INITIAL_CAPACITY);
		while new_capacity < required {
			new_capacity *= 2;
		}
		self.file.set_len(new_capacity).map_err(|_| Status::IOError)?;
		self.mmap = unsafe { MmapMut::map_mut(&self.file).map_err(|_| Status::IOError)? };
		self.capacity = new_capacity;
		Ok(())
	}

	fn append(&mut self, tag: u8, key: &[u8], val: &[u8]) -> Result<()> {
		let record_len = 9 + key.len() as u64 + val.len() as u64;
		let offset = self.cursor.load(AtomicOrdering::Acquire);
		if offset + record_len > self.capacity {
			self.grow_to(offset + record_len)?;
		}
		let mut pos = offset as usize;
		self.mmap[pos] = tag;
		pos += 1;
		self.mmap[pos..pos + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
		pos += 4;
		self.mmap[pos..pos + 4].copy_from_slice(&(val.len() as u32).to_le_bytes());
		pos += 4;
		self.mmap[pos..pos + key.len()].copy_from_slice(key);
		pos += key.len();
		self.mmap[pos..pos + val.len()].copy_from_slice(val);
		self.mmap.flush_range(offset as usize, record_len as usize).map_err(|_| Status::IOError)?;
		self.cursor.store(offset + record_len, AtomicOrdering::Release);
		self.write_header(offset + record_len)
	}

	fn write_header(&mut self, cursor: u64) -> Result<()> {
		self.mmap[0..8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
		self.mmap[8..16].copy_from_slice(&cursor.to_le_bytes());
		self.mmap.flush_range(0, HEADER_SIZE as usize).map_err(|_| Status::IOError)
	}
}

fn replay(mmap: &MmapMut, cursor: u64) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
	let mut index = BTreeMap::new();
	let mut offset = HEADER_SIZE;
	while offset < cursor {
		let pos = offset as usize;
		let tag = mmap[pos];
		let key_len = (&mmap[pos + 1..pos + 5]).read_u32::<LittleEndian>().map_err(|_| Status::Corruption)? as u64;
		let val_len = (&mmap[pos + 5..pos + 9]).read_u32::<LittleEndian>().map_err(|_| Status::Corruption)? as u64;
		let key_start = pos + 9;
		let key_end = key_start + key_len as usize;
		let val_end = key_end + val_len as usize;
		if val_end as u64 > cursor {
			warn!("mmap log truncated at offset {}, stopping replay", offset);
			break;
		}
		let key = mmap[key_start..key_end].to_vec();
		match tag {
			TAG_PUT => {
				index.insert(key, mmap[key_end..val_end].to_vec());
			}
			TAG_ERASE => {
				index.remove(&key);
			}
			_ => return Err(Status::Corruption),
		}
		offset = val_end as u64;
	}
	Ok(index)
}

pub struct MmapEngine {
	log: RwLock<MappedLog>,
	index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
	path: PathBuf,
	migrated: AtomicBool,
	config: BackendConfig,
}

impl MmapEngine {
	fn open_or_create(path: &Path, create_if_missing: bool) -> Result<(MappedLog, BTreeMap<Vec<u8>, Vec<u8>>)> {
		let existed = path.exists();
		if !existed && !create_if_missing {
			return Err(Status::NotFound);
		}
		let file = OpenOptions::new().read(true).write(true).create(true).open(path).map_err(|_| Status::IOError)?;
		file.lock_exclusive().map_err(|_| Status::Busy)?;
		let len = file.metadata().map_err(|_| Status::IOError)?.len();
		let capacity = len.max(INITIAL_CAPACITY);
		file.set_len(capacity).map_err(|_| Status::IOError)?;
		let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|_| Status::IOError)? };
		let cursor = if existed && len >= HEADER_SIZE {
			(&mmap[8..16]).read_u64::<LittleEndian>().map_err(|_| Status::Corruption)?
		} else {
			mmap[0..8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
			mmap[8..16].copy_from_slice(&HEADER_SIZE.to_le_bytes());
			mmap.flush().map_err(|_| Status::IOError)?;
			HEADER_SIZE
		};
		let index = replay(&mmap, cursor)?;
		let log = MappedLog { file, mmap, capacity, cursor: AtomicU64::new(cursor) };
		Ok((log, index))
	}

	fn guard(&self) -> Result<()> {
		if self.migrated.load(AtomicOrdering::Acquire) {
			Err(Status::Migrated)
		} else {
			Ok(())
		}
	}
}

impl OpenBackend for MmapEngine {
	fn create(config: &BackendConfig) -> Result<Self> {
		let path = config.path.clone().ok_or(Status::InvalidConf)?;
		let (log, index) = Self::open_or_create(Path::new(&path), config.create_if_missing)?;
		Ok(MmapEngine {
			log: RwLock::new(log),
			index: RwLock::new(index),
			path: PathBuf::from(path),
			migrated: AtomicBool::new(false),
			config: config.clone(),
		})
	}

	fn recover(config: &BackendConfig, _migration_config: &serde_json::Value, files: &FileList) -> Result<Self> {
		let path = files.files.first().cloned().ok_or(Status::InvalidArg)?;
		let (log, index) = Self::open_or_create(&path, false)?;
		Ok(MmapEngine { log: RwLock::new(log), index: RwLock::new(index), path, migrated: AtomicBool::new(false), config: config.clone() })
	}
}

impl Backend for MmapEngine {
	fn engine_type(&self) -> &'static str {
		"mmap"
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
		self.index.write().clear();
		std::fs::remove_file(&self.path).map_err(|_| Status::IOError)
	}

	fn count(&self) -> Result<u64> {
		self.guard()?;
		Ok(self.index.read().len() as u64)
	}

	fn exists(&self, keys: &PackedKeys, out: &mut BitFieldMut, _mode: Mode) -> Result<()> {
		self.guard()?;
		let index = self.index.read();
		for (i, key) in keys.iter().enumerate() {
			out.set(i, index.contains_key(key));
		}
		Ok(())
	}

	fn length(&self, keys: &PackedKeys, sizes_out: &mut [u64], _mode: Mode) -> Result<()> {
		self.guard()?;
		let index = self.index.read();
		for (i, key) in keys.iter().enumerate() {
			sizes_out[i] = index.get(key).map(|v| v.len() as u64).unwrap_or(KEY_NOT_FOUND);
		}
		Ok(())
	}

	fn put(&self, keys: &PackedKeys, vals: &PackedKeys, mode: Mode) -> Result<()> {
		self.guard()?;
		if !self.supports_mode(mode) {
			return Err(Status::InvalidMode);
		}
		let multi = keys.len() > 1;
		let mut log = self.log.write();
		let mut index = self.index.write();
		for (key, val) in keys.iter().zip(vals.iter()) {
			if key.is_empty() {
				return Err(Status::InvalidArg);
			}
			let existing = index.get(key).cloned();
			if existing.is_some() && mode.new_only() {
				if multi {
					continue;
				}
				return Err(Status::KeyExists);
			}
			if existing.is_none() && mode.exist_only() {
				continue;
			}
			let final_val = if mode.append() {
				let mut buf = existing.unwrap_or_default();
				buf.extend_from_slice(val);
				buf
			} else {
				val.to_vec()
			};
			log.append(TAG_PUT, key, &final_val)?;
			index.insert(key.to_vec(), final_val);
		}
		Ok(())
	}

	fn get(&self, keys: &PackedKeys, writer: &mut PackedWriter, mode: Mode) -> Result<()> {
		self.guard()?;
		let mut consumed = Vec::new();
		for key in keys.iter() {
			let value = self.index.read().get(key).cloned();
			match value {
				Some(val) => {
					writer.write(&val);
					if mode.consume() {
						consumed.push(key.to_vec());
					}
				}
				None => writer.write_missing(),
			}
		}
		if !consumed.is_empty() {
			let mut log = self.log.write();
			let mut index = self.index.write();
			for key in &consumed {
				log.append(TAG_ERASE, key, &[])?;
				index.remove(key);
			}
		}
		Ok(())
	}

	fn fetch(&self, keys: &PackedKeys, mode: Mode, callback: &mut FetchCallback<'_>) -> Result<()> {
		self.guard()?;
		let mut consumed = Vec::new();
		for key in keys.iter() {
			let value = self.index.read().get(key).cloned();
			let flow = callback(key, value.as_deref());
			if value.is_some() && mode.consume() {
				consumed.push(key.to_vec());
			}
			if flow == ControlFlow::Stop {
				break;
			}
		}
		if !consumed.is_empty() {
			let mut log = self.log.write();
			let mut index = self.index.write();
			for key in &consumed {
				log.append(TAG_ERASE, key, &[])?;
				index.remove(key);
			}
		}
		Ok(())
	}

	fn erase(&self, keys: &PackedKeys, _mode: Mode) -> Result<()> {
		self.guard()?;
		let mut log = self.log.write();
		let mut index = self.index.write();
		for key in keys.iter() {
			if index.remove(key).is_some() {
				log.append(TAG_ERASE, key, &[])?;
			}
		}
		Ok(())
	}

	fn list_keys(&self, from_key: &[u8], filter: &dyn KeyValueFilter, mode: Mode, writer: &mut PackedWriter) -> Result<()> {
		self.guard()?;
		let index = self.index.read();
		let range = scan_range(&index, from_key, mode);
		for (k, v) in range {
			if writer.slots_remaining() == 0 {
				break;
			}
			if filter.should_stop(k) {
				break;
			}
			if filter.check(k, v) {
				writer.write(&filter.key_copy(k));
			}
		}
		writer.fill_remaining(NO_MORE_KEYS);
		Ok(())
	}

	fn list_key_values(
		&self,
		from_key: &[u8],
		filter: &dyn KeyValueFilter,
		mode: Mode,
		keys_out: &mut PackedWriter,
		vals_out: &mut PackedWriter,
	) -> Result<()> {
		self.guard()?;
		let index = self.index.read();
		let range = scan_range(&index, from_key, mode);
		let mut last_match_key: Option<Vec<u8>> = None;
		for (k, v) in range {
			if keys_out.slots_remaining() == 0 {
				break;
			}
			if filter.should_stop(k) {
				break;
			}
			if filter.check(k, v) {
				if mode.ignore_keys() {
					keys_out.write(&[]);
				} else {
					keys_out.write(&filter.key_copy(k));
				}
				if mode.keep_last() {
					last_match_key = Some(k.to_vec());
				}
				vals_out.write(&filter.val_copy(v));
			}
		}
		if let Some(k) = last_match_key {
			keys_out.rewrite_last(&filter.key_copy(&k));
		}
		keys_out.fill_remaining(NO_MORE_KEYS);
		vals_out.fill_remaining(NO_MORE_KEYS);
		Ok(())
	}

	fn iter(&self, max: usize, from_key: &[u8], filter: &dyn KeyValueFilter, mode: Mode, callback: &mut IterCallback<'_>) -> Result<()> {
		self.guard()?;
		let index = self.index.read();
		let range = scan_range(&index, from_key, mode);
		let mut emitted = 0usize;
		for (k, v) in range {
			if emitted >= max {
				break;
			}
			if filter.should_stop(k) {
				break;
			}
			if filter.check(k, v) {
				emitted += 1;
				if callback(k, v) == ControlFlow::Stop {
					break;
				}
			}
		}
		Ok(())
	}

	fn start_migration(&self, root: &Path) -> Result<FileList> {
		self.guard()?;
		self.log.read().mmap.flush().map_err(|_| Status::IOError)?;
		Ok(FileList { root: root.to_path_buf(), files: vec![self.path.clone()] })
	}

	fn mark_migrated(&self) {
		self.migrated.store(true, AtomicOrdering::Release);
		warn!("mmap engine marked migrated; further calls will return Migrated");
	}

	fn cancel_migration(&self) {}
}

fn scan_range<'a>(index: &'a BTreeMap<Vec<u8>, Vec<u8>>, from_key: &[u8], mode: Mode) -> Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a> {
	if from_key.is_empty() {
		Box::new(index.iter())
	} else if mode.inclusive() {
		Box::new(index.range(from_key.to_vec()..))
	} else {
		Box::new(index.range(from_key.to_vec()..).filter(move |(k, _)| k.as_slice() != from_key))
	}
}

/// Registers this engine's constructor under the name `"mmap"` (spec §9).
pub fn init() {
	yokan_core::registry::register_backend_with_recovery(
		"mmap",
		|config| MmapEngine::create(config).map(|db| Box::new(db) as Box<dyn Backend>),
		|config, migration_config, files| {
			MmapEngine::recover(config, migration_config, files).map(|db| Box::new(db) as Box<dyn Backend>)
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
	fn put_get_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("store.mmap");
		let mut config = BackendConfig::default();
		config.path = Some(path.to_str().unwrap().to_owned());
		config.create_if_missing = true;

		{
			let db = MmapEngine::create(&config).unwrap();
			let (kbuf, ksizes) = packed(&[b"alpha", b"beta"]);
			let (vbuf, vsizes) = packed(&[b"1", b"2"]);
			let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
			let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
			db.put(&keys, &vals, Mode::NONE).unwrap();
			// Drop releases the exclusive file lock before reopening below.
		}

		let reopened = MmapEngine::create(&config).unwrap();
		assert_eq!(reopened.count().unwrap(), 2);
	}

	#[test]
	fn shared_property_tests() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("shared.mmap");
		let mut config = BackendConfig::default();
		config.path = Some(path.to_str().unwrap().to_owned());
		config.create_if_missing = true;
		let db = MmapEngine::create(&config).unwrap();
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
