//! Single-file hash-table engine (spec §4.6 "hashfile"). Neither `gdbm`
//! nor `tkrzw` (the C++ original's single-file DBM choices) has an
//! idiomatic Rust crate equivalent in this corpus, so this engine is
//! hand-rolled: an append-only record log gives durability and crash
//! consistency, a `memmap2::Mmap` gives a zero-copy sequential replay of
//! that log on open/recovery (the same mmap-for-read idiom `kvdb-lmdb`
//! and `kvdb-rocksdb` lean on for their on-disk engines), and an
//! in-memory `HashMap` is the serving index, exactly as `yokan-unordered-map`
//! keeps one — the difference here is that every mutation is first
//! durably appended before the index is updated.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use yokan_core::backend::{Backend, ControlFlow, FetchCallback, FileList};
use yokan_core::mode::{self, Mode};
use yokan_core::slice::{BitFieldMut, PackedKeys, PackedWriter};
use yokan_core::status::{Result, Status, KEY_NOT_FOUND};
use yokan_core::{BackendConfig, OpenBackend};

const HEADER_MAGIC: u64 = 0x594F_4B41_4E48_4631;
const HEADER_SIZE: u64 = 16;
const TAG_PUT: u8 = 1;
const TAG_ERASE: u8 = 2;

enum WaitOutcome {
	Pending,
	Ready,
	TornDown,
}

struct Waiter {
	state: Mutex<WaitOutcome>,
	condvar: Condvar,
}

#[derive(Default)]
struct KeyWatcher {
	waiters: Mutex<HashMap<Vec<u8>, Vec<Arc<Waiter>>>>,
}

impl KeyWatcher {
	fn register(&self, key: &[u8]) -> Arc<Waiter> {
		let waiter = Arc::new(Waiter { state: Mutex::new(WaitOutcome::Pending), condvar: Condvar::new() });
		self.waiters.lock().entry(key.to_vec()).or_default().push(waiter.clone());
		waiter
	}

	fn block_until_ready(&self, waiter: &Arc<Waiter>) -> Result<()> {
		let mut state = waiter.state.lock();
		loop {
			match *state {
				WaitOutcome::Ready => return Ok(()),
				WaitOutcome::TornDown => return Err(Status::TimedOut),
				WaitOutcome::Pending => waiter.condvar.wait(&mut state),
			}
		}
	}

	fn notify(&self, key: &[u8]) {
		if let Some(list) = self.waiters.lock().remove(key) {
			for waiter in list {
				*waiter.state.lock() = WaitOutcome::Ready;
				waiter.condvar.notify_all();
			}
		}
	}

	fn teardown(&self) {
		for (_, list) in self.waiters.lock().drain() {
			for waiter in list {
				*waiter.state.lock() = WaitOutcome::TornDown;
				waiter.condvar.notify_all();
			}
		}
	}
}

/// Replays the record log from `HEADER_SIZE` onward into a fresh index.
fn replay(mmap: &Mmap) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
	let mut index = HashMap::new();
	let data = &mmap[..];
	if data.len() < HEADER_SIZE as usize {
		return Err(Status::Corruption);
	}
	let magic = (&data[0..8]).read_u64::<LittleEndian>().map_err(|_| Status::Corruption)?;
	if magic != HEADER_MAGIC {
		return Err(Status::Corruption);
	}
	let mut offset = HEADER_SIZE as usize;
	while offset < data.len() {
		if offset + 9 > data.len() {
			warn!("hashfile log truncated at offset {}, stopping replay", offset);
			break;
		}
		let tag = data[offset];
		let key_len = (&data[offset + 1..offset + 5]).read_u32::<LittleEndian>().map_err(|_| Status::Corruption)? as usize;
		let val_len = (&data[offset + 5..offset + 9]).read_u32::<LittleEndian>().map_err(|_| Status::Corruption)? as usize;
		offset += 9;
		if offset + key_len + val_len > data.len() {
			warn!("hashfile log truncated mid-record at offset {}, stopping replay", offset);
			break;
		}
		let key = data[offset..offset + key_len].to_vec();
		offset += key_len;
		match tag {
			TAG_PUT => {
				let val = data[offset..offset + val_len].to_vec();
				index.insert(key, val);
			}
			TAG_ERASE => {
				index.remove(&key);
			}
			_ => return Err(Status::Corruption),
		}
		offset += val_len;
	}
	Ok(index)
}

fn append_record(file: &mut File, tag: u8, key: &[u8], val: &[u8]) -> Result<()> {
	file.seek(SeekFrom::End(0)).map_err(|_| Status::IOError)?;
	file.write_u8(tag).map_err(|_| Status::IOError)?;
	file.write_u32::<LittleEndian>(key.len() as u32).map_err(|_| Status::IOError)?;
	file.write_u32::<LittleEndian>(val.len() as u32).map_err(|_| Status::IOError)?;
	file.write_all(key).map_err(|_| Status::IOError)?;
	file.write_all(val).map_err(|_| Status::IOError)?;
	file.sync_data().map_err(|_| Status::IOError)?;
	Ok(())
}

const SUPPORTED_MODES: u32 = mode::APPEND | mode::CONSUME | mode::WAIT | mode::NEW_ONLY | mode::EXIST_ONLY;

pub struct HashFileEngine {
	file: Mutex<File>,
	index: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
	watcher: KeyWatcher,
	path: PathBuf,
	migrated: AtomicBool,
	config: BackendConfig,
}

impl HashFileEngine {
	fn open_or_create(path: &Path, create_if_missing: bool) -> Result<(File, HashMap<Vec<u8>, Vec<u8>>)> {
		let existed = path.exists();
		if !existed && !create_if_missing {
			return Err(Status::NotFound);
		}
		let mut file = OpenOptions::new().read(true).write(true).create(true).open(path).map_err(|_| Status::IOError)?;
		if !existed {
			file.write_u64::<LittleEndian>(HEADER_MAGIC).map_err(|_| Status::IOError)?;
			file.write_u64::<LittleEndian>(0).map_err(|_| Status::IOError)?;
			file.sync_all().map_err(|_| Status::IOError)?;
		}
		let len = file.metadata().map_err(|_| Status::IOError)?.len();
		if len < HEADER_SIZE {
			return Err(Status::Corruption);
		}
		let mmap = unsafe { Mmap::map(&file).map_err(|_| Status::IOError)? };
		let index = replay(&mmap)?;
		Ok((file, index))
	}

	fn guard(&self) -> Result<()> {
		if self.migrated.load(AtomicOrdering::Acquire) {
			Err(Status::Migrated)
		} else {
			Ok(())
		}
	}

	fn wait_for_key(&self, key: &[u8]) -> Result<()> {
		if self.index.read().contains_key(key) {
			return Ok(());
		}
		let waiter = self.watcher.register(key);
		self.watcher.block_until_ready(&waiter)
	}
}

impl OpenBackend for HashFileEngine {
	fn create(config: &BackendConfig) -> Result<Self> {
		let path = config.path.clone().ok_or(Status::InvalidConf)?;
		let (file, index) = Self::open_or_create(Path::new(&path), config.create_if_missing)?;
		Ok(HashFileEngine {
			file: Mutex::new(file),
			index: RwLock::new(index),
			watcher: KeyWatcher::default(),
			path: PathBuf::from(path),
			migrated: AtomicBool::new(false),
			config: config.clone(),
		})
	}

	fn recover(config: &BackendConfig, _migration_config: &serde_json::Value, files: &FileList) -> Result<Self> {
		let path = files.files.first().cloned().ok_or(Status::InvalidArg)?;
		let (file, index) = Self::open_or_create(&path, false)?;
		Ok(HashFileEngine {
			file: Mutex::new(file),
			index: RwLock::new(index),
			watcher: KeyWatcher::default(),
			path,
			migrated: AtomicBool::new(false),
			config: config.clone(),
		})
	}
}

impl Backend for HashFileEngine {
	fn engine_type(&self) -> &'static str {
		"hashfile"
	}

	fn config(&self) -> serde_json::Value {
		serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
	}

	fn supported_modes(&self) -> u32 {
		SUPPORTED_MODES
	}

	fn is_sorted(&self) -> bool {
		false
	}

	fn destroy(&self) -> Result<()> {
		self.index.write().clear();
		self.watcher.teardown();
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
		let mut file = self.file.lock();
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
			append_record(&mut file, TAG_PUT, key, &final_val)?;
			index.insert(key.to_vec(), final_val);
		}
		drop(index);
		drop(file);
		if mode.notify() {
			for key in keys.iter() {
				self.watcher.notify(key);
			}
		}
		Ok(())
	}

	fn get(&self, keys: &PackedKeys, writer: &mut PackedWriter, mode: Mode) -> Result<()> {
		self.guard()?;
		let mut consumed = Vec::new();
		for key in keys.iter() {
			if mode.wait() {
				self.wait_for_key(key)?;
			}
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
			let mut file = self.file.lock();
			let mut index = self.index.write();
			for key in &consumed {
				append_record(&mut file, TAG_ERASE, key, &[])?;
				index.remove(key);
			}
		}
		Ok(())
	}

	fn fetch(&self, keys: &PackedKeys, mode: Mode, callback: &mut FetchCallback<'_>) -> Result<()> {
		self.guard()?;
		let mut consumed = Vec::new();
		for key in keys.iter() {
			if mode.wait() {
				self.wait_for_key(key)?;
			}
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
			let mut file = self.file.lock();
			let mut index = self.index.write();
			for key in &consumed {
				append_record(&mut file, TAG_ERASE, key, &[])?;
				index.remove(key);
			}
		}
		Ok(())
	}

	fn erase(&self, keys: &PackedKeys, _mode: Mode) -> Result<()> {
		self.guard()?;
		let mut file = self.file.lock();
		let mut index = self.index.write();
		for key in keys.iter() {
			if index.remove(key).is_some() {
				append_record(&mut file, TAG_ERASE, key, &[])?;
			}
		}
		Ok(())
	}

	fn start_migration(&self, root: &Path) -> Result<FileList> {
		self.guard()?;
		self.file.lock().sync_all().map_err(|_| Status::IOError)?;
		Ok(FileList { root: root.to_path_buf(), files: vec![self.path.clone()] })
	}

	fn mark_migrated(&self) {
		self.migrated.store(true, AtomicOrdering::Release);
		warn!("hashfile engine marked migrated; further calls will return Migrated");
	}

	fn cancel_migration(&self) {}
}

/// Registers this engine's constructor under the name `"hashfile"`
/// (spec §9).
pub fn init() {
	yokan_core::registry::register_backend_with_recovery(
		"hashfile",
		|config| HashFileEngine::create(config).map(|db| Box::new(db) as Box<dyn Backend>),
		|config, migration_config, files| {
			HashFileEngine::recover(config, migration_config, files).map(|db| Box::new(db) as Box<dyn Backend>)
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
	fn survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("store.hashfile");
		let mut config = BackendConfig::default();
		config.path = Some(path.to_str().unwrap().to_owned());
		config.create_if_missing = true;

		{
			let db = HashFileEngine::create(&config).unwrap();
			let (kbuf, ksizes) = packed(&[b"alpha"]);
			let (vbuf, vsizes) = packed(&[b"1"]);
			let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
			let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
			db.put(&keys, &vals, Mode::NONE).unwrap();
		}

		let reopened = HashFileEngine::create(&config).unwrap();
		assert_eq!(reopened.count().unwrap(), 1);
		let (kbuf, ksizes) = packed(&[b"alpha"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let mut out = [0u8; 8];
		let mut sizes_out = [0u64; 1];
		let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
		reopened.get(&keys, &mut writer, Mode::NONE).unwrap();
		assert_eq!(sizes_out, [1]);
	}

	#[test]
	fn shared_property_tests() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("shared.hashfile");
		let mut config = BackendConfig::default();
		config.path = Some(path.to_str().unwrap().to_owned());
		config.create_if_missing = true;
		let db = HashFileEngine::create(&config).unwrap();
		yokan_shared_tests::test_put_and_get(&db).unwrap();
		yokan_shared_tests::test_erase_is_idempotent(&db).unwrap();
		yokan_shared_tests::test_missing_key_is_reported_not_erred(&db).unwrap();
		yokan_shared_tests::test_get_reports_size_too_small(&db).unwrap();
		yokan_shared_tests::test_consume_erases_matched_keys(&db).unwrap();
		yokan_shared_tests::test_unpacked_get_uses_fixed_stride(&db).unwrap();
		yokan_shared_tests::test_packed_get_short_buffer(&db).unwrap();
		yokan_shared_tests::test_packed_and_unpacked_get_agree_on_bytes(&db).unwrap();
	}
}
