//! In-process unsorted key-value engine (spec §4.6 "unordered-map").
//!
//! Grounded on `kvdb-memorydb::InMemory`, swapping its `BTreeMap` for a
//! `std::collections::HashMap` since this engine makes no ordering
//! promise (spec §3: "Unordered: listKeys/listKeyValues/iter are
//! NotSupported"). The point operations (`put`/`get`/`fetch`/`erase`/
//! `exists`/`length`) and the `WAIT`/`NOTIFY` key-watcher are otherwise
//! the same shape as `yokan-ordered-map`.

use log::warn;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use yokan_core::backend::{Backend, ControlFlow, FetchCallback, FileList};
use yokan_core::mode::{self, Mode};
use yokan_core::slice::{BitFieldMut, PackedKeys, PackedWriter};
use yokan_core::status::{Result, Status, KEY_NOT_FOUND};
use yokan_core::{BackendConfig, OpenBackend};

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

const SUPPORTED_MODES: u32 = mode::APPEND
	| mode::CONSUME
	| mode::WAIT
	| mode::NEW_ONLY
	| mode::EXIST_ONLY;

pub struct UnorderedMap {
	data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
	watcher: KeyWatcher,
	migrated: AtomicBool,
	config: BackendConfig,
}

impl UnorderedMap {
	fn guard(&self) -> Result<()> {
		if self.migrated.load(AtomicOrdering::Acquire) {
			Err(Status::Migrated)
		} else {
			Ok(())
		}
	}

	fn wait_for_key(&self, key: &[u8]) -> Result<()> {
		if self.data.read().contains_key(key) {
			return Ok(());
		}
		let waiter = self.watcher.register(key);
		self.watcher.block_until_ready(&waiter)
	}
}

impl OpenBackend for UnorderedMap {
	fn create(config: &BackendConfig) -> Result<Self> {
		Ok(UnorderedMap {
			data: RwLock::new(HashMap::new()),
			watcher: KeyWatcher::default(),
			migrated: AtomicBool::new(false),
			config: config.clone(),
		})
	}
}

impl Backend for UnorderedMap {
	fn engine_type(&self) -> &'static str {
		"unordered-map"
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
		self.data.write().clear();
		self.watcher.teardown();
		Ok(())
	}

	fn count(&self) -> Result<u64> {
		self.guard()?;
		Ok(self.data.read().len() as u64)
	}

	fn exists(&self, keys: &PackedKeys, out: &mut BitFieldMut, _mode: Mode) -> Result<()> {
		self.guard()?;
		let data = self.data.read();
		for (i, key) in keys.iter().enumerate() {
			out.set(i, data.contains_key(key));
		}
		Ok(())
	}

	fn length(&self, keys: &PackedKeys, sizes_out: &mut [u64], _mode: Mode) -> Result<()> {
		self.guard()?;
		let data = self.data.read();
		for (i, key) in keys.iter().enumerate() {
			sizes_out[i] = data.get(key).map(|v| v.len() as u64).unwrap_or(KEY_NOT_FOUND);
		}
		Ok(())
	}

	fn put(&self, keys: &PackedKeys, vals: &PackedKeys, mode: Mode) -> Result<()> {
		self.guard()?;
		if !self.supports_mode(mode) {
			return Err(Status::InvalidMode);
		}
		let multi = keys.len() > 1;
		let mut data = self.data.write();
		for (key, val) in keys.iter().zip(vals.iter()) {
			if key.is_empty() {
				return Err(Status::InvalidArg);
			}
			let exists = data.contains_key(key);
			if exists && mode.new_only() {
				if multi {
					continue;
				}
				return Err(Status::KeyExists);
			}
			if !exists && mode.exist_only() {
				continue;
			}
			if exists && mode.append() {
				data.get_mut(key).unwrap().extend_from_slice(val);
			} else {
				data.insert(key.to_vec(), val.to_vec());
			}
		}
		drop(data);
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
			let value = self.data.read().get(key).cloned();
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
			let mut data = self.data.write();
			for key in &consumed {
				data.remove(key);
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
			let value = self.data.read().get(key).cloned();
			let flow = callback(key, value.as_deref());
			if value.is_some() && mode.consume() {
				consumed.push(key.to_vec());
			}
			if flow == ControlFlow::Stop {
				break;
			}
		}
		if !consumed.is_empty() {
			let mut data = self.data.write();
			for key in &consumed {
				data.remove(key);
			}
		}
		Ok(())
	}

	fn erase(&self, keys: &PackedKeys, _mode: Mode) -> Result<()> {
		self.guard()?;
		let mut data = self.data.write();
		for key in keys.iter() {
			data.remove(key);
		}
		Ok(())
	}

	fn start_migration(&self, _root: &std::path::Path) -> Result<FileList> {
		Err(Status::NotSupported)
	}

	fn mark_migrated(&self) {
		self.migrated.store(true, AtomicOrdering::Release);
		warn!("unordered-map engine marked migrated; further calls will return Migrated");
	}

	fn cancel_migration(&self) {}
}

/// Registers this engine's constructor under the name `"unordered-map"`
/// (spec §9 "Backend and filter registration").
pub fn init() {
	yokan_core::registry::register_backend("unordered-map", |config| {
		UnorderedMap::create(config).map(|db| Box::new(db) as Box<dyn Backend>)
	});
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
		let db = UnorderedMap::create(&BackendConfig::default()).unwrap();
		let (kbuf, ksizes) = packed(&[b"alpha", b"beta"]);
		let (vbuf, vsizes) = packed(&[b"1", b"22"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
		db.put(&keys, &vals, Mode::NONE).unwrap();
		assert_eq!(db.count().unwrap(), 2);

		let (qbuf, qsizes) = packed(&[b"alpha", b"missing"]);
		let query = PackedKeys::new(&qbuf, &qsizes).unwrap();
		let mut out = [0u8; 8];
		let mut sizes_out = [0u64; 2];
		let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
		db.get(&query, &mut writer, Mode::NONE).unwrap();
		assert_eq!(sizes_out, [1, KEY_NOT_FOUND]);
	}

	#[test]
	fn consume_removes_key() {
		let db = UnorderedMap::create(&BackendConfig::default()).unwrap();
		let (kbuf, ksizes) = packed(&[b"k"]);
		let (vbuf, vsizes) = packed(&[b"v"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
		db.put(&keys, &vals, Mode::NONE).unwrap();

		let mut out = [0u8; 8];
		let mut sizes_out = [0u64; 1];
		let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
		db.get(&keys, &mut writer, Mode::new(mode::CONSUME)).unwrap();
		assert_eq!(sizes_out, [1]);
		assert_eq!(db.count().unwrap(), 0);
	}

	#[test]
	fn exist_only_skips_missing_key() {
		let db = UnorderedMap::create(&BackendConfig::default()).unwrap();
		let (kbuf, ksizes) = packed(&[b"k"]);
		let (vbuf, vsizes) = packed(&[b"v"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
		db.put(&keys, &vals, Mode::new(mode::EXIST_ONLY)).unwrap();
		assert_eq!(db.count().unwrap(), 0);
	}

	#[test]
	fn shared_property_tests() {
		let db = UnorderedMap::create(&BackendConfig::default()).unwrap();
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
