//! In-process ordered key-value engine (spec §4.6 "ordered-map").
//!
//! Grounded on `kvdb-memorydb::InMemory`, which backs a
//! `KeyValueDB` column by a `BTreeMap<Vec<u8>, DBValue>` guarded by a
//! `parking_lot::RwLock`. This engine keeps that shape but adds the
//! injectable comparator and the `WAIT`/`NOTIFY` key-watcher that the
//! C++ original's `map.cpp` wires up to `include/yokan/watcher.hpp`
//! (spec §9 "WAIT/NOTIFY").
//!
//! Custom comparators are modeled as a sorted `Vec` rather than a
//! `BTreeMap`, because `std::collections::BTreeMap` has no way to accept
//! a comparator supplied at runtime; this keeps ordered iteration and
//! prefix scans O(log n) to locate a cursor and O(1) to advance, at the
//! cost of O(n) insertion — an acceptable trade for a reference in-memory
//! engine, and noted as an open design choice in `DESIGN.md`.

use log::warn;
use parking_lot::{Condvar, Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use yokan_core::backend::{Backend, ControlFlow, FetchCallback, FileList, IterCallback};
use yokan_core::filter::KeyValueFilter;
use yokan_core::mode::{self, Mode};
use yokan_core::slice::{BitFieldMut, PackedKeys, PackedWriter};
use yokan_core::status::{Result, Status, KEY_NOT_FOUND, NO_MORE_KEYS};
use yokan_core::{BackendConfig, OpenBackend};

pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

fn default_comparator() -> Comparator {
	Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

/// Per-key waiter state for `WAIT`/`NOTIFY` (spec §4.2, §5, §9).
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

const SUPPORTED_MODES: u32 = mode::INCLUSIVE
	| mode::APPEND
	| mode::CONSUME
	| mode::WAIT
	| mode::NEW_ONLY
	| mode::EXIST_ONLY
	| mode::NO_PREFIX
	| mode::IGNORE_KEYS
	| mode::KEEP_LAST
	| mode::SUFFIX
	| mode::FILTER_VALUE;

pub struct OrderedMap {
	data: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
	comparator: Comparator,
	watcher: KeyWatcher,
	migrated: AtomicBool,
	config: BackendConfig,
}

impl OrderedMap {
	pub fn with_comparator(config: BackendConfig, comparator: Comparator) -> Self {
		OrderedMap { data: RwLock::new(Vec::new()), comparator, watcher: KeyWatcher::default(), migrated: AtomicBool::new(false), config }
	}

	fn guard(&self) -> Result<()> {
		if self.migrated.load(AtomicOrdering::Acquire) {
			Err(Status::Migrated)
		} else {
			Ok(())
		}
	}

	/// Binary search under `self.comparator`; `Ok(i)` means `data[i].0 == key`.
	fn locate(data: &[(Vec<u8>, Vec<u8>)], comparator: &Comparator, key: &[u8]) -> std::result::Result<usize, usize> {
		data.binary_search_by(|(k, _)| (comparator)(k, key))
	}

	fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
		let data = self.data.read();
		match Self::locate(&data, &self.comparator, key) {
			Ok(i) => Some(data[i].1.clone()),
			Err(_) => None,
		}
	}

	fn wait_for_key(&self, key: &[u8]) -> Result<()> {
		if self.get_value(key).is_some() {
			return Ok(());
		}
		let waiter = self.watcher.register(key);
		self.watcher.block_until_ready(&waiter)
	}
}

impl OpenBackend for OrderedMap {
	fn create(config: &BackendConfig) -> Result<Self> {
		let comparator = if config.comparator.is_empty() || config.comparator == "default" {
			default_comparator()
		} else {
			return Err(Status::InvalidConf);
		};
		Ok(OrderedMap::with_comparator(config.clone(), comparator))
	}
}

impl Backend for OrderedMap {
	fn engine_type(&self) -> &'static str {
		"ordered-map"
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
		for (i, key) in keys.iter().enumerate() {
			out.set(i, self.get_value(key).is_some());
		}
		Ok(())
	}

	fn length(&self, keys: &PackedKeys, sizes_out: &mut [u64], _mode: Mode) -> Result<()> {
		self.guard()?;
		for (i, key) in keys.iter().enumerate() {
			sizes_out[i] = self.get_value(key).map(|v| v.len() as u64).unwrap_or(KEY_NOT_FOUND);
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
			match Self::locate(&data, &self.comparator, key) {
				Ok(i) => {
					if mode.new_only() {
						if multi {
							continue;
						}
						return Err(Status::KeyExists);
					}
					if mode.append() {
						data[i].1.extend_from_slice(val);
					} else {
						data[i].1 = val.to_vec();
					}
				}
				Err(i) => {
					if mode.exist_only() {
						continue;
					}
					data.insert(i, (key.to_vec(), val.to_vec()));
				}
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
			match self.get_value(key) {
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
				if let Ok(i) = Self::locate(&data, &self.comparator, key) {
					data.remove(i);
				}
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
			let value = self.get_value(key);
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
				if let Ok(i) = Self::locate(&data, &self.comparator, key) {
					data.remove(i);
				}
			}
		}
		Ok(())
	}

	fn erase(&self, keys: &PackedKeys, _mode: Mode) -> Result<()> {
		self.guard()?;
		let mut data = self.data.write();
		for key in keys.iter() {
			if let Ok(i) = Self::locate(&data, &self.comparator, key) {
				data.remove(i);
			}
		}
		Ok(())
	}

	fn list_keys(&self, from_key: &[u8], filter: &dyn KeyValueFilter, mode: Mode, writer: &mut PackedWriter) -> Result<()> {
		self.guard()?;
		let data = self.data.read();
		let start = cursor_start(&data, &self.comparator, from_key, mode);
		let mut count = 0usize;
		for (k, v) in data.iter().skip(start) {
			if writer.slots_remaining() == 0 {
				break;
			}
			if filter.should_stop(k) {
				break;
			}
			if filter.check(k, v) {
				writer.write(&filter.key_copy(k));
				count += 1;
			}
		}
		let _ = count;
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
		let data = self.data.read();
		let start = cursor_start(&data, &self.comparator, from_key, mode);
		let mut last_match_key: Option<Vec<u8>> = None;
		for (k, v) in data.iter().skip(start) {
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
					last_match_key = Some(k.clone());
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
		let data = self.data.read();
		let start = cursor_start(&data, &self.comparator, from_key, mode);
		let mut emitted = 0usize;
		for (k, v) in data.iter().skip(start) {
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

	fn start_migration(&self, _root: &std::path::Path) -> Result<FileList> {
		Err(Status::NotSupported)
	}

	fn mark_migrated(&self) {
		self.migrated.store(true, AtomicOrdering::Release);
		warn!("ordered-map engine marked migrated; further calls will return Migrated");
	}

	fn cancel_migration(&self) {}
}

fn cursor_start(data: &[(Vec<u8>, Vec<u8>)], comparator: &Comparator, from_key: &[u8], mode: Mode) -> usize {
	if from_key.is_empty() {
		return 0;
	}
	match OrderedMap::locate(data, comparator, from_key) {
		Ok(i) => {
			if mode.inclusive() {
				i
			} else {
				i + 1
			}
		}
		Err(i) => i,
	}
}

/// Registers this engine's constructor under the name `"ordered-map"`
/// (spec §9 "Backend and filter registration").
pub fn init() {
	yokan_core::registry::register_backend("ordered-map", |config| {
		OrderedMap::create(config).map(|db| Box::new(db) as Box<dyn Backend>)
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use yokan_core::filter::PrefixFilter;

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
		let db = OrderedMap::create(&BackendConfig::default()).unwrap();
		let (kbuf, ksizes) = packed(&[b"alpha", b"beta", b"gamma"]);
		let (vbuf, vsizes) = packed(&[b"1", b"22", b"333"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
		db.put(&keys, &vals, Mode::NONE).unwrap();

		let (qbuf, qsizes) = packed(&[b"alpha", b"beta", b"gamma", b"delta"]);
		let query = PackedKeys::new(&qbuf, &qsizes).unwrap();
		let mut out = [0u8; 32];
		let mut sizes_out = [0u64; 4];
		let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
		db.get(&query, &mut writer, Mode::NONE).unwrap();
		assert_eq!(sizes_out, [1, 2, 3, KEY_NOT_FOUND]);
	}

	#[test]
	fn prefix_scan_with_no_prefix() {
		let db = OrderedMap::create(&BackendConfig::default()).unwrap();
		let (kbuf, ksizes) = packed(&[b"user:1", b"user:2", b"zeta"]);
		let (vbuf, vsizes) = packed(&[b"a", b"b", b"c"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
		db.put(&keys, &vals, Mode::NONE).unwrap();

		let filter = PrefixFilter::new(b"user:".to_vec(), true);
		let mut out = [0u8; 8];
		let mut sizes_out = [0u64; 4];
		let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
		db.list_keys(b"", &filter, Mode::new(mode::NO_PREFIX), &mut writer).unwrap();
		assert_eq!(sizes_out, [1, 1, NO_MORE_KEYS, NO_MORE_KEYS]);
		assert_eq!(&out[..2], b"12");
	}

	#[test]
	fn new_only_single_key_collision() {
		let db = OrderedMap::create(&BackendConfig::default()).unwrap();
		let (kbuf, ksizes) = packed(&[b"k"]);
		let (vbuf, vsizes) = packed(&[b"v1"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
		db.put(&keys, &vals, Mode::NONE).unwrap();

		let (vbuf2, vsizes2) = packed(&[b"v2"]);
		let vals2 = PackedKeys::new(&vbuf2, &vsizes2).unwrap();
		let err = db.put(&keys, &vals2, Mode::new(mode::NEW_ONLY)).unwrap_err();
		assert_eq!(err, Status::KeyExists);
	}

	#[test]
	fn migrated_engine_rejects_mutation() {
		let db = OrderedMap::create(&BackendConfig::default()).unwrap();
		db.mark_migrated();
		let (kbuf, ksizes) = packed(&[b"x"]);
		let (vbuf, vsizes) = packed(&[b"y"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
		assert_eq!(db.put(&keys, &vals, Mode::NONE).unwrap_err(), Status::Migrated);
	}

	#[test]
	fn shared_property_tests() {
		let db = OrderedMap::create(&BackendConfig::default()).unwrap();
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
