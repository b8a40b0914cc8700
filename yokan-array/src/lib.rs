//! Document-native in-memory array engine (spec §4.8).
//!
//! A collection is `(contiguous byte buffer, size vector, offset vector,
//! live count)` held entirely in memory; ids are just indices into the
//! size/offset vectors. There is no on-disk representation while the
//! engine runs — `startMigration` instead serializes every collection
//! into one flat snapshot file (`[num_colls][name_size][name][coll_size]`
//! then per-slot `[size]` and payload unless tombstone), which `recover`
//! reads back. Like `yokan-log`, this engine has no key/value
//! representation and implements the document operations directly rather
//! than going through [`yokan_core::docstore::DocumentStore`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use yokan_core::backend::{Backend, ControlFlow, DocFetchCallback, DocIterCallback, FileList};
use yokan_core::filter::DocFilter;
use yokan_core::mode::Mode;
use yokan_core::slice::{PackedKeys, PackedWriter};
use yokan_core::status::{Result, Status, KEY_NOT_FOUND, NO_MORE_DOCS};
use yokan_core::{BackendConfig, OpenBackend};

const TOMBSTONE: u64 = KEY_NOT_FOUND;
const SUPPORTED_MODES: u32 = yokan_core::mode::UPDATE_NEW | yokan_core::mode::INCLUSIVE | yokan_core::mode::IGNORE_DOCS | yokan_core::mode::CONSUME;

#[derive(Default)]
struct Collection {
	buffer: Vec<u8>,
	sizes: Vec<u64>,
	offsets: Vec<u64>,
	live_count: u64,
}

impl Collection {
	fn last_id(&self) -> u64 {
		self.sizes.len() as u64
	}

	fn is_tombstone(&self, id: u64) -> bool {
		id as usize >= self.sizes.len() || self.sizes[id as usize] == TOMBSTONE
	}

	fn payload(&self, id: u64) -> &[u8] {
		let offset = self.offsets[id as usize] as usize;
		let size = self.sizes[id as usize] as usize;
		&self.buffer[offset..offset + size]
	}

	fn append(&mut self, payload: &[u8]) -> u64 {
		let offset = self.buffer.len() as u64;
		self.buffer.extend_from_slice(payload);
		offset
	}

	fn set_slot(&mut self, id: u64, offset: u64, size: u64) {
		let idx = id as usize;
		if idx >= self.sizes.len() {
			self.sizes.resize(idx + 1, TOMBSTONE);
			self.offsets.resize(idx + 1, TOMBSTONE);
		}
		self.sizes[idx] = size;
		self.offsets[idx] = offset;
	}
}

fn write_snapshot(path: &Path, collections: &HashMap<Vec<u8>, RwLock<Collection>>) -> Result<()> {
	let file = File::create(path).map_err(|_| Status::IOError)?;
	let mut w = BufWriter::new(file);
	w.write_u64::<LittleEndian>(collections.len() as u64).map_err(|_| Status::IOError)?;
	for (name, lock) in collections {
		let coll = lock.read();
		w.write_u64::<LittleEndian>(name.len() as u64).map_err(|_| Status::IOError)?;
		w.write_all(name).map_err(|_| Status::IOError)?;
		w.write_u64::<LittleEndian>(coll.last_id()).map_err(|_| Status::IOError)?;
		for id in 0..coll.last_id() {
			let size = coll.sizes[id as usize];
			w.write_u64::<LittleEndian>(size).map_err(|_| Status::IOError)?;
			if size != TOMBSTONE {
				w.write_all(coll.payload(id)).map_err(|_| Status::IOError)?;
			}
		}
	}
	w.flush().map_err(|_| Status::IOError)
}

fn read_snapshot(path: &Path) -> Result<HashMap<Vec<u8>, RwLock<Collection>>> {
	let file = File::open(path).map_err(|_| Status::IOError)?;
	let mut r = BufReader::new(file);
	let num_colls = r.read_u64::<LittleEndian>().map_err(|_| Status::Corruption)?;
	let mut collections = HashMap::new();
	for _ in 0..num_colls {
		let name_size = r.read_u64::<LittleEndian>().map_err(|_| Status::Corruption)? as usize;
		let mut name = vec![0u8; name_size];
		r.read_exact(&mut name).map_err(|_| Status::Corruption)?;
		let coll_size = r.read_u64::<LittleEndian>().map_err(|_| Status::Corruption)?;
		let mut coll = Collection::default();
		for _ in 0..coll_size {
			let size = r.read_u64::<LittleEndian>().map_err(|_| Status::Corruption)?;
			if size == TOMBSTONE {
				coll.sizes.push(TOMBSTONE);
				coll.offsets.push(TOMBSTONE);
			} else {
				let mut payload = vec![0u8; size as usize];
				r.read_exact(&mut payload).map_err(|_| Status::Corruption)?;
				let offset = coll.append(&payload);
				coll.sizes.push(size);
				coll.offsets.push(offset);
				coll.live_count += 1;
			}
		}
		collections.insert(name, RwLock::new(coll));
	}
	Ok(collections)
}

fn valid_collection_name(name: &[u8]) -> bool {
	!name.is_empty()
}

pub struct ArrayEngine {
	snapshot_path: Option<PathBuf>,
	collections: RwLock<HashMap<Vec<u8>, RwLock<Collection>>>,
	migrated: AtomicBool,
	config: BackendConfig,
}

impl ArrayEngine {
	fn guard(&self) -> Result<()> {
		yokan_core::migration::guard_migrated(self.migrated.load(AtomicOrdering::Acquire))
	}

	fn with_coll<T>(&self, name: &[u8], f: impl FnOnce(&Collection) -> Result<T>) -> Result<T> {
		let colls = self.collections.read();
		let lock = colls.get(name).ok_or(Status::NotFound)?;
		f(&lock.read())
	}

	fn with_coll_mut<T>(&self, name: &[u8], f: impl FnOnce(&mut Collection) -> Result<T>) -> Result<T> {
		let colls = self.collections.read();
		let lock = colls.get(name).ok_or(Status::NotFound)?;
		f(&mut lock.write())
	}
}

impl OpenBackend for ArrayEngine {
	fn create(config: &BackendConfig) -> Result<Self> {
		let snapshot_path = config.path.clone().map(PathBuf::from);
		let collections = match &snapshot_path {
			Some(path) if path.exists() => read_snapshot(path)?,
			_ => HashMap::new(),
		};
		Ok(ArrayEngine { snapshot_path, collections: RwLock::new(collections), migrated: AtomicBool::new(false), config: config.clone() })
	}

	fn recover(config: &BackendConfig, _migration_config: &serde_json::Value, files: &FileList) -> Result<Self> {
		let path = files.files.first().cloned().ok_or(Status::InvalidArg)?;
		let collections = read_snapshot(&path)?;
		Ok(ArrayEngine { snapshot_path: Some(path), collections: RwLock::new(collections), migrated: AtomicBool::new(false), config: config.clone() })
	}
}

impl Backend for ArrayEngine {
	fn engine_type(&self) -> &'static str {
		"array"
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
		self.collections.write().clear();
		if let Some(path) = &self.snapshot_path {
			let _ = std::fs::remove_file(path);
		}
		Ok(())
	}

	fn coll_create(&self, name: &[u8]) -> Result<()> {
		self.guard()?;
		if !valid_collection_name(name) {
			return Err(Status::InvalidArg);
		}
		let mut colls = self.collections.write();
		if colls.contains_key(name) {
			return Err(Status::KeyExists);
		}
		colls.insert(name.to_vec(), RwLock::new(Collection::default()));
		Ok(())
	}

	fn coll_drop(&self, name: &[u8]) -> Result<()> {
		self.guard()?;
		let mut colls = self.collections.write();
		colls.remove(name).ok_or(Status::NotFound)?;
		Ok(())
	}

	fn coll_exists(&self, name: &[u8]) -> Result<bool> {
		self.guard()?;
		Ok(self.collections.read().contains_key(name))
	}

	fn coll_last_id(&self, name: &[u8]) -> Result<u64> {
		self.guard()?;
		self.with_coll(name, |coll| Ok(coll.last_id()))
	}

	fn coll_size(&self, name: &[u8]) -> Result<u64> {
		self.guard()?;
		self.with_coll(name, |coll| Ok(coll.live_count))
	}

	fn doc_size(&self, coll: &[u8], ids: &[u64], sizes_out: &mut [u64]) -> Result<()> {
		self.guard()?;
		match self.with_coll(coll, |c| {
			for (i, &id) in ids.iter().enumerate() {
				sizes_out[i] = if c.is_tombstone(id) { KEY_NOT_FOUND } else { c.sizes[id as usize] };
			}
			Ok(())
		}) {
			Ok(()) => Ok(()),
			Err(Status::NotFound) => {
				for s in sizes_out.iter_mut() {
					*s = KEY_NOT_FOUND;
				}
				Ok(())
			}
			Err(e) => Err(e),
		}
	}

	fn doc_store(&self, coll: &[u8], docs: &PackedKeys, ids_out: &mut [u64]) -> Result<()> {
		self.guard()?;
		self.with_coll_mut(coll, |c| {
			for (i, payload) in docs.iter().enumerate() {
				let id = c.last_id();
				let offset = c.append(payload);
				c.sizes.push(payload.len() as u64);
				c.offsets.push(offset);
				c.live_count += 1;
				ids_out[i] = id;
			}
			Ok(())
		})
	}

	fn doc_update(&self, coll: &[u8], ids: &[u64], docs: &PackedKeys, mode: Mode) -> Result<()> {
		self.guard()?;
		self.with_coll_mut(coll, |c| {
			let max_id = ids.iter().copied().max().unwrap_or(0);
			let old_last_id = c.last_id();
			if max_id >= old_last_id && !mode.update_new() {
				return Err(Status::InvalidID);
			}
			for (&id, payload) in ids.iter().zip(docs.iter()) {
				let was_live = !c.is_tombstone(id);
				let offset = c.append(payload);
				c.set_slot(id, offset, payload.len() as u64);
				if !was_live {
					c.live_count += 1;
				}
			}
			Ok(())
		})
	}

	fn doc_load(&self, coll: &[u8], ids: &[u64], writer: &mut PackedWriter, _mode: Mode) -> Result<()> {
		self.guard()?;
		self.with_coll(coll, |c| {
			for &id in ids {
				if c.is_tombstone(id) {
					writer.write_missing();
				} else {
					writer.write(c.payload(id));
				}
			}
			Ok(())
		})
	}

	fn doc_fetch(&self, coll: &[u8], ids: &[u64], mode: Mode, callback: &mut DocFetchCallback<'_>) -> Result<()> {
		self.guard()?;
		let to_erase = self.with_coll(coll, |c| {
			let mut erased = Vec::new();
			for &id in ids {
				let flow = if c.is_tombstone(id) { callback(id, None) } else { callback(id, Some(c.payload(id))) };
				if !c.is_tombstone(id) && mode.consume() {
					erased.push(id);
				}
				if flow == ControlFlow::Stop {
					break;
				}
			}
			Ok(erased)
		})?;
		if !to_erase.is_empty() {
			self.doc_erase(coll, &to_erase)?;
		}
		Ok(())
	}

	fn doc_erase(&self, coll: &[u8], ids: &[u64]) -> Result<()> {
		self.guard()?;
		self.with_coll_mut(coll, |c| {
			for &id in ids {
				if !c.is_tombstone(id) {
					c.sizes[id as usize] = TOMBSTONE;
					c.offsets[id as usize] = TOMBSTONE;
					c.live_count = c.live_count.saturating_sub(1);
				}
			}
			Ok(())
		})
	}

	fn doc_list(
		&self,
		coll: &[u8],
		from_id: u64,
		filter: &dyn DocFilter,
		mode: Mode,
		ids_out: &mut [u64],
		writer: &mut PackedWriter,
	) -> Result<()> {
		self.guard()?;
		self.with_coll(coll, |c| {
			let mut start = from_id;
			if !mode.inclusive() && start < c.last_id() {
				start += 1;
			}
			let mut idx = 0usize;
			let mut id = start;
			while id < c.last_id() && idx < ids_out.len() {
				if !c.is_tombstone(id) {
					let payload = c.payload(id);
					if filter.should_stop(id) {
						break;
					}
					if filter.check(id, payload) {
						ids_out[idx] = id;
						if !mode.ignore_docs() {
							writer.write(&filter.doc_copy(payload));
						}
						idx += 1;
					}
				}
				id += 1;
			}
			for slot in ids_out.iter_mut().skip(idx) {
				*slot = NO_MORE_DOCS;
			}
			writer.fill_remaining(NO_MORE_DOCS);
			Ok(())
		})
	}

	fn doc_iter(
		&self,
		coll: &[u8],
		max: usize,
		from_id: u64,
		filter: &dyn DocFilter,
		mode: Mode,
		callback: &mut DocIterCallback<'_>,
	) -> Result<()> {
		self.guard()?;
		self.with_coll(coll, |c| {
			let mut start = from_id;
			if !mode.inclusive() && start < c.last_id() {
				start += 1;
			}
			let mut emitted = 0usize;
			let mut id = start;
			while id < c.last_id() && emitted < max {
				if !c.is_tombstone(id) {
					let payload = c.payload(id);
					if filter.should_stop(id) {
						break;
					}
					if filter.check(id, payload) {
						emitted += 1;
						if callback(id, payload) == ControlFlow::Stop {
							break;
						}
					}
				}
				id += 1;
			}
			Ok(())
		})
	}

	fn start_migration(&self, root: &Path) -> Result<FileList> {
		self.guard()?;
		let path = root.join("array.snapshot");
		write_snapshot(&path, &self.collections.read())?;
		Ok(FileList { root: root.to_path_buf(), files: vec![path] })
	}

	fn mark_migrated(&self) {
		self.collections.write().clear();
		self.migrated.store(true, AtomicOrdering::Release);
		warn!("array engine marked migrated; further calls will return Migrated");
	}

	fn cancel_migration(&self) {}
}

/// Registers this engine's constructor under the name `"array"` (spec §9).
pub fn init() {
	yokan_core::registry::register_backend_with_recovery(
		"array",
		|config| ArrayEngine::create(config).map(|db| Box::new(db) as Box<dyn Backend>),
		|config, migration_config, files| ArrayEngine::recover(config, migration_config, files).map(|db| Box::new(db) as Box<dyn Backend>),
	);
}

#[cfg(test)]
mod tests {
	use super::*;
	use yokan_core::filter::MatchAllFilter;

	fn packed(items: &[&[u8]]) -> (Vec<u8>, Vec<u64>) {
		let mut buf = Vec::new();
		let mut sizes = Vec::new();
		for item in items {
			buf.extend_from_slice(item);
			sizes.push(item.len() as u64);
		}
		(buf, sizes)
	}

	fn new_engine() -> ArrayEngine {
		ArrayEngine::create(&BackendConfig::default()).unwrap()
	}

	#[test]
	fn store_and_load_roundtrip() {
		let db = new_engine();
		db.coll_create(b"events").unwrap();
		let (dbuf, dsizes) = packed(&[b"hello", b"world"]);
		let docs = PackedKeys::new(&dbuf, &dsizes).unwrap();
		let mut ids = [0u64; 2];
		db.doc_store(b"events", &docs, &mut ids).unwrap();
		assert_eq!(ids, [0, 1]);
		assert_eq!(db.coll_size(b"events").unwrap(), 2);

		let mut buf = [0u8; 16];
		let mut sizes = [0u64; 2];
		let mut writer = PackedWriter::new(&mut buf, &mut sizes);
		db.doc_load(b"events", &ids, &mut writer, Mode::NONE).unwrap();
		assert_eq!(sizes, [5, 5]);
	}

	#[test]
	fn update_new_pads_gaps_with_tombstones() {
		let db = new_engine();
		db.coll_create(b"events").unwrap();
		let (dbuf, dsizes) = packed(&[b"late"]);
		let docs = PackedKeys::new(&dbuf, &dsizes).unwrap();
		db.doc_update(b"events", &[3], &docs, Mode::new(yokan_core::mode::UPDATE_NEW)).unwrap();
		assert_eq!(db.coll_last_id(b"events").unwrap(), 4);

		let mut sizes_out = [0u64; 4];
		db.doc_size(b"events", &[0, 1, 2, 3], &mut sizes_out).unwrap();
		assert_eq!(sizes_out, [KEY_NOT_FOUND, KEY_NOT_FOUND, KEY_NOT_FOUND, 4]);
	}

	#[test]
	fn snapshot_roundtrip_through_migration() {
		let dir = tempfile::tempdir().unwrap();
		let db = new_engine();
		db.coll_create(b"events").unwrap();
		let (dbuf, dsizes) = packed(&[b"one", b"two"]);
		let docs = PackedKeys::new(&dbuf, &dsizes).unwrap();
		let mut ids = [0u64; 2];
		db.doc_store(b"events", &docs, &mut ids).unwrap();

		let files = db.start_migration(dir.path()).unwrap();
		db.mark_migrated();

		let recovered = ArrayEngine::recover(&BackendConfig::default(), &serde_json::Value::Null, &files).unwrap();
		assert_eq!(recovered.coll_size(b"events").unwrap(), 2);
		let mut ids_out = [0u64; 2];
		let mut buf = [0u8; 16];
		let mut sizes = [0u64; 2];
		let mut writer = PackedWriter::new(&mut buf, &mut sizes);
		recovered.doc_list(b"events", 0, &MatchAllFilter, Mode::new(yokan_core::mode::INCLUSIVE), &mut ids_out, &mut writer).unwrap();
		assert_eq!(ids_out, [0, 1]);
	}

	#[test]
	fn shared_property_tests() {
		let dir = tempfile::tempdir().unwrap();
		let db = new_engine();
		yokan_shared_tests::test_document_store_roundtrip(&db).unwrap();
		yokan_shared_tests::test_collection_drop_removes_documents(&db).unwrap();
		yokan_shared_tests::test_doc_migration_marks_engine_migrated(&db, dir.path()).unwrap();
		yokan_shared_tests::test_doc_load_unpacked_uses_fixed_stride(&db).unwrap();
	}
}
