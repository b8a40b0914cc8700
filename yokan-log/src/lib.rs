//! Document-native append-only log engine (spec §4.7).
//!
//! A collection is a directory: a memory-mapped metadata file holding a
//! `[live_count][next_id][last_chunk_id]` header followed by a
//! `(chunk, offset, size)` entry per allocated id, plus numbered chunk
//! files whose first eight bytes hold the next-free offset. `docStore`
//! writes payload, then chunk header, then metadata entry, then the
//! top-level header, syncing after each step — the ordering spec §4.7
//! describes to make a crash leave either no visible record or a fully
//! committed one. This engine has no key/value representation: every
//! `Backend` key/value method is left at the `NotSupported` default and
//! the document operations below are implemented directly, mirroring how
//! `yokan-hashfile` hand-rolls its own on-disk format where the pack has
//! no ready-made crate for it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use yokan_core::backend::{Backend, ControlFlow, DocFetchCallback, DocIterCallback, FileList};
use yokan_core::filter::DocFilter;
use yokan_core::mode::Mode;
use yokan_core::slice::PackedKeys;
use yokan_core::slice::PackedWriter;
use yokan_core::status::{Result, Status, KEY_NOT_FOUND, NO_MORE_DOCS};
use yokan_core::{BackendConfig, OpenBackend};

const META_HEADER_SIZE: u64 = 24;
const ENTRY_SIZE: u64 = 24;
const CHUNK_HEADER_SIZE: u64 = 8;
const INITIAL_META_ENTRIES: u64 = 1024;
const TOMBSTONE: u64 = KEY_NOT_FOUND;
const NO_CHUNK: u64 = u64::MAX;
const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

fn read_u64(buf: &[u8], at: usize) -> u64 {
	u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn write_u64(buf: &mut [u8], at: usize, val: u64) {
	buf[at..at + 8].copy_from_slice(&val.to_le_bytes());
}

/// Stamps entries `[from_id, to_id)` with the tombstone sentinel. Entry
/// regions come back zero-filled from `File::set_len` — on first creation
/// as much as on later growth — which would decode as a live (chunk 0,
/// offset 0, size 0) document rather than an absent one.
fn stamp_tombstones(meta: &mut [u8], from_id: u64, to_id: u64) {
	for gap_id in from_id..to_id {
		let pos = (META_HEADER_SIZE + gap_id * ENTRY_SIZE) as usize;
		write_u64(meta, pos, TOMBSTONE);
		write_u64(meta, pos + 8, TOMBSTONE);
		write_u64(meta, pos + 16, TOMBSTONE);
	}
}

struct Chunk {
	file: File,
	mmap: MmapMut,
}

impl Chunk {
	fn next_offset(&self) -> u64 {
		read_u64(&self.mmap, 0)
	}

	fn set_next_offset(&mut self, offset: u64) -> Result<()> {
		write_u64(&mut self.mmap, 0, offset);
		self.mmap.flush_range(0, CHUNK_HEADER_SIZE as usize).map_err(|_| Status::IOError)
	}
}

struct Entry {
	chunk: u64,
	offset: u64,
	size: u64,
}

impl Entry {
	fn is_tombstone(&self) -> bool {
		self.chunk == TOMBSTONE || self.size == TOMBSTONE
	}
}

/// A single collection: a metadata file plus a set of lazily-opened chunk
/// files, all rooted at `dir`.
struct CollectionHandle {
	dir: PathBuf,
	chunk_size: u64,
	meta_file: File,
	meta_mmap: RwLock<MmapMut>,
	chunks: RwLock<HashMap<u64, Chunk>>,
	write_lock: Mutex<()>,
}

impl CollectionHandle {
	fn create(dir: &Path, chunk_size: u64) -> Result<Self> {
		fs::create_dir_all(dir).map_err(|_| Status::IOError)?;
		let meta_path = dir.join("meta");
		let meta_file = OpenOptions::new().read(true).write(true).create(true).open(&meta_path).map_err(|_| Status::IOError)?;
		let capacity = META_HEADER_SIZE + INITIAL_META_ENTRIES * ENTRY_SIZE;
		meta_file.set_len(capacity).map_err(|_| Status::IOError)?;
		let mut meta_mmap = unsafe { MmapMut::map_mut(&meta_file).map_err(|_| Status::IOError)? };
		write_u64(&mut meta_mmap, 0, 0); // live_count
		write_u64(&mut meta_mmap, 8, 0); // next_id
		write_u64(&mut meta_mmap, 16, NO_CHUNK); // last_chunk_id, none yet
		stamp_tombstones(&mut meta_mmap, 0, INITIAL_META_ENTRIES);
		meta_mmap.flush().map_err(|_| Status::IOError)?;
		Ok(CollectionHandle {
			dir: dir.to_path_buf(),
			chunk_size,
			meta_file,
			meta_mmap: RwLock::new(meta_mmap),
			chunks: RwLock::new(HashMap::new()),
			write_lock: Mutex::new(()),
		})
	}

	fn open(dir: &Path, chunk_size: u64) -> Result<Self> {
		let meta_path = dir.join("meta");
		if !meta_path.exists() {
			return Err(Status::NotFound);
		}
		let meta_file = OpenOptions::new().read(true).write(true).open(&meta_path).map_err(|_| Status::IOError)?;
		let meta_mmap = unsafe { MmapMut::map_mut(&meta_file).map_err(|_| Status::IOError)? };
		Ok(CollectionHandle {
			dir: dir.to_path_buf(),
			chunk_size,
			meta_file,
			meta_mmap: RwLock::new(meta_mmap),
			chunks: RwLock::new(HashMap::new()),
			write_lock: Mutex::new(()),
		})
	}

	fn header(&self) -> (u64, u64, u64) {
		let meta = self.meta_mmap.read();
		(read_u64(&meta, 0), read_u64(&meta, 8), read_u64(&meta, 16))
	}

	fn write_header(&self, live_count: u64, next_id: u64, last_chunk_id: u64) -> Result<()> {
		let mut meta = self.meta_mmap.write();
		write_u64(&mut meta, 0, live_count);
		write_u64(&mut meta, 8, next_id);
		write_u64(&mut meta, 16, last_chunk_id);
		meta.flush_range(0, META_HEADER_SIZE as usize).map_err(|_| Status::IOError)
	}

	fn entry_capacity(&self) -> u64 {
		(self.meta_mmap.read().len() as u64 - META_HEADER_SIZE) / ENTRY_SIZE
	}

	fn ensure_entry_capacity(&self, id: u64) -> Result<()> {
		let old_capacity = self.entry_capacity();
		if id < old_capacity {
			return Ok(());
		}
		let mut new_entries = old_capacity.max(INITIAL_META_ENTRIES);
		while id >= new_entries {
			new_entries *= 2;
		}
		let new_len = META_HEADER_SIZE + new_entries * ENTRY_SIZE;
		self.meta_file.set_len(new_len).map_err(|_| Status::IOError)?;
		let mut meta = self.meta_mmap.write();
		*meta = unsafe { MmapMut::map_mut(&self.meta_file).map_err(|_| Status::IOError)? };
		stamp_tombstones(&mut meta, old_capacity, new_entries);
		meta.flush_range(old_capacity as usize * ENTRY_SIZE as usize + META_HEADER_SIZE as usize, ((new_entries - old_capacity) * ENTRY_SIZE) as usize)
			.map_err(|_| Status::IOError)
	}

	fn read_entry(&self, id: u64) -> Entry {
		if id >= self.entry_capacity() {
			return Entry { chunk: TOMBSTONE, offset: TOMBSTONE, size: TOMBSTONE };
		}
		let meta = self.meta_mmap.read();
		let pos = (META_HEADER_SIZE + id * ENTRY_SIZE) as usize;
		Entry { chunk: read_u64(&meta, pos), offset: read_u64(&meta, pos + 8), size: read_u64(&meta, pos + 16) }
	}

	fn write_entry(&self, id: u64, entry: &Entry) -> Result<()> {
		self.ensure_entry_capacity(id)?;
		let mut meta = self.meta_mmap.write();
		let pos = (META_HEADER_SIZE + id * ENTRY_SIZE) as usize;
		write_u64(&mut meta, pos, entry.chunk);
		write_u64(&mut meta, pos + 8, entry.offset);
		write_u64(&mut meta, pos + 16, entry.size);
		meta.flush_range(pos, ENTRY_SIZE as usize).map_err(|_| Status::IOError)
	}

	fn open_chunk(&self, id: u64, create: bool) -> Result<()> {
		if self.chunks.read().contains_key(&id) {
			return Ok(());
		}
		let path = self.dir.join(format!("chunk-{}", id));
		let existed = path.exists();
		if !existed && !create {
			return Err(Status::Corruption);
		}
		let file = OpenOptions::new().read(true).write(true).create(true).open(&path).map_err(|_| Status::IOError)?;
		if !existed {
			file.set_len(self.chunk_size).map_err(|_| Status::IOError)?;
		}
		let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|_| Status::IOError)? };
		if !existed {
			write_u64(&mut mmap, 0, CHUNK_HEADER_SIZE);
			mmap.flush_range(0, CHUNK_HEADER_SIZE as usize).map_err(|_| Status::IOError)?;
		}
		self.chunks.write().insert(id, Chunk { file, mmap });
		Ok(())
	}

	/// Appends `payload` to the current (or a freshly opened) chunk,
	/// returning `(chunk_id, offset, size)`. Caller must hold `write_lock`.
	fn append_payload(&self, payload: &[u8]) -> Result<(u64, u64, u64)> {
		if payload.len() as u64 + CHUNK_HEADER_SIZE > self.chunk_size {
			return Err(Status::SizeError);
		}
		let (_, _, last_chunk_id) = self.header();
		let mut chunk_id = if last_chunk_id == NO_CHUNK { 0 } else { last_chunk_id };
		self.open_chunk(chunk_id, true)?;
		let remaining = {
			let chunks = self.chunks.read();
			let chunk = &chunks[&chunk_id];
			self.chunk_size - chunk.next_offset()
		};
		if (payload.len() as u64) > remaining {
			chunk_id += 1;
			self.open_chunk(chunk_id, true)?;
		}
		let mut chunks = self.chunks.write();
		let chunk = chunks.get_mut(&chunk_id).unwrap();
		let offset = chunk.next_offset();
		let pos = offset as usize;
		chunk.mmap[pos..pos + payload.len()].copy_from_slice(payload);
		chunk.mmap.flush_range(pos, payload.len()).map_err(|_| Status::IOError)?;
		let new_offset = offset + payload.len() as u64;
		chunk.set_next_offset(new_offset)?;
		Ok((chunk_id, offset, payload.len() as u64))
	}

	fn read_payload(&self, entry: &Entry) -> Result<Vec<u8>> {
		self.open_chunk(entry.chunk, false)?;
		let chunks = self.chunks.read();
		let chunk = &chunks[&entry.chunk];
		let start = entry.offset as usize;
		let end = start + entry.size as usize;
		Ok(chunk.mmap[start..end].to_vec())
	}

	fn with_payload<T>(&self, entry: &Entry, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
		self.open_chunk(entry.chunk, false)?;
		let chunks = self.chunks.read();
		let chunk = &chunks[&entry.chunk];
		let start = entry.offset as usize;
		let end = start + entry.size as usize;
		Ok(f(&chunk.mmap[start..end]))
	}

	fn flush_all(&self) -> Result<()> {
		self.meta_mmap.write().flush().map_err(|_| Status::IOError)?;
		for chunk in self.chunks.write().values_mut() {
			chunk.mmap.flush().map_err(|_| Status::IOError)?;
		}
		Ok(())
	}
}

fn valid_collection_name(name: &[u8]) -> bool {
	!name.is_empty() && !name.contains(&0) && !name.contains(&b'/')
}

const SUPPORTED_MODES: u32 = yokan_core::mode::UPDATE_NEW | yokan_core::mode::INCLUSIVE | yokan_core::mode::IGNORE_DOCS | yokan_core::mode::CONSUME;

pub struct LogEngine {
	base: PathBuf,
	chunk_size: u64,
	collections: RwLock<HashMap<Vec<u8>, std::sync::Arc<CollectionHandle>>>,
	migrated: AtomicBool,
	config: BackendConfig,
}

impl LogEngine {
	fn guard(&self) -> Result<()> {
		yokan_core::migration::guard_migrated(self.migrated.load(AtomicOrdering::Acquire))
	}

	fn coll_dir(&self, name: &[u8]) -> PathBuf {
		self.base.join(String::from_utf8_lossy(name).into_owned())
	}

	fn get_handle(&self, name: &[u8]) -> Result<std::sync::Arc<CollectionHandle>> {
		if let Some(handle) = self.collections.read().get(name) {
			return Ok(handle.clone());
		}
		let dir = self.coll_dir(name);
		if !dir.join("meta").exists() {
			return Err(Status::NotFound);
		}
		let handle = std::sync::Arc::new(CollectionHandle::open(&dir, self.chunk_size)?);
		self.collections.write().insert(name.to_vec(), handle.clone());
		Ok(handle)
	}
}

impl OpenBackend for LogEngine {
	fn create(config: &BackendConfig) -> Result<Self> {
		let path = config.path.clone().ok_or(Status::InvalidConf)?;
		let base = PathBuf::from(path);
		if config.create_if_missing {
			fs::create_dir_all(&base).map_err(|_| Status::IOError)?;
		} else if !base.exists() {
			return Err(Status::NotFound);
		}
		let chunk_size = config.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
		Ok(LogEngine { base, chunk_size, collections: RwLock::new(HashMap::new()), migrated: AtomicBool::new(false), config: config.clone() })
	}

	fn recover(config: &BackendConfig, _migration_config: &serde_json::Value, files: &FileList) -> Result<Self> {
		let base = files.root.clone();
		let chunk_size = config.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
		Ok(LogEngine { base, chunk_size, collections: RwLock::new(HashMap::new()), migrated: AtomicBool::new(false), config: config.clone() })
	}
}

impl Backend for LogEngine {
	fn engine_type(&self) -> &'static str {
		"log"
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
		fs::remove_dir_all(&self.base).map_err(|_| Status::IOError)
	}

	fn coll_create(&self, name: &[u8]) -> Result<()> {
		self.guard()?;
		if !valid_collection_name(name) {
			return Err(Status::InvalidArg);
		}
		let dir = self.coll_dir(name);
		if dir.join("meta").exists() {
			return Err(Status::KeyExists);
		}
		let handle = std::sync::Arc::new(CollectionHandle::create(&dir, self.chunk_size)?);
		self.collections.write().insert(name.to_vec(), handle);
		Ok(())
	}

	fn coll_drop(&self, name: &[u8]) -> Result<()> {
		self.guard()?;
		let dir = self.coll_dir(name);
		if !dir.join("meta").exists() {
			return Err(Status::NotFound);
		}
		self.collections.write().remove(name);
		fs::remove_dir_all(&dir).map_err(|_| Status::IOError)
	}

	fn coll_exists(&self, name: &[u8]) -> Result<bool> {
		self.guard()?;
		Ok(self.coll_dir(name).join("meta").exists())
	}

	fn coll_last_id(&self, name: &[u8]) -> Result<u64> {
		self.guard()?;
		let handle = self.get_handle(name)?;
		Ok(handle.header().1)
	}

	fn coll_size(&self, name: &[u8]) -> Result<u64> {
		self.guard()?;
		let handle = self.get_handle(name)?;
		Ok(handle.header().0)
	}

	fn doc_size(&self, coll: &[u8], ids: &[u64], sizes_out: &mut [u64]) -> Result<()> {
		self.guard()?;
		let handle = match self.get_handle(coll) {
			Ok(h) => h,
			Err(_) => {
				for s in sizes_out.iter_mut() {
					*s = KEY_NOT_FOUND;
				}
				return Ok(());
			}
		};
		for (i, &id) in ids.iter().enumerate() {
			let entry = handle.read_entry(id);
			sizes_out[i] = if entry.is_tombstone() { KEY_NOT_FOUND } else { entry.size };
		}
		Ok(())
	}

	fn doc_store(&self, coll: &[u8], docs: &PackedKeys, ids_out: &mut [u64]) -> Result<()> {
		self.guard()?;
		let handle = self.get_handle(coll)?;
		let _guard = handle.write_lock.lock();
		for (i, payload) in docs.iter().enumerate() {
			let (mut live_count, mut next_id, _) = handle.header();
			let (chunk_id, offset, size) = handle.append_payload(payload)?;
			let id = next_id;
			handle.write_entry(id, &Entry { chunk: chunk_id, offset, size })?;
			live_count += 1;
			next_id += 1;
			handle.write_header(live_count, next_id, chunk_id)?;
			ids_out[i] = id;
		}
		Ok(())
	}

	fn doc_update(&self, coll: &[u8], ids: &[u64], docs: &PackedKeys, mode: Mode) -> Result<()> {
		self.guard()?;
		let handle = self.get_handle(coll)?;
		let _guard = handle.write_lock.lock();
		let (mut live_count, mut next_id, _) = handle.header();
		let max_id = ids.iter().copied().max().unwrap_or(0);
		if max_id >= next_id && !mode.update_new() {
			return Err(Status::InvalidID);
		}
		// Growing the entry table (in `write_entry` below, via
		// `ensure_entry_capacity`) already stamps any id between the old
		// `next_id` and `max_id` as a tombstone, so ids absent from this
		// batch read back as missing without a separate gap-fill pass.
		for (&id, payload) in ids.iter().zip(docs.iter()) {
			let was_live = !handle.read_entry(id).is_tombstone() && id < next_id;
			let (chunk_id, offset, size) = handle.append_payload(payload)?;
			handle.write_entry(id, &Entry { chunk: chunk_id, offset, size })?;
			if !was_live {
				live_count += 1;
			}
		}
		if max_id >= next_id {
			next_id = max_id + 1;
		}
		let (_, _, last_chunk_id) = handle.header();
		handle.write_header(live_count, next_id, last_chunk_id)?;
		Ok(())
	}

	fn doc_load(&self, coll: &[u8], ids: &[u64], writer: &mut PackedWriter, _mode: Mode) -> Result<()> {
		self.guard()?;
		let handle = self.get_handle(coll)?;
		for &id in ids {
			let entry = handle.read_entry(id);
			if entry.is_tombstone() {
				writer.write_missing();
			} else {
				let payload = handle.read_payload(&entry)?;
				writer.write(&payload);
			}
		}
		Ok(())
	}

	fn doc_fetch(&self, coll: &[u8], ids: &[u64], mode: Mode, callback: &mut DocFetchCallback<'_>) -> Result<()> {
		self.guard()?;
		let handle = self.get_handle(coll)?;
		let mut to_erase = Vec::new();
		for &id in ids {
			let entry = handle.read_entry(id);
			let flow = if entry.is_tombstone() {
				callback(id, None)
			} else {
				handle.with_payload(&entry, |bytes| callback(id, Some(bytes)))?
			};
			if !entry.is_tombstone() && mode.consume() {
				to_erase.push(id);
			}
			if flow == ControlFlow::Stop {
				break;
			}
		}
		if !to_erase.is_empty() {
			self.doc_erase(coll, &to_erase)?;
		}
		Ok(())
	}

	fn doc_erase(&self, coll: &[u8], ids: &[u64]) -> Result<()> {
		self.guard()?;
		let handle = self.get_handle(coll)?;
		let _guard = handle.write_lock.lock();
		let (mut live_count, next_id, last_chunk_id) = handle.header();
		for &id in ids {
			let entry = handle.read_entry(id);
			if !entry.is_tombstone() {
				handle.write_entry(id, &Entry { chunk: TOMBSTONE, offset: TOMBSTONE, size: TOMBSTONE })?;
				live_count = live_count.saturating_sub(1);
			}
		}
		handle.write_header(live_count, next_id, last_chunk_id)
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
		let handle = self.get_handle(coll)?;
		let (_, next_id, _) = handle.header();
		let mut start = from_id;
		if !mode.inclusive() && start < next_id {
			start += 1;
		}
		let mut idx = 0usize;
		let mut id = start;
		while id < next_id && idx < ids_out.len() {
			let entry = handle.read_entry(id);
			if !entry.is_tombstone() {
				let include = handle.with_payload(&entry, |bytes| filter.check(id, bytes))?;
				if filter.should_stop(id) {
					break;
				}
				if include {
					ids_out[idx] = id;
					if !mode.ignore_docs() {
						let payload = handle.read_payload(&entry)?;
						writer.write(&filter.doc_copy(&payload));
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
		let handle = self.get_handle(coll)?;
		let (_, next_id, _) = handle.header();
		let mut start = from_id;
		if !mode.inclusive() && start < next_id {
			start += 1;
		}
		let mut emitted = 0usize;
		let mut id = start;
		while id < next_id && emitted < max {
			let entry = handle.read_entry(id);
			if !entry.is_tombstone() {
				let payload = handle.read_payload(&entry)?;
				if filter.should_stop(id) {
					break;
				}
				if filter.check(id, &payload) {
					emitted += 1;
					if callback(id, &payload) == ControlFlow::Stop {
						break;
					}
				}
			}
			id += 1;
		}
		Ok(())
	}

	fn start_migration(&self, root: &Path) -> Result<FileList> {
		self.guard()?;
		for handle in self.collections.read().values() {
			handle.flush_all()?;
		}
		let mut files = Vec::new();
		if let Ok(entries) = fs::read_dir(&self.base) {
			for entry in entries.flatten() {
				files.push(entry.path());
			}
		}
		Ok(FileList { root: root.to_path_buf(), files })
	}

	fn mark_migrated(&self) {
		self.collections.write().clear();
		self.migrated.store(true, AtomicOrdering::Release);
		warn!("log engine marked migrated; further calls will return Migrated");
	}

	fn cancel_migration(&self) {}
}

/// Registers this engine's constructor under the name `"log"` (spec §9).
pub fn init() {
	yokan_core::registry::register_backend_with_recovery(
		"log",
		|config| LogEngine::create(config).map(|db| Box::new(db) as Box<dyn Backend>),
		|config, migration_config, files| LogEngine::recover(config, migration_config, files).map(|db| Box::new(db) as Box<dyn Backend>),
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

	fn new_engine(chunk_size: u64) -> (tempfile::TempDir, LogEngine) {
		let dir = tempfile::tempdir().unwrap();
		let mut config = BackendConfig::default();
		config.path = Some(dir.path().to_str().unwrap().to_owned());
		config.create_if_missing = true;
		config.chunk_size = Some(chunk_size);
		let db = LogEngine::create(&config).unwrap();
		(dir, db)
	}

	#[test]
	fn store_and_load_roundtrip() {
		let (_dir, db) = new_engine(4096);
		db.coll_create(b"events").unwrap();
		let (dbuf, dsizes) = packed(&[b"hello", b"world"]);
		let docs = PackedKeys::new(&dbuf, &dsizes).unwrap();
		let mut ids = [0u64; 2];
		db.doc_store(b"events", &docs, &mut ids).unwrap();
		assert_eq!(ids, [0, 1]);

		let mut buf = [0u8; 16];
		let mut sizes = [0u64; 2];
		let mut writer = PackedWriter::new(&mut buf, &mut sizes);
		db.doc_load(b"events", &ids, &mut writer, Mode::NONE).unwrap();
		assert_eq!(sizes, [5, 5]);
	}

	#[test]
	fn erase_marks_tombstone() {
		let (_dir, db) = new_engine(4096);
		db.coll_create(b"events").unwrap();
		let (dbuf, dsizes) = packed(&[b"hello"]);
		let docs = PackedKeys::new(&dbuf, &dsizes).unwrap();
		let mut ids = [0u64; 1];
		db.doc_store(b"events", &docs, &mut ids).unwrap();
		db.doc_erase(b"events", &ids).unwrap();

		let mut sizes_out = [0u64; 1];
		db.doc_size(b"events", &ids, &mut sizes_out).unwrap();
		assert_eq!(sizes_out, [KEY_NOT_FOUND]);
		assert_eq!(db.coll_size(b"events").unwrap(), 0);
	}

	#[test]
	fn doc_size_of_never_allocated_id_is_not_found() {
		let (_dir, db) = new_engine(4096);
		db.coll_create(b"events").unwrap();
		let mut sizes_out = [0u64; 1];
		db.doc_size(b"events", &[5], &mut sizes_out).unwrap();
		assert_eq!(sizes_out, [KEY_NOT_FOUND]);
	}

	#[test]
	fn chunk_rollover_on_overflow() {
		let (_dir, db) = new_engine(CHUNK_HEADER_SIZE + 8);
		db.coll_create(b"events").unwrap();
		let (dbuf, dsizes) = packed(&[b"abcdefgh", b"ijklmnop", b"qrstuvwx"]);
		let docs = PackedKeys::new(&dbuf, &dsizes).unwrap();
		let mut ids = [0u64; 3];
		db.doc_store(b"events", &docs, &mut ids).unwrap();
		assert_eq!(ids, [0, 1, 2]);

		let mut ids_out = [0u64; 3];
		let mut buf = [0u8; 64];
		let mut sizes = [0u64; 3];
		let mut writer = PackedWriter::new(&mut buf, &mut sizes);
		db.doc_list(b"events", 0, &MatchAllFilter, Mode::new(yokan_core::mode::INCLUSIVE), &mut ids_out, &mut writer).unwrap();
		assert_eq!(ids_out, [0, 1, 2]);
	}

	#[test]
	fn shared_property_tests() {
		let (dir, db) = new_engine(4096);
		yokan_shared_tests::test_document_store_roundtrip(&db).unwrap();
		yokan_shared_tests::test_collection_drop_removes_documents(&db).unwrap();
		yokan_shared_tests::test_doc_migration_marks_engine_migrated(&db, dir.path()).unwrap();
		yokan_shared_tests::test_doc_load_unpacked_uses_fixed_stride(&db).unwrap();
	}
}
