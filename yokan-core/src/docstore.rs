//! The document-store mixin (spec §2 item 4, §3 "Key layout used by the
//! mixin", §4.4, §9 "Document-store mixin").
//!
//! Inheritance-based reuse in the C++ original (`doc-mixin.hpp` is mixed
//! into a backend via CRTP) becomes composition here: `DocumentStore<E>`
//! wraps any `E: Backend` that implements the key/value operations and
//! supplies the collection/document operations by encoding
//! `(collection-name, id)` into keys and keeping per-collection metadata
//! (last-allocated id, live count) in a reserved key named after the
//! collection. Engines with a native document representation (the log and
//! array engines) do not use this wrapper; they implement the document
//! operations themselves.

use crate::backend::{Backend, ControlFlow, DocFetchCallback, DocIterCallback, FetchCallback, FileList, IterCallback};
use crate::filter::{DocFilter, DocFilterAdapter, KeyValueFilter, PrefixFilter};
use crate::mode::Mode;
use crate::slice::{BitFieldMut, PackedKeys, PackedWriter};
use crate::status::{Result, Status, KEY_NOT_FOUND, NO_MORE_DOCS};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::path::Path;

/// Encodes a mixin document key for `(collection, id)`: the collection
/// bytes, a NUL byte, then the id big-endian so byte-lexicographic order
/// agrees with numeric order (spec §3, §9 "Endian-dependent id encoding").
pub fn doc_key(collection: &[u8], id: u64) -> Vec<u8> {
	let mut key = Vec::with_capacity(collection.len() + 1 + 8);
	key.extend_from_slice(collection);
	key.push(0);
	key.extend_from_slice(&id.to_be_bytes());
	key
}

/// The collection's metadata key: the collection name with no trailing NUL.
pub fn meta_key(collection: &[u8]) -> Vec<u8> {
	collection.to_vec()
}

#[derive(Debug, Clone, Copy, Default)]
struct CollectionMeta {
	last_id: u64,
	size: u64,
}

impl CollectionMeta {
	fn encode(&self) -> [u8; 16] {
		let mut buf = [0u8; 16];
		(&mut buf[0..8]).write_u64::<LittleEndian>(self.last_id).unwrap();
		(&mut buf[8..16]).write_u64::<LittleEndian>(self.size).unwrap();
		buf
	}

	fn decode(bytes: &[u8]) -> Result<Self> {
		if bytes.len() != 16 {
			return Err(Status::Corruption);
		}
		let mut last_id = &bytes[0..8];
		let mut size = &bytes[8..16];
		Ok(CollectionMeta {
			last_id: last_id.read_u64::<LittleEndian>().map_err(|_| Status::Corruption)?,
			size: size.read_u64::<LittleEndian>().map_err(|_| Status::Corruption)?,
		})
	}
}

/// Wraps a key/value-capable backend `E` and supplies the document-store
/// operation set on top of it.
pub struct DocumentStore<E: Backend> {
	inner: E,
	/// Serializes metadata read-modify-write cycles; the underlying
	/// engine's own lock only protects a single `put`/`get`, not the
	/// multi-step "read last_id, allocate ids, write metadata" sequence,
	/// so the mixin needs its own (spec §5, design note "Document-store
	/// mixin"). Can be bypassed when the caller knows `E` already
	/// serializes this sequence on its own.
	metadata_lock: Option<Mutex<()>>,
}

fn single(key: &[u8]) -> (Vec<u8>, Vec<u64>) {
	(key.to_vec(), vec![key.len() as u64])
}

impl<E: Backend> DocumentStore<E> {
	pub fn new(inner: E) -> Self {
		DocumentStore { inner, metadata_lock: Some(Mutex::new(())) }
	}

	/// Skips the mixin's own lock; only safe when `inner` already
	/// serializes metadata read-modify-write sequences equivalently.
	pub fn without_metadata_lock(inner: E) -> Self {
		DocumentStore { inner, metadata_lock: None }
	}

    pub fn inner(&self) -> &E {
        &self.inner
    }

	fn lock(&self) -> Option<parking_lot::MutexGuard<'_, ()>> {
		self.metadata_lock.as_ref().map(|m| m.lock())
	}

	fn read_meta(&self, collection: &[u8]) -> Result<Option<CollectionMeta>> {
		let (kbuf, ksizes) = single(&meta_key(collection));
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		let mut buf = vec![0u8; 16];
		let mut sizes = [0u64; 1];
		let mut writer = PackedWriter::new(&mut buf, &mut sizes);
		self.inner.get(&keys, &mut writer, Mode::NONE)?;
		if sizes[0] == KEY_NOT_FOUND {
			Ok(None)
		} else {
			Ok(Some(CollectionMeta::decode(&buf[..sizes[0] as usize])?))
		}
	}

	fn write_meta(&self, collection: &[u8], meta: CollectionMeta) -> Result<()> {
		let (kbuf, ksizes) = single(&meta_key(collection));
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		let encoded = meta.encode();
		let vbuf = encoded.to_vec();
		let vsizes = vec![vbuf.len() as u64];
		let vals = PackedKeys::new(&vbuf, &vsizes)?;
		self.inner.put(&keys, &vals, Mode::NONE)
	}

	fn require_meta(&self, collection: &[u8]) -> Result<CollectionMeta> {
		self.read_meta(collection)?.ok_or(Status::NotFound)
	}
}

impl<E: Backend> Backend for DocumentStore<E> {
	fn engine_type(&self) -> &'static str {
		self.inner.engine_type()
	}

	fn config(&self) -> serde_json::Value {
		self.inner.config()
	}

	fn supported_modes(&self) -> u32 {
		self.inner.supported_modes()
	}

	fn is_sorted(&self) -> bool {
		self.inner.is_sorted()
	}

	fn destroy(&self) -> Result<()> {
		self.inner.destroy()
	}

	// key/value operations pass straight through to the wrapped engine.

	fn count(&self) -> Result<u64> {
		self.inner.count()
	}
	fn exists(&self, keys: &PackedKeys, out: &mut BitFieldMut, mode: Mode) -> Result<()> {
		self.inner.exists(keys, out, mode)
	}
	fn length(&self, keys: &PackedKeys, sizes_out: &mut [u64], mode: Mode) -> Result<()> {
		self.inner.length(keys, sizes_out, mode)
	}
	fn put(&self, keys: &PackedKeys, vals: &PackedKeys, mode: Mode) -> Result<()> {
		self.inner.put(keys, vals, mode)
	}
	fn get(&self, keys: &PackedKeys, writer: &mut PackedWriter, mode: Mode) -> Result<()> {
		self.inner.get(keys, writer, mode)
	}
	fn fetch(&self, keys: &PackedKeys, mode: Mode, callback: &mut FetchCallback<'_>) -> Result<()> {
		self.inner.fetch(keys, mode, callback)
	}
	fn erase(&self, keys: &PackedKeys, mode: Mode) -> Result<()> {
		self.inner.erase(keys, mode)
	}
	fn list_keys(
		&self,
		from_key: &[u8],
		filter: &dyn KeyValueFilter,
		mode: Mode,
		writer: &mut PackedWriter,
	) -> Result<()> {
		self.inner.list_keys(from_key, filter, mode, writer)
	}
	fn list_key_values(
		&self,
		from_key: &[u8],
		filter: &dyn KeyValueFilter,
		mode: Mode,
		keys_out: &mut PackedWriter,
		vals_out: &mut PackedWriter,
	) -> Result<()> {
		self.inner.list_key_values(from_key, filter, mode, keys_out, vals_out)
	}
	fn iter(
		&self,
		max: usize,
		from_key: &[u8],
		filter: &dyn KeyValueFilter,
		mode: Mode,
		callback: &mut IterCallback<'_>,
	) -> Result<()> {
		self.inner.iter(max, from_key, filter, mode, callback)
	}

	fn start_migration(&self, root: &Path) -> Result<FileList> {
		self.inner.start_migration(root)
	}
	fn mark_migrated(&self) {
		self.inner.mark_migrated()
	}
	fn cancel_migration(&self) {
		self.inner.cancel_migration()
	}

	// document operations, implemented via the key/value primitives above.

	fn coll_create(&self, name: &[u8]) -> Result<()> {
		if name.is_empty() || name.contains(&0) {
			return Err(Status::InvalidArg);
		}
		let _guard = self.lock();
		if self.read_meta(name)?.is_some() {
			return Err(Status::KeyExists);
		}
		self.write_meta(name, CollectionMeta::default())
	}

	fn coll_drop(&self, name: &[u8]) -> Result<()> {
		let _guard = self.lock();
		if self.read_meta(name)?.is_none() {
			return Err(Status::NotFound);
		}
		let mut prefix = name.to_vec();
		prefix.push(0);
		let mut to_erase = Vec::new();
		let filter = PrefixFilter::new(prefix.clone(), false);
		self.inner.iter(usize::MAX, &prefix, &filter, Mode::NONE, &mut |key, _val| {
			to_erase.push(key.to_vec());
			ControlFlow::Continue
		})?;
		for key in &to_erase {
			let (kbuf, ksizes) = single(key);
			let keys = PackedKeys::new(&kbuf, &ksizes)?;
			self.inner.erase(&keys, Mode::NONE)?;
		}
		let (kbuf, ksizes) = single(&meta_key(name));
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		self.inner.erase(&keys, Mode::NONE)
	}

	fn coll_exists(&self, name: &[u8]) -> Result<bool> {
		Ok(self.read_meta(name)?.is_some())
	}

	fn coll_last_id(&self, name: &[u8]) -> Result<u64> {
		Ok(self.require_meta(name)?.last_id)
	}

	fn coll_size(&self, name: &[u8]) -> Result<u64> {
		Ok(self.require_meta(name)?.size)
	}

	fn doc_size(&self, coll: &[u8], ids: &[u64], sizes_out: &mut [u64]) -> Result<()> {
		if self.read_meta(coll)?.is_none() {
			for s in sizes_out.iter_mut() {
				*s = KEY_NOT_FOUND;
			}
			return Ok(());
		}
		let mut kbuf = Vec::new();
		let mut ksizes = Vec::with_capacity(ids.len());
		for &id in ids {
			let k = doc_key(coll, id);
			ksizes.push(k.len() as u64);
			kbuf.extend_from_slice(&k);
		}
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		self.inner.length(&keys, sizes_out, Mode::NONE)
	}

	fn doc_store(&self, coll: &[u8], docs: &PackedKeys, ids_out: &mut [u64]) -> Result<()> {
		let _guard = self.lock();
		let mut meta = self.require_meta(coll)?;
		let mut kbuf = Vec::new();
		let mut ksizes = Vec::with_capacity(ids_out.len());
		for (i, id_out) in ids_out.iter_mut().enumerate() {
			let id = meta.last_id + i as u64;
			*id_out = id;
			let k = doc_key(coll, id);
			ksizes.push(k.len() as u64);
			kbuf.extend_from_slice(&k);
		}
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		self.inner.put(&keys, docs, Mode::NONE)?;
		meta.last_id += ids_out.len() as u64;
		meta.size += ids_out.len() as u64;
		self.write_meta(coll, meta)
	}

	fn doc_update(&self, coll: &[u8], ids: &[u64], docs: &PackedKeys, mode: Mode) -> Result<()> {
		let _guard = self.lock();
		let mut meta = self.require_meta(coll)?;
		let max_id = ids.iter().copied().max().unwrap_or(0);
		if max_id >= meta.last_id && !mode.update_new() {
			return Err(Status::InvalidID);
		}
		let mut kbuf = Vec::new();
		let mut ksizes = Vec::with_capacity(ids.len());
		for &id in ids {
			let k = doc_key(coll, id);
			ksizes.push(k.len() as u64);
			kbuf.extend_from_slice(&k);
		}
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		self.inner.put(&keys, docs, Mode::NONE)?;
		if max_id >= meta.last_id {
			// ids in [last_id, max_id] that weren't written are tombstoned
			// implicitly: their key is simply absent from the store, which
			// already reports KEY_NOT_FOUND on lookup.
			meta.size += ids.iter().filter(|&&id| id >= meta.last_id).count() as u64;
			meta.last_id = max_id + 1;
			self.write_meta(coll, meta)?;
		}
		Ok(())
	}

	fn doc_load(&self, coll: &[u8], ids: &[u64], writer: &mut PackedWriter, mode: Mode) -> Result<()> {
		let mut kbuf = Vec::new();
		let mut ksizes = Vec::with_capacity(ids.len());
		for &id in ids {
			let k = doc_key(coll, id);
			ksizes.push(k.len() as u64);
			kbuf.extend_from_slice(&k);
		}
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		self.inner.get(&keys, writer, mode)
	}

	fn doc_fetch(&self, coll: &[u8], ids: &[u64], mode: Mode, callback: &mut DocFetchCallback<'_>) -> Result<()> {
		for &id in ids {
			let k = doc_key(coll, id);
			let (kbuf, ksizes) = single(&k);
			let keys = PackedKeys::new(&kbuf, &ksizes)?;
			let mut stop = false;
			self.inner.fetch(&keys, mode, &mut |_key, val| match callback(id, val) {
				ControlFlow::Continue => ControlFlow::Continue,
				ControlFlow::Stop => {
					stop = true;
					ControlFlow::Stop
				}
			})?;
			if mode.consume() {
				self.inner.erase(&keys, Mode::NONE)?;
			}
			if stop {
				return Err(Status::StopIteration);
			}
		}
		Ok(())
	}

	fn doc_erase(&self, coll: &[u8], ids: &[u64]) -> Result<()> {
		let _guard = self.lock();
		let mut kbuf = Vec::new();
		let mut ksizes = Vec::with_capacity(ids.len());
		for &id in ids {
			let k = doc_key(coll, id);
			ksizes.push(k.len() as u64);
			kbuf.extend_from_slice(&k);
		}
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		self.inner.erase(&keys, Mode::NONE)?;
		if let Some(mut meta) = self.read_meta(coll)? {
			meta.size = meta.size.saturating_sub(ids.len() as u64);
			self.write_meta(coll, meta)?;
		}
		Ok(())
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
		let mut prefix = coll.to_vec();
		prefix.push(0);
		let from_key = doc_key(coll, from_id);
		let adapter = DocFilterAdapter::new(coll, filter);
		let mut idx = 0usize;
		self.inner.iter(ids_out.len(), &from_key, &adapter, mode, &mut |key, val| {
			if idx >= ids_out.len() {
				return ControlFlow::Stop;
			}
			if let Some(id) = adapter.split_key(key) {
				ids_out[idx] = id;
				if !mode.ignore_docs() {
					writer.write(val);
				}
				idx += 1;
			}
			if idx >= ids_out.len() {
				ControlFlow::Stop
			} else {
				ControlFlow::Continue
			}
		})?;
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
		let from_key = doc_key(coll, from_id);
		let adapter = DocFilterAdapter::new(coll, filter);
		self.inner.iter(max, &from_key, &adapter, mode, &mut |key, val| match adapter.split_key(key) {
			Some(id) => callback(id, val),
			None => ControlFlow::Continue,
		})
	}
}
