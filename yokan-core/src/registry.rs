//! Backend and filter registration (spec §9 "Backend and filter
//! registration").
//!
//! The C++ original registers backends through static-initializer side
//! effects (`__YOKANBackendRegistration<T>`); that doesn't translate
//! idiomatically. Instead each engine module exposes an `init()` function
//! that inserts its constructor into a process-wide table, and the
//! consumer (the RPC/provider layer, out of scope here) calls every
//! engine's `init()` during provider setup before looking databases up by
//! name.

use crate::backend::{Backend, BackendConfig, FileList};
use crate::status::{Result, Status};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

type Constructor = Arc<dyn Fn(&BackendConfig) -> Result<Box<dyn Backend>> + Send + Sync>;
type Recoverer =
	Arc<dyn Fn(&BackendConfig, &serde_json::Value, &FileList) -> Result<Box<dyn Backend>> + Send + Sync>;

struct Registration {
	create: Constructor,
	recover: Option<Recoverer>,
}

fn registry() -> &'static RwLock<HashMap<String, Registration>> {
	static REGISTRY: OnceLock<RwLock<HashMap<String, Registration>>> = OnceLock::new();
	REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers a backend under `name`. Safe to call more than once with the
/// same name (last registration wins), so an engine's `init()` can be
/// invoked idempotently during provider setup.
pub fn register_backend<F>(name: &str, create: F)
where
	F: Fn(&BackendConfig) -> Result<Box<dyn Backend>> + Send + Sync + 'static,
{
	registry().write().unwrap().insert(name.to_owned(), Registration { create: Arc::new(create), recover: None });
}

/// Registers a backend with both a `create` and a `recover` constructor.
pub fn register_backend_with_recovery<F, R>(name: &str, create: F, recover: R)
where
	F: Fn(&BackendConfig) -> Result<Box<dyn Backend>> + Send + Sync + 'static,
	R: Fn(&BackendConfig, &serde_json::Value, &FileList) -> Result<Box<dyn Backend>> + Send + Sync + 'static,
{
	registry()
		.write()
		.unwrap()
		.insert(name.to_owned(), Registration { create: Arc::new(create), recover: Some(Arc::new(recover)) });
}

/// Looks a backend up by name and constructs it.
pub fn create_backend(name: &str, config: &BackendConfig) -> Result<Box<dyn Backend>> {
	let guard = registry().read().unwrap();
	let reg = guard.get(name).ok_or(Status::InvalidType)?;
	(reg.create)(config)
}

/// Looks a backend up by name and recovers it from a migration file list.
pub fn recover_backend(
	name: &str,
	config: &BackendConfig,
	migration_config: &serde_json::Value,
	files: &FileList,
) -> Result<Box<dyn Backend>> {
	let guard = registry().read().unwrap();
	let reg = guard.get(name).ok_or(Status::InvalidType)?;
	match &reg.recover {
		Some(recover) => recover(config, migration_config, files),
		None => Err(Status::NotSupported),
	}
}

/// Whether a backend name is currently registered.
pub fn is_registered(name: &str) -> bool {
	registry().read().unwrap().contains_key(name)
}
