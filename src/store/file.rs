//! File-backed [`TokenStore`] that survives process restarts.

// std
use std::{
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
};
// self
use crate::{
	_prelude::*,
	auth::TokenRecord,
	store::{RecordTable, StoreError, StoreFuture, StoreKey, StoredRecord, TokenStore},
};

/// Persists token records to a JSON snapshot after each mutation.
#[derive(Clone, Debug)]
pub struct FileStore {
	path: PathBuf,
	ttl: Duration,
	inner: Arc<RwLock<RecordTable>>,
}
impl FileStore {
	/// Opens (or creates) a store at the provided path, eagerly loading existing data.
	pub fn open(path: impl Into<PathBuf>, ttl: Duration) -> Result<Self, StoreError> {
		let path = path.into();

		ensure_parent_exists(&path)?;

		let snapshot = load_snapshot(&path)?;

		Ok(Self { path, ttl, inner: Arc::new(RwLock::new(snapshot)) })
	}

	/// Snapshot location.
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Removes records that expired at `now` and rewrites the snapshot when anything changed.
	pub fn sweep_expired(&self, now: OffsetDateTime) -> Result<usize, StoreError> {
		let mut guard = self.inner.write();
		let removed = guard.sweep(now);

		if removed > 0 {
			self.persist_locked(&guard)?;
		}

		Ok(removed)
	}

	fn persist_locked(&self, table: &RecordTable) -> Result<(), StoreError> {
		ensure_parent_exists(&self.path)?;

		let serialized =
			serde_json::to_vec_pretty(&table.entries()).map_err(|e| StoreError::Serialization {
				message: format!("Failed to serialize store snapshot: {e}"),
			})?;
		let mut tmp_path = self.path.clone();

		tmp_path.set_extension("tmp");

		{
			let mut file = File::create(&tmp_path).map_err(|e| StoreError::Backend {
				message: format!("Failed to create {}: {e}", tmp_path.display()),
			})?;

			file.write_all(&serialized).map_err(|e| StoreError::Backend {
				message: format!("Failed to write {}: {e}", tmp_path.display()),
			})?;
			file.sync_all().map_err(|e| StoreError::Backend {
				message: format!("Failed to sync {}: {e}", tmp_path.display()),
			})?;
		}

		fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::Backend {
			message: format!("Failed to replace {}: {e}", self.path.display()),
		})
	}
}
impl TokenStore for FileStore {
	fn get<'a>(
		&'a self,
		client_id: &'a str,
		token_endpoint: &'a str,
	) -> StoreFuture<'a, Option<TokenRecord>> {
		Box::pin(async move {
			let key = StoreKey::new(client_id, token_endpoint);

			Ok(self.inner.read().get(&key, OffsetDateTime::now_utc()))
		})
	}

	fn insert(&self, token: TokenRecord) -> StoreFuture<'_, StoredRecord> {
		Box::pin(async move {
			let mut guard = self.inner.write();
			let key = StoreKey::of(&token);
			let previous = guard.raw(&key).cloned();
			let stored = guard.insert(token, self.ttl, OffsetDateTime::now_utc())?;

			if let Err(e) = self.persist_locked(&guard) {
				guard.restore(key, previous);

				return Err(e);
			}

			Ok(stored)
		})
	}
}

fn load_snapshot(path: &Path) -> Result<RecordTable, StoreError> {
	if !path.exists() {
		return Ok(RecordTable::default());
	}

	let bytes = fs::read(path).map_err(|e| StoreError::Backend {
		message: format!("Failed to read {}: {e}", path.display()),
	})?;

	if bytes.is_empty() {
		return Ok(RecordTable::default());
	}

	let entries: Vec<(StoreKey, StoredRecord)> =
		serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
			message: format!("Failed to parse {}: {e}", path.display()),
		})?;

	Ok(RecordTable::from_entries(entries))
}

fn ensure_parent_exists(path: &Path) -> Result<(), StoreError> {
	if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
		fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
			message: format!("Failed to create store directory {}: {e}", parent.display()),
		})?;
	}

	Ok(())
}
