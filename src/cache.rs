//! Caching of discovered target groups with a time to live
use std::{
	io,
	path::{Path, PathBuf},
	time::Duration,
};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
	entry::DirectoryObject,
	error::{Error, ErrorKind},
};

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
	/// A valid entry was present
	Found(Vec<DirectoryObject>),
	/// Nothing was ever stored under the key
	NotFound,
	/// An entry was present but its time to live has passed
	Expired,
}

/// Key-value store from target group name to the objects last discovered for
/// it. `get` must be safe to call concurrently, including for the same key.
#[async_trait]
pub trait Cache: Send + Sync {
	/// Look up the objects cached under `key`. Errors are reserved for a
	/// malfunctioning store, a missing or expired entry is not an error.
	async fn get(&self, key: &str) -> Result<CacheLookup, Error>;

	/// Store `objects` under `key`, valid for `ttl`
	async fn put(&self, key: &str, objects: &[DirectoryObject], ttl: Duration) -> Result<(), Error>;
}

/// On-disk representation of one cache entry
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct CacheRecord {
	/// The moment after which the entry is no longer served
	expires_at: OffsetDateTime,
	/// The cached objects
	objects: Vec<DirectoryObject>,
}

/// A [`Cache`] keeping one JSON file per key in a directory
#[derive(Debug, Clone)]
pub struct FileCache {
	/// Directory holding the cache files
	dir: PathBuf,
}

impl FileCache {
	/// Open a file cache in `dir`, creating the directory if needed
	pub async fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
		let dir = dir.as_ref().to_path_buf();
		tokio::fs::create_dir_all(&dir).await.map_err(|err| {
			Error::new(ErrorKind::Cache, "could not create cache directory")
				.with_context("path", dir.display().to_string())
				.with_source(err)
		})?;
		Ok(Self { dir })
	}

	/// Path of the file for `key`. Keys are form-encoded so that arbitrary
	/// group names map to a single file inside the cache directory.
	fn path(&self, key: &str) -> PathBuf {
		let name: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
		self.dir.join(format!("{name}.json"))
	}
}

#[async_trait]
impl Cache for FileCache {
	async fn get(&self, key: &str) -> Result<CacheLookup, Error> {
		let path = self.path(key);
		let fetch_error = |message: &str| {
			Error::new(ErrorKind::CacheFetch, message)
				.with_context("cache_key", key)
				.with_context("path", path.display().to_string())
		};

		let bytes = match tokio::fs::read(&path).await {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(CacheLookup::NotFound),
			Err(err) => return Err(fetch_error("could not read cache file").with_source(err)),
		};
		let record: CacheRecord = serde_json::from_slice(&bytes)
			.map_err(|err| fetch_error("could not decode cache file").with_source(err))?;

		if OffsetDateTime::now_utc() >= record.expires_at {
			return Ok(CacheLookup::Expired);
		}
		Ok(CacheLookup::Found(record.objects))
	}

	async fn put(&self, key: &str, objects: &[DirectoryObject], ttl: Duration) -> Result<(), Error> {
		let path = self.path(key);
		let update_error = |message: &str| {
			Error::new(ErrorKind::CacheUpdate, message)
				.with_context("cache_key", key)
				.with_context("path", path.display().to_string())
		};

		let expires_at = time::Duration::try_from(ttl)
			.ok()
			.and_then(|ttl| OffsetDateTime::now_utc().checked_add(ttl))
			.ok_or_else(|| {
				update_error("cache TTL is out of range")
					.with_context("ttl_secs", ttl.as_secs().to_string())
			})?;
		let record = CacheRecord { expires_at, objects: objects.to_vec() };
		let bytes = serde_json::to_vec(&record)
			.map_err(|err| update_error("could not encode cache entry").with_source(err))?;

		let staging = path.with_extension("json.tmp");
		tokio::fs::write(&staging, bytes)
			.await
			.map_err(|err| update_error("could not write cache file").with_source(err))?;
		tokio::fs::rename(&staging, &path)
			.await
			.map_err(|err| update_error("could not replace cache file").with_source(err))?;
		Ok(())
	}
}
