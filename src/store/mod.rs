//! Small interfaces behind the document store
//!
//! The core never talks to the backing database directly; it consumes a
//! user-document store (with its `auth/*` lookup views) and a server handle
//! covering provisioning, security documents, and the DB's own credential
//! database.

use async_trait::async_trait;

use crate::error::Error;
use crate::models::{
	ApiKey,
	DesignDoc,
	KeyRecord,
	SecurityDoc,
	UserDoc,
};

mod memory;

pub use memory::{MemoryServer, MemoryUserStore};

/// The store holding user documents and their lookup views
#[async_trait]
pub trait UserStore: Send + Sync {
	/// Fetch a user document by `_id`
	async fn get(&self, id: &str) -> Result<Option<UserDoc>, Error>;

	/// Persist a document under optimistic concurrency
	///
	/// Assigns a fresh `_rev` on success; fails with
	/// [`Error::RevisionConflict`] when the document's `_rev` is stale.
	async fn put(&self, doc: &mut UserDoc) -> Result<(), Error>;

	/// Delete a document at a known revision
	async fn remove(&self, id: &str, rev: &str) -> Result<(), Error>;

	/// Query an `auth/<view>` lookup view by key
	async fn query_view(
		&self,
		view: &str,
		key: &str,
	) -> Result<Vec<UserDoc>, Error>;

	/// List document ids in the lexicographic range `[start, end)`
	async fn id_range(
		&self,
		start: &str,
		end: &str,
	) -> Result<Vec<String>, Error>;

	/// Create or update the auth design document
	async fn ensure_design_doc(&self, doc: &DesignDoc) -> Result<(), Error>;
}

/// The server handle used for provisioning and credential management
#[async_trait]
pub trait DocumentServer: Send + Sync {
	/// Create a database; returns whether it was newly created
	async fn create_db(&self, name: &str) -> Result<bool, Error>;

	/// Destroy a database and everything in it
	async fn destroy_db(&self, name: &str) -> Result<(), Error>;

	async fn db_exists(&self, name: &str) -> Result<bool, Error>;

	async fn get_security(&self, db: &str) -> Result<SecurityDoc, Error>;

	async fn put_security(
		&self,
		db: &str,
		doc: &SecurityDoc,
	) -> Result<(), Error>;

	async fn put_design_doc(
		&self,
		db: &str,
		doc: &DesignDoc,
	) -> Result<(), Error>;

	/// Write a per-session credential to the DB auth store
	async fn store_key_record(&self, record: &KeyRecord) -> Result<(), Error>;

	/// Delete credentials from the DB auth store
	async fn remove_key_records(&self, keys: &[String]) -> Result<(), Error>;

	/// Credential keys whose `expires` lies before `now` (ms)
	async fn expired_key_records(&self, now: i64)
	-> Result<Vec<String>, Error>;

	/// Ask the backing service to mint an API key
	///
	/// Returns `None` when the backend has no key generator, in which case
	/// the core mints session keys locally.
	async fn generate_api_key(&self) -> Result<Option<ApiKey>, Error>;
}
