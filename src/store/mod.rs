//! Session and message store access.
//!
//! The store is a document store: each collection holds JSON documents
//! addressed by an `id` field. Writers never read-modify-write in process;
//! every mutation is an `update_one` whose filter re-asserts the state the
//! caller expects, so concurrent workers in different processes can claim
//! and release soft locks safely.
//!
//! [`Repo`] is the only way the rest of the crate reaches the store. It
//! decodes typed records and narrows every query to the current runtime
//! through [`RuntimeScope`].

pub mod filter;
pub mod scope;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::domain::{Message, Session, SessionLogEvent};

pub use filter::{Filter, FindOptions, SortOrder, Update};
pub use scope::{RuntimeScope, PROD_FAMILY, RUNTIME_TAG_FIELD};
pub use sqlite::SqliteStore;

/// Errors that can occur talking to the store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Document in {0} has no string id")]
    MissingId(Collection),

    #[error("Store task failed: {0}")]
    Task(String),
}

/// Collections held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Sessions,
    Messages,
    SessionLog,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Sessions, Collection::Messages, Collection::SessionLog];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::Messages => "messages",
            Self::SessionLog => "session_log",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw document store operations.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document; its `id` field must be a unique string.
    async fn insert(&self, collection: Collection, doc: Value) -> Result<(), StoreError>;

    /// Documents matching `filter`, sorted and limited by `options`.
    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StoreError>;

    /// Atomically update the first document matching `filter`.
    ///
    /// Returns false when nothing matched.
    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<bool, StoreError>;

    /// Update every document matching `filter`; returns the count.
    async fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<usize, StoreError>;
}

// A single malformed record must not stall every pass
fn decode_into<T: DeserializeOwned>(collection: Collection, docs: Vec<Value>, out: &mut Vec<T>) {
    for doc in docs {
        let id = doc.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
        match serde_json::from_value(doc) {
            Ok(record) => out.push(record),
            Err(e) => warn!(collection = %collection, id = %id, error = %e, "skipping undecodable record"),
        }
    }
}

/// Typed, runtime-scoped access to sessions, messages and log events.
#[derive(Clone)]
pub struct Repo {
    store: Arc<dyn DocumentStore>,
    scope: RuntimeScope,
}

impl Repo {
    pub fn new(store: Arc<dyn DocumentStore>, scope: RuntimeScope) -> Self {
        Self { store, scope }
    }

    pub fn scope(&self) -> &RuntimeScope {
        &self.scope
    }

    fn scoped(&self, filter: Filter) -> Filter {
        self.scope.apply(filter)
    }

    fn by_id(&self, id: &str, guard: Filter) -> Filter {
        self.scoped(Filter::eq("id", id).and_also(guard))
    }

    async fn find_typed<T: DeserializeOwned>(
        &self,
        collection: Collection,
        filter: Filter,
        options: FindOptions,
    ) -> Result<Vec<T>, StoreError> {
        let docs = self
            .store
            .find(collection, &self.scoped(filter), &options)
            .await?;

        let mut out = Vec::with_capacity(docs.len());
        decode_into(collection, docs, &mut out);
        Ok(out)
    }

    /// Read every match, `page` documents per store query.
    async fn scan_typed<T: DeserializeOwned>(
        &self,
        collection: Collection,
        filter: Filter,
        options: FindOptions,
        page: usize,
    ) -> Result<Vec<T>, StoreError> {
        let filter = self.scoped(filter);
        let page = page.max(1);
        let mut out = Vec::new();
        let mut skip = 0;

        loop {
            let docs = self
                .store
                .find(collection, &filter, &options.clone().skip(skip).limit(page))
                .await?;
            let fetched = docs.len();
            decode_into(collection, docs, &mut out);
            if fetched < page {
                break;
            }
            skip += fetched;
        }
        Ok(out)
    }

    async fn insert_typed<T: Serialize>(&self, collection: Collection, record: &T) -> Result<(), StoreError> {
        let mut doc = serde_json::to_value(record)?;
        let tagged = doc
            .get(RUNTIME_TAG_FIELD)
            .and_then(Value::as_str)
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        if !tagged {
            Update::new()
                .set(RUNTIME_TAG_FIELD, self.scope.record_tag())
                .apply(&mut doc);
        }
        self.store.insert(collection, doc).await
    }

    // Sessions

    pub async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.insert_typed(Collection::Sessions, session).await
    }

    pub async fn find_sessions(&self, filter: Filter, options: FindOptions) -> Result<Vec<Session>, StoreError> {
        self.find_typed(Collection::Sessions, filter, options).await
    }

    /// Every matching session, read in pages of `page`.
    pub async fn scan_sessions(&self, filter: Filter, options: FindOptions, page: usize) -> Result<Vec<Session>, StoreError> {
        self.scan_typed(Collection::Sessions, filter, options, page).await
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let mut found = self
            .find_typed(Collection::Sessions, Filter::eq("id", id), FindOptions::default().limit(1))
            .await?;
        Ok(found.pop())
    }

    /// Conditionally update one session; `guard` re-asserts expected state.
    pub async fn update_session(&self, id: &str, guard: Filter, update: Update) -> Result<bool, StoreError> {
        self.store
            .update_one(Collection::Sessions, &self.by_id(id, guard), &update)
            .await
    }

    // Messages

    pub async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.insert_typed(Collection::Messages, message).await
    }

    pub async fn find_messages(&self, filter: Filter, options: FindOptions) -> Result<Vec<Message>, StoreError> {
        self.find_typed(Collection::Messages, filter, options).await
    }

    /// Every matching message, read in pages of `page`.
    pub async fn scan_messages(&self, filter: Filter, options: FindOptions, page: usize) -> Result<Vec<Message>, StoreError> {
        self.scan_typed(Collection::Messages, filter, options, page).await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let mut found = self
            .find_typed(Collection::Messages, Filter::eq("id", id), FindOptions::default().limit(1))
            .await?;
        Ok(found.pop())
    }

    /// Live (not deleted) messages of a session, oldest first.
    pub async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        self.find_messages(
            Filter::and([Filter::eq("session_id", session_id), Filter::not_true("is_deleted")]),
            FindOptions::default().sort_by("created_at", SortOrder::Asc),
        )
        .await
    }

    /// Conditionally update one message; `guard` re-asserts expected state.
    pub async fn update_message(&self, id: &str, guard: Filter, update: Update) -> Result<bool, StoreError> {
        self.store
            .update_one(Collection::Messages, &self.by_id(id, guard), &update)
            .await
    }

    // Session log

    pub async fn insert_log_event(&self, event: &SessionLogEvent) -> Result<(), StoreError> {
        self.insert_typed(Collection::SessionLog, event).await
    }

    pub async fn find_log_events(
        &self,
        filter: Filter,
        options: FindOptions,
    ) -> Result<Vec<SessionLogEvent>, StoreError> {
        self.find_typed(Collection::SessionLog, filter, options).await
    }

    // Untyped access for maintenance over all collections

    /// Raw documents of any collection, scoped to this runtime.
    pub async fn find_raw(
        &self,
        collection: Collection,
        filter: Filter,
        options: FindOptions,
    ) -> Result<Vec<Value>, StoreError> {
        self.store
            .find(collection, &self.scoped(filter), &options)
            .await
    }

    /// Conditionally update one raw document by id, scoped to this runtime.
    pub async fn update_raw(
        &self,
        collection: Collection,
        id: &str,
        guard: Filter,
        update: Update,
    ) -> Result<bool, StoreError> {
        self.store
            .update_one(collection, &self.by_id(id, guard), &update)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn repo(tag: &str, store: Arc<SqliteStore>) -> Repo {
        Repo::new(store, RuntimeScope::new(tag))
    }

    #[tokio::test]
    async fn test_insert_stamps_runtime_tag() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let dev = repo("dev-alice", store.clone());

        dev.insert_session(&Session::new("s1", Utc::now())).await.unwrap();

        let loaded = dev.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.runtime_tag.as_deref(), Some("dev-alice"));
    }

    #[tokio::test]
    async fn test_runtimes_do_not_see_each_other() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let prod = repo("prod", store.clone());
        let dev = repo("dev-alice", store.clone());

        prod.insert_session(&Session::new("p1", Utc::now())).await.unwrap();
        dev.insert_session(&Session::new("d1", Utc::now())).await.unwrap();

        assert!(prod.get_session("d1").await.unwrap().is_none());
        assert!(dev.get_session("p1").await.unwrap().is_none());
        assert!(prod.get_session("p1").await.unwrap().is_some());

        // Updates are scoped too
        let touched = dev
            .update_session("p1", Filter::All, Update::new().set("is_active", false))
            .await
            .unwrap();
        assert!(!touched);
    }

    #[tokio::test]
    async fn test_scan_reads_past_one_page() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let prod = repo("prod", store.clone());
        let now = Utc::now();

        for i in 0..7 {
            prod.insert_session(&Session::new(format!("s{i}"), now + chrono::Duration::seconds(i)))
                .await
                .unwrap();
        }

        let all = prod
            .scan_sessions(Filter::All, FindOptions::default().sort_by("created_at", SortOrder::Asc), 3)
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4", "s5", "s6"]);
    }

    #[tokio::test]
    async fn test_legacy_rows_belong_to_prod() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert(
                Collection::Sessions,
                serde_json::json!({
                    "id": "legacy",
                    "is_active": true,
                    "created_at": "2024-01-01T00:00:00Z",
                    "updated_at": "2024-01-01T00:00:00Z",
                }),
            )
            .await
            .unwrap();

        assert!(repo("prod-host1", store.clone()).get_session("legacy").await.unwrap().is_some());
        assert!(repo("dev-alice", store).get_session("legacy").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_update_acts_as_claim() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let prod = repo("prod", store);
        prod.insert_message(&Message::new("m1", "1", "s1", Utc::now())).await.unwrap();

        let claim = |repo: Repo| async move {
            repo.update_message(
                "m1",
                Filter::not_true("processors_data.categorization.is_processing"),
                Update::new().set("processors_data.categorization.is_processing", true),
            )
            .await
            .unwrap()
        };

        assert!(claim(prod.clone()).await);
        assert!(!claim(prod.clone()).await);
    }
}
