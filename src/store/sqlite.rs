//! SQLite-backed document store.
//!
//! One table per collection, each row holding a JSON document. Filters are
//! evaluated in process; every write runs inside a transaction on a single
//! connection, which makes `update_one` an atomic compare-and-set.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::filter::{Filter, FindOptions, Update};
use super::{Collection, DocumentStore, StoreError};

/// Document store persisted in a SQLite database file
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Task(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory store (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        for collection in Collection::ALL {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, doc TEXT NOT NULL)",
                    collection.as_str()
                ),
                [],
            )?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("connection mutex poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Candidate rows for a filter: a direct id lookup when the filter pins the
/// id, otherwise the whole table in insertion order.
fn load_candidates(
    conn: &Connection,
    collection: Collection,
    filter: &Filter,
) -> Result<Vec<(String, Value)>, StoreError> {
    let table = collection.as_str();

    if let Some(id) = pinned_id(filter) {
        let doc: Option<String> = conn
            .query_row(
                &format!("SELECT doc FROM {} WHERE id = ?1", table),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        return match doc {
            Some(doc) => Ok(vec![(id.to_string(), serde_json::from_str(&doc)?)]),
            None => Ok(Vec::new()),
        };
    }

    let mut stmt = conn.prepare(&format!("SELECT id, doc FROM {} ORDER BY rowid", table))?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

    let mut out = Vec::new();
    for row in rows {
        let (id, doc) = row?;
        out.push((id, serde_json::from_str(&doc)?));
    }
    Ok(out)
}

/// The id a filter pins at its top level, if any.
fn pinned_id(filter: &Filter) -> Option<&str> {
    match filter {
        Filter::Eq(path, Value::String(id)) if path == "id" => Some(id.as_str()),
        Filter::And(parts) => parts.iter().find_map(pinned_id),
        _ => None,
    }
}

fn write_doc(conn: &Connection, collection: Collection, id: &str, doc: &Value) -> Result<(), StoreError> {
    conn.execute(
        &format!("UPDATE {} SET doc = ?1 WHERE id = ?2", collection.as_str()),
        params![serde_json::to_string(doc)?, id],
    )?;
    Ok(())
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert(&self, collection: Collection, doc: Value) -> Result<(), StoreError> {
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .ok_or(StoreError::MissingId(collection))?
            .to_string();
        let json = serde_json::to_string(&doc)?;

        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO {} (id, doc) VALUES (?1, ?2)", collection.as_str()),
                params![id, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let filter = filter.clone();
        let options = options.clone();

        self.with_conn(move |conn| {
            let mut docs: Vec<Value> = load_candidates(conn, collection, &filter)?
                .into_iter()
                .map(|(_, doc)| doc)
                .filter(|doc| filter.matches(doc))
                .collect();
            options.apply(&mut docs);
            Ok(docs)
        })
        .await
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<bool, StoreError> {
        let filter = filter.clone();
        let update = update.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let target = load_candidates(&tx, collection, &filter)?
                .into_iter()
                .find(|(_, doc)| filter.matches(doc));

            let Some((id, mut doc)) = target else {
                return Ok(false);
            };
            update.apply(&mut doc);
            write_doc(&tx, collection, &id, &doc)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<usize, StoreError> {
        let filter = filter.clone();
        let update = update.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut count = 0;
            for (id, mut doc) in load_candidates(&tx, collection, &filter)? {
                if !filter.matches(&doc) {
                    continue;
                }
                update.apply(&mut doc);
                write_doc(&tx, collection, &id, &doc)?;
                count += 1;
            }
            tx.commit()?;
            Ok(count)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SortOrder;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(Collection::Messages, json!({ "id": "a", "n": 1 }))
            .await
            .unwrap();
        store
            .insert(Collection::Messages, json!({ "id": "b", "n": 2 }))
            .await
            .unwrap();

        let found = store
            .find(
                Collection::Messages,
                &Filter::All,
                &FindOptions::default().sort_by("n", SortOrder::Desc),
            )
            .await
            .unwrap();
        assert_eq!(found[0]["id"], "b");
        assert_eq!(found.len(), 2);

        // Collections are separate tables
        let sessions = store
            .find(Collection::Sessions, &Filter::All, &FindOptions::default())
            .await
            .unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_insert_requires_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .insert(Collection::Sessions, json!({ "name": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingId(Collection::Sessions)));
    }

    #[tokio::test]
    async fn test_update_one_respects_guard() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(Collection::Sessions, json!({ "id": "s1", "is_finalized": false }))
            .await
            .unwrap();

        let guard = Filter::and([Filter::eq("id", "s1"), Filter::not_true("is_finalized")]);
        let update = Update::new().set("is_finalized", true);

        assert!(store.update_one(Collection::Sessions, &guard, &update).await.unwrap());
        assert!(!store.update_one(Collection::Sessions, &guard, &update).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_many_counts_matches() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, tag) in [("a", None), ("b", Some("prod")), ("c", None)] {
            let mut doc = json!({ "id": id });
            if let Some(tag) = tag {
                doc["runtime_tag"] = json!(tag);
            }
            store.insert(Collection::Messages, doc).await.unwrap();
        }

        let count = store
            .update_many(
                Collection::Messages,
                &Filter::missing_or_empty("runtime_tag"),
                &Update::new().set("runtime_tag", "prod"),
            )
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db").join("voicebot.sqlite");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert(Collection::SessionLog, json!({ "id": "e1" }))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let found = store
            .find(Collection::SessionLog, &Filter::All, &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
