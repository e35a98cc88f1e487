//! Maintenance routines behind `voicebot maintenance`.
//!
//! Every routine is a dry run unless `apply` is set, and reports whether
//! unresolved state remains so the CLI can exit non-zero for monitoring.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::Message;
use crate::finalize::{
    complete_session_done_flow, find_idle_sessions, DoneParams, DoneSideEffects, DoneSource,
    FinalizeError, IdleQuery, IdleSession,
};
use crate::store::{Collection, Filter, FindOptions, Repo, StoreError, Update, PROD_FAMILY, RUNTIME_TAG_FIELD};

/// Errors that abort a maintenance routine
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("Refusing to backfill runtime tags from non-prod runtime '{0}'")]
    NotProdRuntime(String),

    #[error("Invalid idle threshold: {0}")]
    InvalidThreshold(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Finalization error: {0}")]
    Finalize(#[from] FinalizeError),
}

/// Options shared by every routine
#[derive(Debug, Clone, Default)]
pub struct MaintenanceOptions {
    pub apply: bool,
    pub limit: Option<usize>,
    pub session_id: Option<String>,
}

/// A record the routine could not fix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub error: String,
}

// close-idle

#[derive(Debug, Clone, Serialize)]
pub struct CloseIdleReport {
    pub apply: bool,
    pub threshold_hours: f64,
    pub candidates: Vec<IdleSession>,
    pub closed: Vec<String>,
    pub failed: Vec<ItemFailure>,
}

impl CloseIdleReport {
    pub fn unresolved(&self) -> bool {
        !self.failed.is_empty() || (!self.apply && !self.candidates.is_empty())
    }
}

/// Close sessions idle for at least `hours` through the finalization flow.
pub async fn close_idle(
    repo: &Repo,
    effects: &dyn DoneSideEffects,
    hours: f64,
    now: DateTime<Utc>,
    options: &MaintenanceOptions,
) -> Result<CloseIdleReport, MaintenanceError> {
    crate::config::check_idle_hours(hours).map_err(|e| MaintenanceError::InvalidThreshold(e.to_string()))?;
    let threshold = Duration::try_minutes((hours * 60.0).round() as i64)
        .filter(|t| now.checked_sub_signed(*t).is_some())
        .ok_or_else(|| MaintenanceError::InvalidThreshold(format!("{hours} hours is out of range")))?;
    let query = IdleQuery {
        session_id: options.session_id.clone(),
        limit: options.limit,
    };
    let candidates = find_idle_sessions(repo, threshold, now, &query).await?;

    let mut report = CloseIdleReport {
        apply: options.apply,
        threshold_hours: hours,
        candidates,
        closed: Vec::new(),
        failed: Vec::new(),
    };
    if !options.apply {
        return Ok(report);
    }

    for idle in &report.candidates {
        let params = DoneParams::new(idle.session_id.clone(), DoneSource::IdleCloser, now);
        let outcome = complete_session_done_flow(repo, effects, &params).await?;
        if outcome.ok {
            info!(session_id = %idle.session_id, idle_hours = idle.idle_hours, "closed idle session");
            report.closed.push(idle.session_id.clone());
        } else {
            report.failed.push(ItemFailure {
                id: idle.session_id.clone(),
                error: outcome.error.unwrap_or_default(),
            });
        }
    }
    Ok(report)
}

// dedupe-webm

/// WebM messages of one session that are copies of the same upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub session_id: String,
    pub key: String,
    pub canonical: String,
    pub duplicates: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupeReport {
    pub apply: bool,
    pub groups: Vec<DuplicateGroup>,
    pub soft_deleted: usize,
    pub failed: Vec<ItemFailure>,
}

impl DedupeReport {
    pub fn unresolved(&self) -> bool {
        !self.failed.is_empty() || (!self.apply && !self.groups.is_empty())
    }
}

/// Identity of an upload: content hash, else name and size.
fn upload_key(message: &Message) -> Option<String> {
    if let Some(hash) = message.file_hash.as_deref().filter(|h| !h.is_empty()) {
        return Some(format!("hash:{}", hash));
    }
    match (message.file_name.as_deref(), message.file_size) {
        (Some(name), Some(size)) if !name.is_empty() => Some(format!("name:{}:{}", name, size)),
        _ => None,
    }
}

/// Group a session's WebM messages by upload; only groups with copies.
pub fn find_webm_duplicates(session_id: &str, messages: &[Message]) -> Vec<DuplicateGroup> {
    let mut by_key: BTreeMap<String, Vec<&Message>> = BTreeMap::new();
    for message in messages.iter().filter(|m| !m.is_deleted && m.is_webm()) {
        if let Some(key) = upload_key(message) {
            by_key.entry(key).or_default().push(message);
        }
    }

    by_key
        .into_iter()
        .filter(|(_, group)| group.len() > 1)
        .filter_map(|(key, mut group)| {
            // Transcribed first, then earliest
            group.sort_by_key(|m| (!m.is_transcribed, m.created_at, m.id.clone()));
            let (canonical, rest) = group.split_first()?;
            Some(DuplicateGroup {
                session_id: session_id.to_string(),
                key,
                canonical: canonical.id.clone(),
                duplicates: rest.iter().map(|m| m.id.clone()).collect(),
            })
        })
        .collect()
}

/// Soft-delete duplicate WebM messages, keeping one canonical per upload.
pub async fn dedupe_webm(
    repo: &Repo,
    now: DateTime<Utc>,
    options: &MaintenanceOptions,
) -> Result<DedupeReport, MaintenanceError> {
    let mut filter = Filter::not_true("is_deleted");
    if let Some(id) = &options.session_id {
        filter = filter.and_also(Filter::eq("id", id.clone()));
    }

    let mut groups = Vec::new();
    for session in repo.find_sessions(filter, FindOptions::default()).await? {
        let messages = repo.session_messages(&session.id).await?;
        groups.extend(find_webm_duplicates(&session.id, &messages));
    }
    if let Some(limit) = options.limit {
        groups.truncate(limit);
    }

    let mut report = DedupeReport {
        apply: options.apply,
        groups,
        soft_deleted: 0,
        failed: Vec::new(),
    };
    if !options.apply {
        return Ok(report);
    }

    for group in &report.groups {
        for duplicate in &group.duplicates {
            let deleted = repo
                .update_message(
                    duplicate,
                    Filter::not_true("is_deleted"),
                    Update::new()
                        .set("is_deleted", true)
                        .set("duplicate_of", group.canonical.clone())
                        .set("to_transcribe", false)
                        .touch(now),
                )
                .await?;
            if deleted {
                report.soft_deleted += 1;
            } else {
                warn!(message_id = %duplicate, "duplicate changed before soft delete");
                report.failed.push(ItemFailure {
                    id: duplicate.clone(),
                    error: "changed_concurrently".to_string(),
                });
            }
        }
    }
    info!(groups = report.groups.len(), soft_deleted = report.soft_deleted, "deduplicated webm messages");
    Ok(report)
}

// backfill-runtime-tag

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillCount {
    pub collection: String,
    pub untagged: usize,
    pub tagged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub apply: bool,
    pub collections: Vec<BackfillCount>,
}

impl BackfillReport {
    pub fn unresolved(&self) -> bool {
        self.collections.iter().any(|c| c.tagged < c.untagged)
    }
}

/// Tag legacy records that have no runtime tag with the prod tag.
pub async fn backfill_runtime_tag(
    repo: &Repo,
    options: &MaintenanceOptions,
) -> Result<BackfillReport, MaintenanceError> {
    if !repo.scope().is_prod() {
        return Err(MaintenanceError::NotProdRuntime(repo.scope().runtime_tag().to_string()));
    }

    let mut report = BackfillReport {
        apply: options.apply,
        collections: Vec::new(),
    };

    for collection in Collection::ALL {
        let mut filter = Filter::missing_or_empty(RUNTIME_TAG_FIELD);
        if let Some(session_id) = &options.session_id {
            let field = match collection {
                Collection::Sessions => "id",
                Collection::Messages | Collection::SessionLog => "session_id",
            };
            filter = filter.and_also(Filter::eq(field, session_id.clone()));
        }
        let mut find = FindOptions::default();
        if let Some(limit) = options.limit {
            find = find.limit(limit);
        }

        let docs = repo.find_raw(collection, filter, find).await?;
        let mut count = BackfillCount {
            collection: collection.as_str().to_string(),
            untagged: docs.len(),
            tagged: 0,
        };

        if options.apply {
            for id in docs.iter().filter_map(|d| d.get("id").and_then(Value::as_str)) {
                let tagged = repo
                    .update_raw(
                        collection,
                        id,
                        Filter::missing_or_empty(RUNTIME_TAG_FIELD),
                        Update::new().set(RUNTIME_TAG_FIELD, PROD_FAMILY),
                    )
                    .await?;
                if tagged {
                    count.tagged += 1;
                }
            }
            info!(collection = %collection, tagged = count.tagged, "backfilled runtime tags");
        }
        report.collections.push(count);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Session;
    use crate::store::{RuntimeScope, SqliteStore};
    use std::sync::Arc;

    fn webm(id: &str, created: DateTime<Utc>, hash: Option<&str>) -> Message {
        let mut m = Message::new(id, id, "s1", created);
        m.mime_type = Some("audio/webm".to_string());
        m.file_name = Some("chunk.webm".to_string());
        m.file_size = Some(1024);
        m.file_hash = hash.map(str::to_string);
        m
    }

    #[test]
    fn test_duplicates_prefer_transcribed_then_earliest() {
        let t0 = Utc::now() - Duration::hours(1);
        let a = webm("a", t0, Some("h1"));
        let mut b = webm("b", t0 + Duration::minutes(1), Some("h1"));
        b.is_transcribed = true;
        let c = webm("c", t0 + Duration::minutes(2), Some("h1"));

        let groups = find_webm_duplicates("s1", &[a, b, c]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].canonical, "b");
        assert_eq!(groups[0].duplicates, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_name_and_size_fallback() {
        let t0 = Utc::now();
        let a = webm("a", t0, None);
        let b = webm("b", t0 + Duration::seconds(5), None);
        let mut other = webm("o", t0, None);
        other.file_size = Some(2048);

        let groups = find_webm_duplicates("s1", &[a, b, other]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].canonical, "a");
        assert_eq!(groups[0].key, "name:chunk.webm:1024");
    }

    #[test]
    fn test_non_webm_is_ignored() {
        let t0 = Utc::now();
        let mut a = Message::new("a", "a", "s1", t0);
        a.file_hash = Some("h".to_string());
        let mut b = Message::new("b", "b", "s1", t0);
        b.file_hash = Some("h".to_string());
        assert!(find_webm_duplicates("s1", &[a, b]).is_empty());
    }

    #[tokio::test]
    async fn test_backfill_refuses_non_prod() {
        let repo = Repo::new(Arc::new(SqliteStore::open_in_memory().unwrap()), RuntimeScope::new("dev-alice"));
        let err = backfill_runtime_tag(&repo, &MaintenanceOptions::default()).await.unwrap_err();
        assert!(matches!(err, MaintenanceError::NotProdRuntime(_)));
    }

    #[tokio::test]
    async fn test_dedupe_apply_soft_deletes() {
        let repo = Repo::new(Arc::new(SqliteStore::open_in_memory().unwrap()), RuntimeScope::new("prod"));
        let t0 = Utc::now() - Duration::hours(1);
        repo.insert_session(&Session::new("s1", t0)).await.unwrap();
        repo.insert_message(&webm("a", t0, Some("h1"))).await.unwrap();
        repo.insert_message(&webm("b", t0 + Duration::minutes(1), Some("h1"))).await.unwrap();

        let options = MaintenanceOptions {
            apply: true,
            ..Default::default()
        };
        let report = dedupe_webm(&repo, Utc::now(), &options).await.unwrap();
        assert_eq!(report.soft_deleted, 1);
        assert!(!report.unresolved());

        let b = repo.get_message("b").await.unwrap().unwrap();
        assert!(b.is_deleted);
        assert_eq!(b.duplicate_of.as_deref(), Some("a"));

        // Second run finds nothing
        let again = dedupe_webm(&repo, Utc::now(), &MaintenanceOptions::default()).await.unwrap();
        assert!(again.groups.is_empty());
        assert!(!again.unresolved());
    }
}
