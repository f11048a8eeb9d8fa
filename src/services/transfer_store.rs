//! TransferStore - SQLite persistence for transfer records.
//!
//! Every write that moves a transfer through its lifecycle is a single
//! conditional `UPDATE ... WHERE <state predicate>`. The methods return
//! whether the write won; a `false` means another writer changed the row
//! first, and callers surface that instead of retrying blindly.
//!
//! Timestamps are always bound as `DateTime<Utc>`, so the stored text sorts
//! and compares chronologically.

use crate::models::transfer::{ListQuery, Transfer, TransferStatus, Transition, UploadedFile};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use uuid::Uuid;

const TRANSFER_COLUMNS: &str = "id, status, expires_at, download_count, max_downloads, \
     object_key, created_at, filename, file_type, file_size, uploaded_at";

/// Field changes requested by an administrative update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferChanges {
    pub expires_at: Option<DateTime<Utc>>,
    pub max_downloads: Option<i64>,
    pub status: Option<TransferStatus>,
}

impl TransferChanges {
    pub fn is_empty(&self) -> bool {
        self.expires_at.is_none() && self.max_downloads.is_none() && self.status.is_none()
    }
}

/// Counter values after a download was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct DownloadCounter {
    pub download_count: i64,
    pub max_downloads: i64,
}

/// A record whose backing object still has to be removed.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PurgeCandidate {
    pub id: Uuid,
    pub status: TransferStatus,
    pub object_key: String,
}

#[derive(Clone)]
pub struct TransferStore {
    db: SqlitePool,
}

impl TransferStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Insert a new record inside its own transaction.
    pub async fn insert(&self, transfer: &Transfer) -> Result<(), sqlx::Error> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO transfers (
                id, status, expires_at, download_count, max_downloads,
                object_key, created_at, filename, file_type, file_size, uploaded_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(transfer.id)
        .bind(transfer.status)
        .bind(transfer.expires_at)
        .bind(transfer.download_count)
        .bind(transfer.max_downloads)
        .bind(&transfer.object_key)
        .bind(transfer.created_at)
        .bind(&transfer.filename)
        .bind(&transfer.file_type)
        .bind(transfer.file_size)
        .bind(transfer.uploaded_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    pub async fn fetch(&self, id: Uuid) -> Result<Option<Transfer>, sqlx::Error> {
        sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {} FROM transfers WHERE id = ?",
            TRANSFER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
    }

    /// One page of transfers plus the total number matching the filter.
    pub async fn list(&self, query: &ListQuery) -> Result<(Vec<Transfer>, i64), sqlx::Error> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM transfers");
        if let Some(status) = query.status {
            count.push(" WHERE status = ");
            count.push_bind(status);
        }
        let total: i64 = count.build_query_scalar().fetch_one(&self.db).await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM transfers",
            TRANSFER_COLUMNS
        ));
        if let Some(status) = query.status {
            builder.push(" WHERE status = ");
            builder.push_bind(status);
        }
        // Column and direction come from closed enums, never from raw input.
        builder.push(format!(
            " ORDER BY {} {}, id ASC LIMIT ",
            query.sort_by.column(),
            query.order.keyword()
        ));
        builder.push_bind(query.limit);
        builder.push(" OFFSET ");
        builder.push_bind(query.offset);

        let rows = builder.build_query_as().fetch_all(&self.db).await?;
        Ok((rows, total))
    }

    /// Record the object key for an upload. Only valid while `INIT`.
    pub async fn attach_object_key(&self, id: Uuid, object_key: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE transfers SET object_key = ?
             WHERE id = ? AND status = ?",
        )
        .bind(object_key)
        .bind(id)
        .bind(TransferStatus::Init)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `INIT -> READY`, guarded by the key whose object was verified.
    pub async fn mark_ready(
        &self,
        id: Uuid,
        object_key: &str,
        file: &UploadedFile,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE transfers
             SET status = ?, filename = ?, file_type = ?, file_size = ?, uploaded_at = ?
             WHERE id = ? AND status = ? AND object_key = ?",
        )
        .bind(TransferStatus::Ready)
        .bind(&file.filename)
        .bind(&file.file_type)
        .bind(file.file_size)
        .bind(file.uploaded_at)
        .bind(id)
        .bind(TransferStatus::Init)
        .bind(object_key)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist an observed expiry. The deadline predicate keeps a concurrent
    /// extension from being overwritten.
    pub async fn mark_expired(
        &self,
        id: Uuid,
        observed: TransferStatus,
        next: TransferStatus,
        observed_deadline: Option<DateTime<Utc>>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE transfers SET status = ?
             WHERE id = ? AND status = ? AND expires_at IS ?",
        )
        .bind(next)
        .bind(id)
        .bind(observed)
        .bind(observed_deadline)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically consume one download. `None` when the row is not `READY`,
    /// is past its deadline at `now`, or already reached `max_downloads`.
    pub async fn admit_download(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DownloadCounter>, sqlx::Error> {
        sqlx::query_as::<_, DownloadCounter>(
            "UPDATE transfers SET download_count = download_count + 1
             WHERE id = ? AND status = ? AND download_count < max_downloads
               AND (expires_at IS NULL OR expires_at >= ?)
             RETURNING download_count, max_downloads",
        )
        .bind(id)
        .bind(TransferStatus::Ready)
        .bind(now)
        .fetch_optional(&self.db)
        .await
    }

    /// Apply an administrative update as one statement, conditional on the
    /// status the caller validated against. A move to `READY` also requires a
    /// completed upload that still has its object key.
    pub async fn apply_changes(
        &self,
        id: Uuid,
        expected: TransferStatus,
        changes: &TransferChanges,
    ) -> Result<bool, sqlx::Error> {
        if changes.is_empty() {
            return Ok(true);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE transfers SET ");
        let mut fields = builder.separated(", ");
        if let Some(expires_at) = changes.expires_at {
            fields.push("expires_at = ");
            fields.push_bind_unseparated(expires_at);
        }
        if let Some(max_downloads) = changes.max_downloads {
            fields.push("max_downloads = ");
            fields.push_bind_unseparated(max_downloads);
        }
        if let Some(status) = changes.status {
            fields.push("status = ");
            fields.push_bind_unseparated(status);
        }

        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND status = ");
        builder.push_bind(expected);
        if let Some(max_downloads) = changes.max_downloads {
            builder.push(" AND download_count <= ");
            builder.push_bind(max_downloads);
        }
        if changes.status == Some(TransferStatus::Ready) {
            builder.push(" AND uploaded_at IS NOT NULL AND object_key IS NOT NULL");
        }

        let result = builder.build().execute(&self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a record `DELETED`, clearing the key only when its object is gone.
    pub async fn mark_deleted(
        &self,
        id: Uuid,
        expected: TransferStatus,
        object_purged: bool,
    ) -> Result<bool, sqlx::Error> {
        let sql = if object_purged {
            "UPDATE transfers SET status = ?, object_key = NULL WHERE id = ? AND status = ?"
        } else {
            "UPDATE transfers SET status = ? WHERE id = ? AND status = ?"
        };
        let result = sqlx::query(sql)
            .bind(TransferStatus::Deleted)
            .bind(id)
            .bind(expected)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Eagerly expire every overdue row whose status allows it.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE transfers SET status = ");
        builder.push_bind(TransferStatus::Expired);
        push_sources(&mut builder, Transition::Expire);
        builder.push(" AND expires_at IS NOT NULL AND expires_at < ");
        builder.push_bind(now);

        let result = builder.build().execute(&self.db).await?;
        Ok(result.rows_affected())
    }

    /// Records that may be purged but still reference an object.
    pub async fn purge_candidates(&self, limit: i64) -> Result<Vec<PurgeCandidate>, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT id, status, object_key FROM transfers");
        push_sources(&mut builder, Transition::Purge);
        builder.push(" AND object_key IS NOT NULL ORDER BY created_at ASC LIMIT ");
        builder.push_bind(limit);

        builder.build_query_as::<PurgeCandidate>().fetch_all(&self.db).await
    }

    /// Move a candidate to its purged status before its object is touched.
    /// Once claimed the record can no longer be revived, so the object delete
    /// cannot pull data out from under a live transfer.
    pub async fn claim_purge(
        &self,
        candidate: &PurgeCandidate,
        next: TransferStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE transfers SET status = ?
             WHERE id = ? AND status = ? AND object_key = ?",
        )
        .bind(next)
        .bind(candidate.id)
        .bind(candidate.status)
        .bind(&candidate.object_key)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop the key of a claimed record once its object is confirmed gone.
    pub async fn finalize_purge(
        &self,
        candidate: &PurgeCandidate,
        claimed: TransferStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE transfers SET object_key = NULL
             WHERE id = ? AND status = ? AND object_key = ?",
        )
        .bind(candidate.id)
        .bind(claimed)
        .bind(&candidate.object_key)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// ` WHERE status IN (...)` over every status `transition` may leave from.
fn push_sources(builder: &mut QueryBuilder<'_, Sqlite>, transition: Transition) {
    builder.push(" WHERE status IN (");
    let mut sources = builder.separated(", ");
    for status in TransferStatus::ALL {
        if status.apply(transition).is_ok() {
            sources.push_bind(status);
        }
    }
    builder.push(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transfer::{SortKey, SortOrder};
    use crate::testing::{seed_transfer, test_pool};
    use chrono::TimeDelta;

    #[tokio::test]
    async fn test_insert_and_fetch_round_trip() {
        let store = TransferStore::new(test_pool().await);
        let now = Utc::now();
        let transfer = Transfer::pending(now + TimeDelta::hours(1), 3, now);
        store.insert(&transfer).await.unwrap();

        let loaded = store.fetch(transfer.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TransferStatus::Init);
        assert_eq!(loaded.max_downloads, 3);
        assert_eq!(loaded.download_count, 0);
        assert_eq!(loaded.expires_at, transfer.expires_at);

        assert!(store.fetch(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_ready_requires_init_and_matching_key() {
        let store = TransferStore::new(test_pool().await);
        let id = seed_transfer(&store, TransferStatus::Init, Some("uploads/x/a.txt"), 1, 0, None).await;
        let file = UploadedFile {
            filename: "a.txt".into(),
            file_type: "text/plain".into(),
            file_size: 10,
            uploaded_at: Utc::now(),
        };

        assert!(!store.mark_ready(id, "uploads/x/b.txt", &file).await.unwrap());
        assert!(store.mark_ready(id, "uploads/x/a.txt", &file).await.unwrap());
        assert!(!store.mark_ready(id, "uploads/x/a.txt", &file).await.unwrap());

        let loaded = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TransferStatus::Ready);
        assert_eq!(loaded.file_size, Some(10));
    }

    #[tokio::test]
    async fn test_admit_download_never_exceeds_limit() {
        let store = TransferStore::new(test_pool().await);
        let id = seed_transfer(&store, TransferStatus::Ready, Some("k"), 2, 0, None).await;

        assert_eq!(
            store.admit_download(id, Utc::now()).await.unwrap(),
            Some(DownloadCounter {
                download_count: 1,
                max_downloads: 2
            })
        );
        assert!(store.admit_download(id, Utc::now()).await.unwrap().is_some());
        assert!(store.admit_download(id, Utc::now()).await.unwrap().is_none());

        let loaded = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(loaded.download_count, 2);
    }

    #[tokio::test]
    async fn test_mark_expired_respects_concurrent_extension() {
        let store = TransferStore::new(test_pool().await);
        let deadline = Utc::now() - TimeDelta::minutes(5);
        let id = seed_transfer(&store, TransferStatus::Ready, Some("k"), 1, 0, Some(deadline)).await;

        let extended = TransferChanges {
            expires_at: Some(Utc::now() + TimeDelta::hours(1)),
            ..Default::default()
        };
        assert!(store.apply_changes(id, TransferStatus::Ready, &extended).await.unwrap());

        // The observed deadline is stale now.
        assert!(
            !store
                .mark_expired(id, TransferStatus::Ready, TransferStatus::Expired, Some(deadline))
                .await
                .unwrap()
        );
        let loaded = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TransferStatus::Ready);
    }

    #[tokio::test]
    async fn test_apply_changes_guards_download_count() {
        let store = TransferStore::new(test_pool().await);
        let id = seed_transfer(&store, TransferStatus::Ready, Some("k"), 5, 3, None).await;

        let shrink = TransferChanges {
            max_downloads: Some(2),
            ..Default::default()
        };
        assert!(!store.apply_changes(id, TransferStatus::Ready, &shrink).await.unwrap());

        let combined = TransferChanges {
            max_downloads: Some(4),
            status: Some(TransferStatus::Expired),
            ..Default::default()
        };
        assert!(store.apply_changes(id, TransferStatus::Ready, &combined).await.unwrap());
        let loaded = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(loaded.max_downloads, 4);
        assert_eq!(loaded.status, TransferStatus::Expired);
    }

    #[tokio::test]
    async fn test_list_filters_sorts_and_counts() {
        let store = TransferStore::new(test_pool().await);
        for max in [1, 3, 2] {
            seed_transfer(&store, TransferStatus::Ready, None, max, 0, None).await;
        }
        seed_transfer(&store, TransferStatus::Init, None, 9, 0, None).await;

        let query = ListQuery {
            status: Some(TransferStatus::Ready),
            sort_by: SortKey::MaxDownloads,
            order: SortOrder::Asc,
            limit: 2,
            offset: 0,
        };
        let (rows, total) = store.list(&query).await.unwrap();
        assert_eq!(total, 3);
        let maxes: Vec<i64> = rows.iter().map(|t| t.max_downloads).collect();
        assert_eq!(maxes, vec![1, 2]);

        let (rest, _) = store
            .list(&ListQuery {
                offset: 2,
                ..query
            })
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].max_downloads, 3);
    }

    #[tokio::test]
    async fn test_ready_requires_a_completed_upload() {
        let store = TransferStore::new(test_pool().await);
        let never_uploaded =
            seed_transfer(&store, TransferStatus::Expired, None, 1, 0, None).await;
        let uploaded = seed_transfer(&store, TransferStatus::Expired, Some("k"), 1, 0, None).await;
        let revive = TransferChanges {
            expires_at: Some(Utc::now() + TimeDelta::hours(1)),
            status: Some(TransferStatus::Ready),
            ..Default::default()
        };

        assert!(!store.apply_changes(never_uploaded, TransferStatus::Expired, &revive).await.unwrap());
        assert!(store.apply_changes(uploaded, TransferStatus::Expired, &revive).await.unwrap());
    }

    #[tokio::test]
    async fn test_claimed_purge_blocks_revival() {
        let store = TransferStore::new(test_pool().await);
        let id = seed_transfer(&store, TransferStatus::Expired, Some("k"), 1, 0, None).await;
        let candidates = store.purge_candidates(10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].status, TransferStatus::Expired);

        assert!(store.claim_purge(&candidates[0], TransferStatus::Deleted).await.unwrap());
        let revive = TransferChanges {
            expires_at: Some(Utc::now() + TimeDelta::hours(1)),
            status: Some(TransferStatus::Ready),
            ..Default::default()
        };
        assert!(!store.apply_changes(id, TransferStatus::Expired, &revive).await.unwrap());

        assert!(store.finalize_purge(&candidates[0], TransferStatus::Deleted).await.unwrap());
        let stored = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Deleted);
        assert!(stored.object_key.is_none());
        assert!(store.purge_candidates(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_loses_to_revival() {
        let store = TransferStore::new(test_pool().await);
        let id = seed_transfer(&store, TransferStatus::Expired, Some("k"), 1, 0, None).await;
        let candidates = store.purge_candidates(10).await.unwrap();

        let revive = TransferChanges {
            expires_at: Some(Utc::now() + TimeDelta::hours(1)),
            status: Some(TransferStatus::Ready),
            ..Default::default()
        };
        assert!(store.apply_changes(id, TransferStatus::Expired, &revive).await.unwrap());
        assert!(!store.claim_purge(&candidates[0], TransferStatus::Deleted).await.unwrap());
        assert_eq!(store.fetch(id).await.unwrap().unwrap().object_key.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn test_expire_overdue_only_touches_live_rows() {
        let store = TransferStore::new(test_pool().await);
        let past = Some(Utc::now() - TimeDelta::minutes(1));
        let future = Some(Utc::now() + TimeDelta::hours(1));
        let overdue = seed_transfer(&store, TransferStatus::Ready, Some("a"), 1, 0, past).await;
        let fresh = seed_transfer(&store, TransferStatus::Ready, Some("b"), 1, 0, future).await;
        let gone = seed_transfer(&store, TransferStatus::Deleted, None, 1, 0, past).await;

        assert_eq!(store.expire_overdue(Utc::now()).await.unwrap(), 1);
        let status = |id| {
            let store = store.clone();
            async move { store.fetch(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(overdue).await, TransferStatus::Expired);
        assert_eq!(status(fresh).await, TransferStatus::Ready);
        assert_eq!(status(gone).await, TransferStatus::Deleted);
    }
}
