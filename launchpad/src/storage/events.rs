use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Event {
    pub id: String,
    pub site_id: Option<String>,
    pub kind: String,
    pub details: String,
    pub emitted: String,
}

pub async fn insert(conn: &mut SqliteConnection, event: &Event) -> Result<(), StorageError> {
    let query =
        sqlx::query("INSERT INTO events (id, site_id, kind, details, emitted) VALUES (?, ?, ?, ?, ?);")
            .bind(&event.id)
            .bind(&event.site_id)
            .bind(&event.kind)
            .bind(&event.details)
            .bind(&event.emitted);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Return all events in insertion order; limited to 200 rows in any one response.
/// The reverse parameter flips the ordering so the newest event comes first.
pub async fn list(
    conn: &mut SqliteConnection,
    offset: i64,
    limit: i64,
    reverse: bool,
) -> Result<Vec<Event>, StorageError> {
    let limit = if limit <= 0 || limit as u64 > MAX_ROW_LIMIT {
        MAX_ROW_LIMIT as i64
    } else {
        limit
    };

    let order = if reverse { "DESC" } else { "ASC" };
    let query_str = format!(
        "SELECT id, site_id, kind, details, emitted FROM events ORDER BY rowid {order} LIMIT ? OFFSET ?;"
    );

    let query = sqlx::query_as::<_, Event>(&query_str)
        .bind(limit)
        .bind(offset);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Every event recorded for a single site, oldest first.
pub async fn list_by_site(
    conn: &mut SqliteConnection,
    site_id: &str,
    offset: i64,
    limit: i64,
) -> Result<Vec<Event>, StorageError> {
    let limit = if limit <= 0 || limit as u64 > MAX_ROW_LIMIT {
        MAX_ROW_LIMIT as i64
    } else {
        limit
    };

    let query = sqlx::query_as::<_, Event>(
        "SELECT id, site_id, kind, details, emitted FROM events WHERE site_id = ? \
        ORDER BY rowid ASC LIMIT ? OFFSET ?;",
    )
    .bind(site_id)
    .bind(limit)
    .bind(offset);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Removes every event emitted before the given cutoff (epoch milliseconds). Returns how many
/// rows went away.
pub async fn delete_older_than(
    conn: &mut SqliteConnection,
    cutoff: u64,
) -> Result<u64, StorageError> {
    let query = sqlx::query("DELETE FROM events WHERE CAST(emitted AS INTEGER) < ?;")
        .bind(cutoff as i64);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|result| result.rows_affected())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;

    fn event(id: &str, site_id: Option<&str>, emitted: u64) -> Event {
        Event {
            id: id.into(),
            site_id: site_id.map(String::from),
            kind: "{}".into(),
            details: String::new(),
            emitted: emitted.to_string(),
        }
    }

    #[tokio::test]
    async fn events_keep_insertion_order() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.expect("Failed to open connection");

        for (id, site) in [("c", Some("one")), ("a", Some("two")), ("b", Some("one"))] {
            insert(&mut conn, &event(id, site, 10)).await.expect("Failed to insert event");
        }

        let all = list(&mut conn, 0, 0, false).await.expect("Failed to list events");
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        let newest_first = list(&mut conn, 0, 0, true).await.expect("Failed to list events");
        assert_eq!(newest_first[0].id, "b");

        let one = list_by_site(&mut conn, "one", 0, 0).await.expect("Failed to list events");
        let ids: Vec<_> = one.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn prune_removes_only_old_events() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.expect("Failed to open connection");

        insert(&mut conn, &event("old", None, 100)).await.expect("Failed to insert event");
        insert(&mut conn, &event("new", None, 5_000)).await.expect("Failed to insert event");

        let removed = delete_older_than(&mut conn, 1_000).await.expect("Failed to prune events");
        assert_eq!(removed, 1);

        let remaining = list(&mut conn, 0, 0, false).await.expect("Failed to list events");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "new");
    }
}
