use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Site {
    pub site_id: String,
    pub user_id: String,
    pub site_url: String,
    pub slot: Option<i64>,
    pub status: String,
    pub is_deployed: bool,
    pub deployed_at: Option<String>,
    pub live_url: Option<String>,
    pub hosting_url: Option<String>,
    pub repository: Option<String>,
    pub error: String,
    pub domain_state: String,
    pub nameservers: String,
    pub domain_expiry: Option<String>,
    pub attempts: i64,
    pub last_reason: Option<String>,
    pub created: String,
    pub modified: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub status: Option<String>,
    pub is_deployed: Option<bool>,
    pub deployed_at: Option<String>,
    pub live_url: Option<String>,
    pub hosting_url: Option<String>,
    pub repository: Option<String>,
    pub error: Option<String>,
    pub domain_state: Option<String>,
    pub nameservers: Option<String>,
    pub domain_expiry: Option<String>,
    pub attempts: Option<i64>,
    pub last_reason: Option<String>,
    pub modified: Option<String>,
}

impl UpdatableFields {
    /// Appends `column = ?` pairs for every populated field and returns how many were written.
    fn push_assignments(self, builder: &mut QueryBuilder<'_, Sqlite>) -> usize {
        let mut updated_fields_total = 0;
        let total = &mut updated_fields_total;

        if let Some(value) = self.status {
            push_column(builder, total, "status").push_bind(value);
        }
        if let Some(value) = self.is_deployed {
            push_column(builder, total, "is_deployed").push_bind(value);
        }
        if let Some(value) = self.deployed_at {
            push_column(builder, total, "deployed_at").push_bind(value);
        }
        if let Some(value) = self.live_url {
            push_column(builder, total, "live_url").push_bind(value);
        }
        if let Some(value) = self.hosting_url {
            push_column(builder, total, "hosting_url").push_bind(value);
        }
        if let Some(value) = self.repository {
            push_column(builder, total, "repository").push_bind(value);
        }
        if let Some(value) = self.error {
            push_column(builder, total, "error").push_bind(value);
        }
        if let Some(value) = self.domain_state {
            push_column(builder, total, "domain_state").push_bind(value);
        }
        if let Some(value) = self.nameservers {
            push_column(builder, total, "nameservers").push_bind(value);
        }
        if let Some(value) = self.domain_expiry {
            push_column(builder, total, "domain_expiry").push_bind(value);
        }
        if let Some(value) = self.attempts {
            push_column(builder, total, "attempts").push_bind(value);
        }
        if let Some(value) = self.last_reason {
            push_column(builder, total, "last_reason").push_bind(value);
        }
        if let Some(value) = self.modified {
            push_column(builder, total, "modified").push_bind(value);
        }

        updated_fields_total
    }
}

fn push_column<'b, 'args>(
    builder: &'b mut QueryBuilder<'args, Sqlite>,
    updated_fields_total: &mut usize,
    column: &str,
) -> &'b mut QueryBuilder<'args, Sqlite> {
    if *updated_fields_total > 0 {
        builder.push(", ");
    }
    builder.push(format!("{column} = "));
    *updated_fields_total += 1;
    builder
}

const COLUMNS: &str = "site_id, user_id, site_url, slot, status, is_deployed, deployed_at, live_url, \
    hosting_url, repository, error, domain_state, nameservers, domain_expiry, attempts, last_reason, created, modified";

pub async fn insert(conn: &mut SqliteConnection, site: &Site) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO sites (site_id, user_id, site_url, slot, status, is_deployed, deployed_at, live_url, \
        hosting_url, repository, error, domain_state, nameservers, domain_expiry, attempts, last_reason, created, \
        modified) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&site.site_id)
    .bind(&site.user_id)
    .bind(&site.site_url)
    .bind(site.slot)
    .bind(&site.status)
    .bind(site.is_deployed)
    .bind(&site.deployed_at)
    .bind(&site.live_url)
    .bind(&site.hosting_url)
    .bind(&site.repository)
    .bind(&site.error)
    .bind(&site.domain_state)
    .bind(&site.nameservers)
    .bind(&site.domain_expiry)
    .bind(site.attempts)
    .bind(&site.last_reason)
    .bind(&site.created)
    .bind(&site.modified);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list(
    conn: &mut SqliteConnection,
    offset: i64,
    limit: i64,
) -> Result<Vec<Site>, StorageError> {
    let limit = if limit <= 0 || limit as u64 > MAX_ROW_LIMIT {
        MAX_ROW_LIMIT as i64
    } else {
        limit
    };

    let query_str = format!("SELECT {COLUMNS} FROM sites ORDER BY created ASC, site_id ASC LIMIT ? OFFSET ?;");

    let query = sqlx::query_as::<_, Site>(&query_str)
        .bind(limit)
        .bind(offset);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Returns every site currently in one of the given statuses.
pub async fn list_by_status(
    conn: &mut SqliteConnection,
    statuses: &[String],
) -> Result<Vec<Site>, StorageError> {
    if statuses.is_empty() {
        return Ok(vec![]);
    }

    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {COLUMNS} FROM sites WHERE status IN ("));

    let mut separated = builder.separated(", ");
    for status in statuses {
        separated.push_bind(status.clone());
    }
    separated.push_unseparated(") ORDER BY modified ASC;");

    let query = builder.build_query_as::<Site>();
    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, site_id: &str) -> Result<Site, StorageError> {
    let query_str = format!("SELECT {COLUMNS} FROM sites WHERE site_id = ?;");

    let query = sqlx::query_as::<_, Site>(&query_str).bind(site_id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// The site that owns `repository`, if any.
pub async fn get_by_repository(
    conn: &mut SqliteConnection,
    repository: &str,
) -> Result<Site, StorageError> {
    let query_str = format!("SELECT {COLUMNS} FROM sites WHERE repository = ?;");

    let query = sqlx::query_as::<_, Site>(&query_str).bind(repository);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Applies `fields` only if the record is still in `expected_status`.
///
/// This is the single primitive every status transition goes through. Zero affected rows means
/// either the site is gone or somebody else moved it first; the two are told apart with a
/// follow-up read so callers get `NotFound` or `StatusMismatch` respectively.
pub async fn compare_and_set(
    conn: &mut SqliteConnection,
    site_id: &str,
    expected_status: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE sites SET ");

    let updated_fields_total = fields.push_assignments(&mut builder);

    // If no fields were updated, return an error
    if updated_fields_total == 0 {
        return Err(StorageError::NoFieldsUpdated);
    }

    builder.push(" WHERE site_id = ");
    builder.push_bind(site_id.to_string());
    builder.push(" AND status = ");
    builder.push_bind(expected_status.to_string());
    builder.push(";");

    let query = builder.build();
    let sql = query.sql();

    let result = query
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error(e, sql))?;

    if result.rows_affected() == 0 {
        let current = get(conn, site_id).await?;
        return Err(StorageError::StatusMismatch {
            expected: expected_status.to_string(),
            actual: current.status,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;
    use sqlx::{pool::PoolConnection, Sqlite};

    fn new_site(site_id: &str, site_url: &str) -> Site {
        Site {
            site_id: site_id.into(),
            user_id: "4f1c2a9e-77aa-4a43-9a3b-b1f0c0de0001".into(),
            site_url: site_url.into(),
            slot: None,
            status: "created".into(),
            is_deployed: false,
            deployed_at: None,
            live_url: None,
            hosting_url: None,
            repository: None,
            error: "null".into(),
            domain_state: "none".into(),
            nameservers: "[]".into(),
            domain_expiry: None,
            attempts: 0,
            last_reason: None,
            created: "1".into(),
            modified: "1".into(),
        }
    }

    async fn setup() -> Result<(TestHarness, PoolConnection<Sqlite>), Box<dyn std::error::Error>> {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await?;

        insert(&mut conn, &new_site("site_one", "joes-pizza.com")).await?;

        Ok((harness, conn))
    }

    #[tokio::test]
    async fn crud_sites() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let sites = list(&mut conn, 0, 0).await.expect("Failed to list sites");
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].site_url, "joes-pizza.com");

        let fetched = get(&mut conn, "site_one").await.expect("Failed to get site");
        assert_eq!(fetched.status, "created");
        assert!(!fetched.is_deployed);
        assert_eq!(fetched.deployed_at, None);

        compare_and_set(
            &mut conn,
            "site_one",
            "created",
            UpdatableFields {
                status: Some("queued".into()),
                attempts: Some(1),
                last_reason: Some("first deploy".into()),
                ..Default::default()
            },
        )
        .await
        .expect("Failed to update site");

        let fetched = get(&mut conn, "site_one").await.expect("Failed to get site");
        assert_eq!(fetched.status, "queued");
        assert_eq!(fetched.attempts, 1);
        assert_eq!(fetched.last_reason.as_deref(), Some("first deploy"));
    }

    #[tokio::test]
    async fn duplicate_site_url_is_rejected() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let err = insert(&mut conn, &new_site("site_two", "joes-pizza.com"))
            .await
            .unwrap_err();

        assert_eq!(err, StorageError::Exists);
    }

    #[tokio::test]
    async fn repositories_belong_to_one_site() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let mut first = new_site("site_two", "sals-bakery.com");
        first.repository = Some("launchpad-4f1c2a9e".into());
        insert(&mut conn, &first).await.expect("Failed to insert site");

        let owner = get_by_repository(&mut conn, "launchpad-4f1c2a9e")
            .await
            .expect("Failed to get site");
        assert_eq!(owner.site_id, "site_two");

        let mut second = new_site("site_three", "tonys-tacos.com");
        second.repository = Some("launchpad-4f1c2a9e".into());
        let err = insert(&mut conn, &second).await.unwrap_err();
        assert_eq!(err, StorageError::Exists);

        // Sites that haven't been given a repository don't collide with each other.
        insert(&mut conn, &new_site("site_four", "tonys-tacos.com"))
            .await
            .expect("Failed to insert site");

        let err = get_by_repository(&mut conn, "launchpad-00000000").await.unwrap_err();
        assert_eq!(err, StorageError::NotFound);
    }

    #[tokio::test]
    async fn compare_and_set_refuses_stale_status() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let err = compare_and_set(
            &mut conn,
            "site_one",
            "failed",
            UpdatableFields {
                status: Some("queued".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        assert_eq!(
            err,
            StorageError::StatusMismatch {
                expected: "failed".into(),
                actual: "created".into()
            }
        );

        let untouched = get(&mut conn, "site_one").await.expect("Failed to get site");
        assert_eq!(untouched.status, "created");
    }

    #[tokio::test]
    async fn compare_and_set_reports_missing_site() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let err = compare_and_set(
            &mut conn,
            "nope",
            "created",
            UpdatableFields {
                status: Some("queued".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err, StorageError::NotFound);
    }

    #[tokio::test]
    async fn compare_and_set_requires_fields() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let err = compare_and_set(&mut conn, "site_one", "created", UpdatableFields::default())
            .await
            .unwrap_err();

        assert_eq!(err, StorageError::NoFieldsUpdated);
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let (_harness, mut conn) = setup().await.expect("Failed to set up DB");

        let mut busy = new_site("site_two", "busy.example.com");
        busy.status = "publishing".into();
        insert(&mut conn, &busy).await.expect("Failed to insert site");

        let in_progress = list_by_status(&mut conn, &["queued".into(), "publishing".into()])
            .await
            .expect("Failed to list sites");

        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].site_id, "site_two");

        let none = list_by_status(&mut conn, &[]).await.expect("Failed to list sites");
        assert!(none.is_empty());
    }
}
