//! Persistence layer (Postgres + in-memory) and flat-file export for hashsync.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashsync_core::{
    HashtagRecord, Job, JobType, Post, SyncRecord, User, COMPACT_POST_COLUMNS, POST_COLUMNS,
    TIMESTAMP_LABEL_FORMAT,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "hashsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Idempotent writes of posts and derived entities plus job scheduling rows.
///
/// Upserts insert new keys and skip existing ones; the first-written values
/// win. Every call commits on its own.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_posts(&self, posts: &[Post]) -> Result<u64, StoreError>;
    async fn upsert_users(&self, users: &[User]) -> Result<u64, StoreError>;
    async fn upsert_hashtags(&self, hashtags: &[HashtagRecord]) -> Result<u64, StoreError>;

    /// Jobs whose next execution time is strictly before `now`.
    async fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;
    async fn update_job_schedule(&self, job: &Job, now: DateTime<Utc>) -> Result<(), StoreError>;
    async fn record_sync(&self, job: &Job) -> Result<(), StoreError>;

    /// Registers a job. Returns `false` when `(query, type)` already exists.
    async fn insert_job(&self, job: &Job) -> Result<bool, StoreError>;
}

fn insert_post_sql() -> String {
    let placeholders = (1..=POST_COLUMNS.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO tweet ({}) VALUES ({placeholders}) ON CONFLICT (status_id) DO NOTHING",
        POST_COLUMNS.join(", ")
    )
}

/// Postgres-backed store holding a single long-lived connection.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let job_type: String = row.try_get("type")?;
    Ok(Job {
        query: row.try_get("q")?,
        job_type: JobType::from(job_type.as_str()),
        interval_minutes: row.try_get("execution_intervall")?,
        last_executed: row.try_get("last_time_executed")?,
        next_execution: row.try_get("next_execution_time")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_posts(&self, posts: &[Post]) -> Result<u64, StoreError> {
        let sql = insert_post_sql();
        let mut inserted = 0u64;
        for post in posts {
            // Bind order follows POST_COLUMNS.
            let result = sqlx::query(&sql)
                .bind(post.status_id)
                .bind(&post.text)
                .bind(&post.url)
                .bind(post.date_label())
                .bind(&post.hashtags)
                .bind(&post.tagged_persons)
                .bind(&post.author)
                .bind(&post.language_code)
                .bind(post.favorite_count)
                .bind(post.retweet_count)
                .bind(post.time_collected)
                .execute(&self.pool)
                .await?;
            inserted += result.rows_affected();
        }
        debug!(batch = posts.len(), inserted, "upserted posts");
        Ok(inserted)
    }

    async fn upsert_users(&self, users: &[User]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for user in users {
            let result = sqlx::query(
                r#"
                INSERT INTO twitter_user (username, "timestamp")
                VALUES ($1, $2)
                ON CONFLICT (username) DO NOTHING
                "#,
            )
            .bind(&user.username)
            .bind(user.first_seen)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        debug!(batch = users.len(), inserted, "upserted users");
        Ok(inserted)
    }

    async fn upsert_hashtags(&self, hashtags: &[HashtagRecord]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for tag in hashtags {
            let result = sqlx::query(
                r#"
                INSERT INTO hashtag (hashtag, "timestamp")
                VALUES ($1, $2)
                ON CONFLICT (hashtag) DO NOTHING
                "#,
            )
            .bind(&tag.hashtag)
            .bind(tag.first_seen)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        debug!(batch = hashtags.len(), inserted, "upserted hashtags");
        Ok(inserted)
    }

    async fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT q, "type", execution_intervall, last_time_executed, next_execution_time
              FROM job
             WHERE next_execution_time < $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(job_from_row(&row)?);
        }
        Ok(out)
    }

    async fn update_job_schedule(&self, job: &Job, now: DateTime<Utc>) -> Result<(), StoreError> {
        let next = job.rescheduled(now);
        let result = sqlx::query(
            r#"
            UPDATE job
               SET last_time_executed = $1,
                   next_execution_time = $2
             WHERE q = $3
               AND "type" = $4
            "#,
        )
        .bind(next.last_executed)
        .bind(next.next_execution)
        .bind(&job.query)
        .bind(job.job_type.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(query = %job.query, job_type = %job.job_type, "schedule update matched no job row");
        }
        Ok(())
    }

    async fn record_sync(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(r#"INSERT INTO sync (q, "type") VALUES ($1, $2)"#)
            .bind(&job.query)
            .bind(job.job_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO job (q, "type", execution_intervall, last_time_executed, next_execution_time)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (q, "type") DO NOTHING
            "#,
        )
        .bind(&job.query)
        .bind(job.job_type.as_str())
        .bind(job.interval_minutes)
        .bind(job.last_executed)
        .bind(job.next_execution)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    posts: BTreeMap<i64, Post>,
    users: BTreeMap<String, User>,
    hashtags: BTreeMap<String, HashtagRecord>,
    jobs: Vec<Job>,
    sync_records: Vec<SyncRecord>,
}

/// In-process store with the same conflict-skip semantics as [`PgStore`].
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                jobs,
                ..MemoryState::default()
            })),
        }
    }

    pub async fn posts(&self) -> Vec<Post> {
        self.state.lock().await.posts.values().cloned().collect()
    }

    pub async fn users(&self) -> Vec<User> {
        self.state.lock().await.users.values().cloned().collect()
    }

    pub async fn hashtags(&self) -> Vec<HashtagRecord> {
        self.state.lock().await.hashtags.values().cloned().collect()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn sync_records(&self) -> Vec<SyncRecord> {
        self.state.lock().await.sync_records.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_posts(&self, posts: &[Post]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0u64;
        for post in posts {
            if !state.posts.contains_key(&post.status_id) {
                state.posts.insert(post.status_id, post.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_users(&self, users: &[User]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0u64;
        for user in users {
            if !state.users.contains_key(&user.username) {
                state.users.insert(user.username.clone(), user.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_hashtags(&self, hashtags: &[HashtagRecord]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0u64;
        for tag in hashtags {
            if !state.hashtags.contains_key(&tag.hashtag) {
                state.hashtags.insert(tag.hashtag.clone(), tag.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().filter(|job| job.is_due(now)).cloned().collect())
    }

    async fn update_job_schedule(&self, job: &Job, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state
            .jobs
            .iter_mut()
            .find(|stored| stored.query == job.query && stored.job_type == job.job_type)
        {
            Some(stored) => *stored = stored.rescheduled(now),
            None => {
                warn!(query = %job.query, job_type = %job.job_type, "schedule update matched no job row")
            }
        }
        Ok(())
    }

    async fn record_sync(&self, job: &Job) -> Result<(), StoreError> {
        self.state.lock().await.sync_records.push(SyncRecord {
            query: job.query.clone(),
            job_type: job.job_type.clone(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .jobs
            .iter()
            .any(|stored| stored.query == job.query && stored.job_type == job.job_type)
        {
            return Ok(false);
        }
        state.jobs.push(job.clone());
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportLayout {
    /// Every post column, publish date as `YYYY-MM-DD`.
    #[default]
    Full,
    /// Single-file fetch layout: no text, publish timestamp instead of date.
    Compact,
}

#[derive(Debug, Clone)]
pub struct ExportedFile {
    pub path: PathBuf,
    pub rows: usize,
}

const MAX_NAME_ATTEMPTS: usize = 100;

/// Writes post batches to timestamped CSV files under one directory.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    root: PathBuf,
    layout: ExportLayout,
}

impl CsvExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            layout: ExportLayout::Full,
        }
    }

    pub fn with_layout(mut self, layout: ExportLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(label: &str, exported_at: DateTime<Utc>, attempt: usize) -> String {
        let stamp = exported_at.format("%Y_%m_%dT%H_%M_%SZ");
        let label = sanitize_label(label);
        if attempt == 0 {
            format!("{label}_{stamp}.csv")
        } else {
            format!("{label}_{stamp}_{attempt}.csv")
        }
    }

    pub fn render(&self, posts: &[Post]) -> String {
        let header = match self.layout {
            ExportLayout::Full => POST_COLUMNS.join(","),
            ExportLayout::Compact => COMPACT_POST_COLUMNS.join(","),
        };
        let mut out = String::with_capacity(header.len() + posts.len() * 256);
        out.push_str(&header);
        out.push('\n');
        for post in posts {
            let row = match self.layout {
                ExportLayout::Full => full_row(post),
                ExportLayout::Compact => compact_row(post),
            };
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    /// Write `posts` to a new file. An existing file is never replaced: a
    /// same-second name collision gets a numeric suffix.
    pub async fn export(
        &self,
        label: &str,
        posts: &[Post],
        exported_at: DateTime<Utc>,
    ) -> anyhow::Result<ExportedFile> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating export directory {}", self.root.display()))?;

        let body = self.render(posts);
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = self.root.join(Self::file_name(label, exported_at, attempt));
            let mut file = match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("opening export file {}", path.display()))
                }
            };
            file.write_all(body.as_bytes())
                .await
                .with_context(|| format!("writing export file {}", path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing export file {}", path.display()))?;
            return Ok(ExportedFile {
                path,
                rows: posts.len(),
            });
        }
        anyhow::bail!(
            "no free export file name for {label} at {}",
            exported_at.format(TIMESTAMP_LABEL_FORMAT)
        )
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned = label
        .trim()
        .trim_start_matches('#')
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>();
    if cleaned.is_empty() {
        "query".to_string()
    } else {
        cleaned
    }
}

fn full_row(post: &Post) -> Vec<String> {
    vec![
        post.status_id.to_string(),
        quoted(&post.text),
        csv_field(&post.url),
        post.date_label().format("%Y-%m-%d").to_string(),
        csv_field(&list_literal(&post.hashtags)),
        csv_field(&list_literal(&post.tagged_persons)),
        csv_field(&post.author),
        csv_field(&post.language_code),
        post.favorite_count.to_string(),
        post.retweet_count.to_string(),
        post.time_collected.format(TIMESTAMP_LABEL_FORMAT).to_string(),
    ]
}

fn compact_row(post: &Post) -> Vec<String> {
    vec![
        post.status_id.to_string(),
        csv_field(&post.url),
        post.created_at.format(TIMESTAMP_LABEL_FORMAT).to_string(),
        csv_field(&list_literal(&post.hashtags)),
        csv_field(&list_literal(&post.tagged_persons)),
        csv_field(&post.author),
        csv_field(&post.language_code),
        post.favorite_count.to_string(),
        post.retweet_count.to_string(),
        post.time_collected.format(TIMESTAMP_LABEL_FORMAT).to_string(),
    ]
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        quoted(value)
    } else {
        value.to_string()
    }
}

/// `['a', 'b']`, quoting each item the way a Python string repr does.
fn list_literal(items: &[String]) -> String {
    let inner = items
        .iter()
        .map(|item| item_literal(item))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{inner}]")
}

fn item_literal(item: &str) -> String {
    let escaped = item.replace('\\', "\\\\");
    if item.contains('\'') && !item.contains('"') {
        format!("\"{escaped}\"")
    } else {
        format!("'{}'", escaped.replace('\'', "\\'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0)
            .single()
            .unwrap()
    }

    fn mk_post(id: i64, text: &str) -> Post {
        Post {
            status_id: id,
            text: text.to_string(),
            url: Post::status_url(id),
            created_at: ts(8, 15),
            hashtags: vec!["opec".into(), "oil".into()],
            tagged_persons: vec!["alice".into()],
            author: "bob".into(),
            language_code: "en".into(),
            favorite_count: 4,
            retweet_count: 2,
            time_collected: ts(9, 30),
        }
    }

    #[tokio::test]
    async fn upserting_a_post_twice_keeps_first_values() {
        let store = MemoryStore::new();
        let first = mk_post(1, "original text");
        let mut second = mk_post(1, "edited text");
        second.favorite_count = 99;

        assert_eq!(store.upsert_posts(&[first.clone()]).await.unwrap(), 1);
        assert_eq!(store.upsert_posts(&[second]).await.unwrap(), 0);

        let posts = store.posts().await;
        assert_eq!(posts, vec![first]);
    }

    #[tokio::test]
    async fn users_and_hashtags_skip_on_conflict() {
        let store = MemoryStore::new();
        let early = User { username: "alice".into(), first_seen: ts(1, 0) };
        let late = User { username: "alice".into(), first_seen: ts(2, 0) };
        store.upsert_users(&[early.clone()]).await.unwrap();
        store.upsert_users(&[late]).await.unwrap();
        assert_eq!(store.users().await, vec![early]);

        let tag = HashtagRecord { hashtag: "opec".into(), first_seen: ts(1, 0) };
        assert_eq!(store.upsert_hashtags(&[tag.clone(), tag.clone()]).await.unwrap(), 1);
        assert_eq!(store.hashtags().await, vec![tag]);
    }

    #[tokio::test]
    async fn due_jobs_are_strictly_before_now() {
        let now = ts(12, 0);
        let store = MemoryStore::with_jobs(vec![
            Job::new("past", JobType::Hashtag, 60, ts(11, 59)),
            Job::new("exact", JobType::Hashtag, 60, now),
            Job::new("future", JobType::Hashtag, 60, ts(12, 1)),
        ]);
        let due = store.get_due_jobs(now).await.unwrap();
        assert_eq!(due.iter().map(|j| j.query.as_str()).collect::<Vec<_>>(), vec!["past"]);
    }

    #[tokio::test]
    async fn schedule_update_is_keyed_by_query_and_type() {
        let store = MemoryStore::with_jobs(vec![
            Job::new("opec", JobType::Hashtag, 60, ts(0, 0)),
            Job::new("opec", JobType::Bubble, 30, ts(0, 0)),
        ]);
        let hashtag_job = Job::new("opec", JobType::Hashtag, 60, ts(0, 0));
        store.update_job_schedule(&hashtag_job, ts(10, 0)).await.unwrap();

        let jobs = store.jobs().await;
        assert_eq!(jobs[0].last_executed, Some(ts(10, 0)));
        assert_eq!(jobs[0].next_execution, ts(11, 0));
        assert_eq!(jobs[1].last_executed, None);
        assert_eq!(jobs[1].next_execution, ts(0, 0));
    }

    #[tokio::test]
    async fn padded_type_string_is_its_own_job_key() {
        let padded = Job::new("opec", JobType::from("hashtag "), 60, ts(0, 0));
        let store = MemoryStore::with_jobs(vec![
            Job::new("opec", JobType::Hashtag, 60, ts(0, 0)),
            padded.clone(),
        ]);
        store.update_job_schedule(&padded, ts(10, 0)).await.unwrap();
        store.record_sync(&padded).await.unwrap();

        let jobs = store.jobs().await;
        assert_eq!(jobs[0].last_executed, None);
        assert_eq!(jobs[1].job_type.as_str(), "hashtag ");
        assert_eq!(jobs[1].next_execution, ts(11, 0));
        assert_eq!(store.sync_records().await[0].job_type.as_str(), "hashtag ");
    }

    #[test]
    fn list_items_are_quoted_like_python_reprs() {
        let items = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(list_literal(&[]), "[]");
        assert_eq!(list_literal(&items(&["opec", "oil"])), "['opec', 'oil']");
        assert_eq!(list_literal(&items(&["it's"])), r#"["it's"]"#);
        assert_eq!(list_literal(&items(&[r#"it's "x""#])), r#"['it\'s "x"']"#);
        assert_eq!(list_literal(&items(&[r"a\b"])), r"['a\\b']");
    }

    #[tokio::test]
    async fn insert_job_skips_duplicates() {
        let store = MemoryStore::new();
        let job = Job::new("opec", JobType::Hashtag, 60, ts(0, 0));
        assert!(store.insert_job(&job).await.unwrap());
        assert!(!store.insert_job(&job).await.unwrap());
        assert_eq!(store.jobs().await.len(), 1);
    }

    #[test]
    fn insert_sql_follows_post_columns() {
        let sql = insert_post_sql();
        assert!(sql.starts_with(&format!("INSERT INTO tweet ({})", POST_COLUMNS.join(", "))));
        assert!(sql.contains("$11)"));
        assert!(sql.ends_with("ON CONFLICT (status_id) DO NOTHING"));
    }

    #[test]
    fn migration_declares_every_post_column() {
        let migration = include_str!("../migrations/0001_init.sql");
        let start = migration
            .find("CREATE TABLE IF NOT EXISTS tweet")
            .expect("tweet table");
        let block = &migration[start..];
        let block = &block[..block.find(");").expect("end of tweet table")];
        for column in POST_COLUMNS {
            assert!(
                block.lines().any(|line| line.trim_start().starts_with(&format!("{column} "))),
                "tweet table missing column {column}"
            );
        }
    }

    #[test]
    fn full_layout_quotes_text_and_renders_lists() {
        let exporter = CsvExporter::new("unused");
        let csv = exporter.render(&[mk_post(7, "oil \"up\", again")]);
        let lines = csv.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], POST_COLUMNS.join(","));
        assert_eq!(
            lines[1],
            "7,\"oil \"\"up\"\", again\",https://twitter.com/twitter/statuses/7,2026-03-01,\"['opec', 'oil']\",['alice'],bob,en,4,2,2026-03-01T09-30-00Z"
        );
    }

    #[test]
    fn compact_layout_uses_single_file_header() {
        let exporter = CsvExporter::new("unused").with_layout(ExportLayout::Compact);
        let csv = exporter.render(&[mk_post(7, "ignored")]);
        let lines = csv.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], COMPACT_POST_COLUMNS.join(","));
        assert!(lines[1].starts_with("7,https://twitter.com/twitter/statuses/7,2026-03-01T08-15-00Z,"));
        assert!(!lines[1].contains("ignored"));
    }

    #[test]
    fn file_name_uses_compact_utc_stamp() {
        assert_eq!(
            CsvExporter::file_name("#opec", ts(9, 5), 0),
            "opec_2026_03_01T09_05_00Z.csv"
        );
        assert_eq!(
            CsvExporter::file_name("oil/gas", ts(9, 5), 2),
            "oil_gas_2026_03_01T09_05_00Z_2.csv"
        );
    }

    #[tokio::test]
    async fn export_creates_directory_and_never_overwrites() {
        let dir = tempdir().expect("tempdir");
        let exporter = CsvExporter::new(dir.path().join("output"));
        let posts = vec![mk_post(1, "a"), mk_post(2, "b"), mk_post(3, "c")];

        let first = exporter.export("opec", &posts, ts(9, 0)).await.expect("first export");
        let second = exporter.export("opec", &posts[..1], ts(9, 0)).await.expect("second export");

        assert_ne!(first.path, second.path);
        assert_eq!(first.rows, 3);
        let written = std::fs::read_to_string(&first.path).unwrap();
        assert_eq!(written.lines().count(), 4);
        let again = std::fs::read_to_string(&second.path).unwrap();
        assert_eq!(again.lines().count(), 2);
    }
}
