//! Job scheduling and execution loop.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hashsync_adapters::{
    extract_posts, ExtractorConfig, OAuthCredentials, SearchClientConfig, SearchSource,
    TwitterSearchClient, DEFAULT_MAX_HASHTAGS, DEFAULT_SEARCH_COUNT,
};
use hashsync_core::{derive_hashtags, derive_usernames, hashtags_seen_at, users_seen_at, Job, JobType};
use hashsync_storage::{CsvExporter, ExportLayout, ExportedFile, PgStore, Store};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hashsync-sync";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// What a failing job does to the rest of its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort the cycle; later due jobs wait for the next one.
    #[default]
    AbortCycle,
    /// Log the failure and carry on with the next due job.
    IsolateJobs,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub output_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_hashtags: usize,
    pub search_count: u32,
    pub failure_policy: FailurePolicy,
    pub wait_on_rate_limit: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            database_url: database_url_from_env(),
            output_dir: std::env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./output")),
            poll_interval: Duration::from_secs(env_parse(
                "POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL.as_secs(),
            )),
            max_hashtags: env_parse("MAX_HASHTAGS", DEFAULT_MAX_HASHTAGS),
            search_count: env_parse("SEARCH_COUNT", DEFAULT_SEARCH_COUNT),
            failure_policy: if env_flag("HASHSYNC_ISOLATE_JOB_FAILURES", false) {
                FailurePolicy::IsolateJobs
            } else {
                FailurePolicy::AbortCycle
            },
            wait_on_rate_limit: env_flag("HASHSYNC_WAIT_ON_RATE_LIMIT", true),
            user_agent: std::env::var("HASHSYNC_USER_AGENT")
                .unwrap_or_else(|_| "hashsync/0.1".to_string()),
            http_timeout_secs: env_parse("HASHSYNC_HTTP_TIMEOUT_SECS", 20),
        }
    }

    pub fn search_client_config(&self) -> SearchClientConfig {
        SearchClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            count: self.search_count,
            wait_on_rate_limit: self.wait_on_rate_limit,
            ..Default::default()
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            max_hashtags: self.max_hashtags,
            ..Default::default()
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// `DATABASE_URL` when set, otherwise assembled from the `DB_*` variables.
pub fn database_url_from_env() -> String {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return url;
    }
    assemble_database_url(
        &std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
        &std::env::var("DB_PASSWORD").unwrap_or_default(),
        &std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
        &std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string()),
        &std::env::var("DB_NAME").unwrap_or_else(|_| "hashsync".to_string()),
    )
}

pub fn assemble_database_url(user: &str, password: &str, host: &str, port: &str, name: &str) -> String {
    let auth = if password.is_empty() {
        urlencoding::encode(user).into_owned()
    } else {
        format!("{}:{}", urlencoding::encode(user), urlencoding::encode(password))
    };
    format!("postgres://{auth}@{host}:{port}/{name}")
}

pub fn credentials_from_env() -> Result<OAuthCredentials> {
    let _ = dotenvy::dotenv();
    Ok(OAuthCredentials {
        consumer_key: std::env::var("TWITTER_API_KEY").context("TWITTER_API_KEY must be set")?,
        consumer_secret: std::env::var("TWITTER_API_KEY_SECRET")
            .context("TWITTER_API_KEY_SECRET must be set")?,
        access_token: std::env::var("TWITTER_ACCESS_TOKEN")
            .context("TWITTER_ACCESS_TOKEN must be set")?,
        access_token_secret: std::env::var("TWITTER_ACCESS_TOKEN_SECRET")
            .context("TWITTER_ACCESS_TOKEN_SECRET must be set")?,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub query: String,
    pub fetched: usize,
    pub extracted: usize,
    pub posts_stored: u64,
    pub users_stored: u64,
    pub hashtags_stored: u64,
    pub export_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub enum JobOutcome {
    Completed { queries: Vec<QueryOutcome> },
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub due_jobs: usize,
    pub completed_jobs: usize,
    pub skipped_jobs: usize,
    pub failed_jobs: usize,
    pub posts_stored: u64,
    pub export_files: usize,
}

/// Runs due jobs one after another against an injected store and source.
pub struct JobRunner {
    store: Arc<dyn Store>,
    source: Arc<dyn SearchSource>,
    exporter: CsvExporter,
    extractor: ExtractorConfig,
    failure_policy: FailurePolicy,
}

impl JobRunner {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn SearchSource>, exporter: CsvExporter) -> Self {
        Self {
            store,
            source,
            exporter,
            extractor: ExtractorConfig::default(),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_extractor(mut self, extractor: ExtractorConfig) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Fetch, store and export one query. Users and hashtags are written
    /// before the posts that reference them.
    pub async fn collect_query(&self, query: &str) -> Result<QueryOutcome> {
        let statuses = self
            .source
            .search(query)
            .await
            .with_context(|| format!("searching {query}"))?;
        let batch = extract_posts(&statuses, &self.extractor, Utc::now());
        if batch.reposts + batch.over_tagged + batch.malformed > 0 {
            debug!(
                reposts = batch.reposts,
                over_tagged = batch.over_tagged,
                malformed = batch.malformed,
                "filtered statuses"
            );
        }

        let seen_at = Utc::now();
        let users = users_seen_at(&derive_usernames(&batch.posts), seen_at);
        let hashtags = hashtags_seen_at(&derive_hashtags(&batch.posts), seen_at);

        let users_stored = self
            .store
            .upsert_users(&users)
            .await
            .context("upserting users")?;
        let hashtags_stored = self
            .store
            .upsert_hashtags(&hashtags)
            .await
            .context("upserting hashtags")?;
        let posts_stored = self
            .store
            .upsert_posts(&batch.posts)
            .await
            .context("upserting posts")?;

        let ExportedFile { path, rows } = self
            .exporter
            .export(query, &batch.posts, Utc::now())
            .await?;
        info!(
            fetched = statuses.len(),
            rows,
            posts_stored,
            file = %path.display(),
            "query collected"
        );

        Ok(QueryOutcome {
            query: query.to_string(),
            fetched: statuses.len(),
            extracted: batch.posts.len(),
            posts_stored,
            users_stored,
            hashtags_stored,
            export_path: path,
        })
    }

    /// Run one job and advance its schedule from `now`. A bubble's sync
    /// record and schedule update happen only after every sub-query succeeded.
    pub async fn execute_job(&self, job: &Job, now: DateTime<Utc>) -> Result<JobOutcome> {
        let span = info_span!("job", query = %job.query, job_type = %job.job_type);
        self.execute_job_inner(job, now).instrument(span).await
    }

    async fn execute_job_inner(&self, job: &Job, now: DateTime<Utc>) -> Result<JobOutcome> {
        let queries = match &job.job_type {
            JobType::Hashtag | JobType::Bubble => job.sub_queries(),
            JobType::Other(raw) => {
                warn!(job_type = %raw, "unrecognized job type; skipping");
                return Ok(JobOutcome::Skipped);
            }
        };

        let mut outcomes = Vec::with_capacity(queries.len());
        for query in &queries {
            outcomes.push(self.collect_query(query).await?);
        }

        self.store
            .record_sync(job)
            .await
            .context("recording sync")?;
        self.store
            .update_job_schedule(job, now)
            .await
            .context("updating job schedule")?;
        Ok(JobOutcome::Completed { queries: outcomes })
    }

    /// Execute every job due at `now`, in the order the store returns them.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleSummary> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %cycle_id);
        self.run_cycle_inner(cycle_id, now).instrument(span).await
    }

    async fn run_cycle_inner(&self, cycle_id: Uuid, now: DateTime<Utc>) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let jobs = self
            .store
            .get_due_jobs(now)
            .await
            .context("loading due jobs")?;

        let mut summary = CycleSummary {
            cycle_id,
            started_at,
            finished_at: started_at,
            due_jobs: jobs.len(),
            completed_jobs: 0,
            skipped_jobs: 0,
            failed_jobs: 0,
            posts_stored: 0,
            export_files: 0,
        };

        for job in &jobs {
            match self.execute_job(job, now).await {
                Ok(JobOutcome::Completed { queries }) => {
                    summary.completed_jobs += 1;
                    summary.export_files += queries.len();
                    summary.posts_stored += queries.iter().map(|q| q.posts_stored).sum::<u64>();
                }
                Ok(JobOutcome::Skipped) => summary.skipped_jobs += 1,
                Err(err) => match self.failure_policy {
                    FailurePolicy::AbortCycle => {
                        return Err(err.context(format!(
                            "job {} ({}) failed",
                            job.query, job.job_type
                        )));
                    }
                    FailurePolicy::IsolateJobs => {
                        error!(query = %job.query, job_type = %job.job_type, error = ?err, "job failed");
                        summary.failed_jobs += 1;
                    }
                },
            }
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Poll forever: run a cycle, log its outcome, sleep. Cycle errors are
    /// logged and never end the loop; Ctrl-C during the sleep does.
    pub async fn run_forever(&self, poll_interval: Duration) -> Result<()> {
        info!(poll_secs = poll_interval.as_secs(), "starting job loop");
        loop {
            match self.run_cycle(Utc::now()).await {
                Ok(summary) if summary.due_jobs > 0 => info!(
                    cycle_id = %summary.cycle_id,
                    due = summary.due_jobs,
                    completed = summary.completed_jobs,
                    skipped = summary.skipped_jobs,
                    failed = summary.failed_jobs,
                    posts_stored = summary.posts_stored,
                    "cycle finished"
                ),
                Ok(_) => debug!("no due jobs"),
                Err(err) => error!(error = ?err, "cycle aborted"),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listening for ctrl-c")?;
                    info!("shutdown requested; stopping job loop");
                    return Ok(());
                }
            }
        }
    }
}

/// Production runner: Postgres store plus the signed search client.
pub async fn runner_from_config(config: &SyncConfig, credentials: OAuthCredentials) -> Result<JobRunner> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let source = TwitterSearchClient::new(credentials, config.search_client_config())?;
    Ok(JobRunner::new(
        Arc::new(store),
        Arc::new(source),
        CsvExporter::new(config.output_dir.clone()),
    )
    .with_extractor(config.extractor_config())
    .with_failure_policy(config.failure_policy))
}

/// Single-file mode: fetch one hashtag and write a compact export, without a
/// database.
pub async fn fetch_to_file(
    source: &dyn SearchSource,
    output_dir: impl Into<PathBuf>,
    extractor: &ExtractorConfig,
    hashtag: &str,
) -> Result<ExportedFile> {
    info!(hashtag, "start retrieving posts");
    let statuses = source
        .search(hashtag)
        .await
        .with_context(|| format!("searching {hashtag}"))?;
    let batch = extract_posts(&statuses, extractor, Utc::now());
    info!(retrieved = batch.posts.len(), "retrieving stopped");
    CsvExporter::new(output_dir)
        .with_layout(ExportLayout::Compact)
        .export(hashtag, &batch.posts, Utc::now())
        .await
}
