//! Core domain model and entity derivation for hashsync.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hashsync-core";

/// Column order shared by the `tweet` table writes and the full export layout.
pub const POST_COLUMNS: [&str; 11] = [
    "status_id",
    "text",
    "url",
    "date_label",
    "hashtags",
    "tagged_persons",
    "author",
    "language_code",
    "favorite_count",
    "retweet_count",
    "time_collected",
];

/// Compact single-file layout: no text column, publish date with time of day.
pub const COMPACT_POST_COLUMNS: [&str; 10] = [
    "id",
    "url",
    "created_at",
    "hashtags",
    "tagged_persons",
    "author",
    "language_code",
    "favorite_count",
    "retweet_count",
    "time_collected",
];

pub const STATUS_URL_PREFIX: &str = "https://twitter.com/twitter/statuses/";

/// `YYYY-MM-DDTHH-MM-SSZ`, the timestamp rendering used in exports.
pub const TIMESTAMP_LABEL_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

/// Normalized post produced from one raw search record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub status_id: i64,
    pub text: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub hashtags: Vec<String>,
    pub tagged_persons: Vec<String>,
    pub author: String,
    pub language_code: String,
    pub favorite_count: i64,
    pub retweet_count: i64,
    pub time_collected: DateTime<Utc>,
}

impl Post {
    pub fn status_url(status_id: i64) -> String {
        format!("{STATUS_URL_PREFIX}{status_id}")
    }

    pub fn date_label(&self) -> NaiveDate {
        self.created_at.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Hashtag,
    Bubble,
    /// Stored type string this build does not know how to run.
    Other(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            JobType::Hashtag => "hashtag",
            JobType::Bubble => "bubble",
            JobType::Other(raw) => raw.as_str(),
        }
    }
}

/// Exact match only: the stored string doubles as half of the job key, so a
/// padded or differently cased value stays `Other` and is written back as-is.
impl From<&str> for JobType {
    fn from(raw: &str) -> Self {
        match raw {
            "hashtag" => JobType::Hashtag,
            "bubble" => JobType::Bubble,
            other => JobType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduled recurring query. Keyed by `(query, job_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub query: String,
    pub job_type: JobType,
    pub interval_minutes: i32,
    pub last_executed: Option<DateTime<Utc>>,
    pub next_execution: DateTime<Utc>,
}

impl Job {
    /// New job that becomes due as soon as `now` has passed.
    pub fn new(query: impl Into<String>, job_type: JobType, interval_minutes: i32, now: DateTime<Utc>) -> Self {
        Self {
            query: query.into(),
            job_type,
            interval_minutes,
            last_executed: None,
            next_execution: now,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_execution < now
    }

    /// Schedule after a successful run at `now`.
    pub fn rescheduled(&self, now: DateTime<Utc>) -> Self {
        Self {
            last_executed: Some(now),
            next_execution: now + self.interval(),
            ..self.clone()
        }
    }

    /// Sub-queries a job expands to: the whole query for a hashtag job, the
    /// comma-separated parts for a bubble.
    pub fn sub_queries(&self) -> Vec<String> {
        match self.job_type {
            JobType::Bubble => self
                .query
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(ToString::to_string)
                .collect(),
            _ => vec![self.query.trim().to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub query: String,
    pub job_type: JobType,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashtagRecord {
    pub hashtag: String,
    pub first_seen: DateTime<Utc>,
}

/// Authors plus every mentioned user across the batch.
pub fn derive_usernames(posts: &[Post]) -> BTreeSet<String> {
    posts
        .iter()
        .flat_map(|post| std::iter::once(&post.author).chain(post.tagged_persons.iter()))
        .filter(|name| !name.is_empty())
        .map(|name| name.to_lowercase())
        .collect()
}

pub fn derive_hashtags(posts: &[Post]) -> BTreeSet<String> {
    posts
        .iter()
        .flat_map(|post| post.hashtags.iter())
        .filter(|tag| !tag.is_empty())
        .map(|tag| tag.to_lowercase())
        .collect()
}

pub fn users_seen_at(usernames: &BTreeSet<String>, seen_at: DateTime<Utc>) -> Vec<User> {
    usernames
        .iter()
        .map(|username| User {
            username: username.clone(),
            first_seen: seen_at,
        })
        .collect()
}

pub fn hashtags_seen_at(tags: &BTreeSet<String>, seen_at: DateTime<Utc>) -> Vec<HashtagRecord> {
    tags.iter()
        .map(|hashtag| HashtagRecord {
            hashtag: hashtag.clone(),
            first_seen: seen_at,
        })
        .collect()
}
