//! Search API client contracts, OAuth 1.0a signing and raw-record extraction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hashsync_core::Post;
use hmac::{Hmac, Mac};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha1::Sha1;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hashsync-adapters";

pub const DEFAULT_SEARCH_URL: &str = "https://api.twitter.com/1.1/search/tweets.json";
pub const REPOST_MARKER: &str = "RT @";
pub const DEFAULT_MAX_HASHTAGS: usize = 7;
pub const DEFAULT_SEARCH_COUNT: u32 = 100;

/// Wait applied when a 429 arrives without a usable reset header.
const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(15 * 60);

const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatus {
    pub id: i64,
    #[serde(alias = "text")]
    pub full_text: String,
    pub created_at: String,
    #[serde(default)]
    pub entities: RawEntities,
    pub user: RawUser,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub favorite_count: i64,
    #[serde(default)]
    pub retweet_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawEntities {
    #[serde(default)]
    pub hashtags: Vec<RawHashtag>,
    #[serde(default)]
    pub user_mentions: Vec<RawMention>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHashtag {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMention {
    pub screen_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUser {
    pub screen_name: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    statuses: Vec<JsonValue>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("rate limited (window resets at {reset_at:?})")]
    RateLimited { reset_at: Option<i64> },
    #[error("decoding search response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error("signing request: {0}")]
    Signing(String),
}

/// Source of raw search results for one query.
#[async_trait]
pub trait SearchSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn search(&self, query: &str) -> Result<Vec<RawStatus>, AdapterError>;
}

/// Decode a search response body. Statuses that do not match [`RawStatus`]
/// are logged and dropped.
pub fn decode_search_response(body: &[u8]) -> Result<Vec<RawStatus>, AdapterError> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    let mut out = Vec::with_capacity(response.statuses.len());
    for value in response.statuses {
        let id = value.get("id").and_then(JsonValue::as_i64);
        match serde_json::from_value::<RawStatus>(value) {
            Ok(status) => out.push(status),
            Err(err) => warn!(?id, error = %err, "skipping malformed status"),
        }
    }
    Ok(out)
}

/// Hashtag search expression for a stored query.
pub fn hashtag_query(query: &str) -> String {
    let query = query.trim();
    if query.starts_with('#') {
        query.to_string()
    } else {
        format!("#{query}")
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub max_hashtags: usize,
    pub repost_marker: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_hashtags: DEFAULT_MAX_HASHTAGS,
            repost_marker: REPOST_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Post(Post),
    Repost,
    TooManyHashtags(usize),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("status {id}: unparseable created_at {value:?}: {source}")]
    CreatedAt {
        id: i64,
        value: String,
        source: chrono::ParseError,
    },
    #[error("status {0} has no author")]
    MissingAuthor(i64),
}

/// Map one raw record to a [`Post`], or report why it was filtered.
pub fn extract_post(
    raw: &RawStatus,
    config: &ExtractorConfig,
    collected_at: DateTime<Utc>,
) -> Result<Extracted, ExtractError> {
    if raw.full_text.starts_with(&config.repost_marker) {
        return Ok(Extracted::Repost);
    }
    let tag_count = raw.entities.hashtags.len();
    if tag_count > config.max_hashtags {
        return Ok(Extracted::TooManyHashtags(tag_count));
    }

    let author = raw.user.screen_name.trim().to_lowercase();
    if author.is_empty() {
        return Err(ExtractError::MissingAuthor(raw.id));
    }
    let created_at = DateTime::parse_from_str(&raw.created_at, CREATED_AT_FORMAT)
        .map_err(|source| ExtractError::CreatedAt {
            id: raw.id,
            value: raw.created_at.clone(),
            source,
        })?
        .with_timezone(&Utc);

    Ok(Extracted::Post(Post {
        status_id: raw.id,
        text: raw.full_text.clone(),
        url: Post::status_url(raw.id),
        created_at,
        hashtags: raw
            .entities
            .hashtags
            .iter()
            .map(|tag| tag.text.to_lowercase())
            .collect(),
        tagged_persons: raw
            .entities
            .user_mentions
            .iter()
            .map(|mention| mention.screen_name.to_lowercase())
            .collect(),
        author,
        language_code: raw.lang.clone().unwrap_or_else(|| "und".to_string()),
        favorite_count: raw.favorite_count,
        retweet_count: raw.retweet_count,
        time_collected: collected_at,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionBatch {
    pub posts: Vec<Post>,
    pub reposts: usize,
    pub over_tagged: usize,
    pub malformed: usize,
}

pub fn extract_posts(
    raws: &[RawStatus],
    config: &ExtractorConfig,
    collected_at: DateTime<Utc>,
) -> ExtractionBatch {
    let mut batch = ExtractionBatch::default();
    for raw in raws {
        match extract_post(raw, config, collected_at) {
            Ok(Extracted::Post(post)) => batch.posts.push(post),
            Ok(Extracted::Repost) => batch.reposts += 1,
            Ok(Extracted::TooManyHashtags(count)) => {
                debug!(status_id = raw.id, count, "dropping over-tagged status");
                batch.over_tagged += 1;
            }
            Err(err) => {
                warn!(error = %err, "skipping malformed status");
                batch.malformed += 1;
            }
        }
    }
    batch
}

#[derive(Clone)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("access_token", &self.access_token)
            .field("access_token_secret", &"<redacted>")
            .finish()
    }
}

fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn encode_pairs(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-SHA1 signature over the normalized request. `params` holds every
/// query/body parameter plus the `oauth_*` protocol parameters.
pub fn oauth1_signature(
    method: &str,
    base_url: &str,
    params: &[(&str, &str)],
    consumer_secret: &str,
    token_secret: &str,
) -> Result<String, AdapterError> {
    let mut encoded = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>();
    encoded.sort();
    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let base_string = format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(base_url),
        percent_encode(&param_string)
    );
    let signing_key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret)
    );

    let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
        .map_err(|err| AdapterError::Signing(err.to_string()))?;
    mac.update(base_string.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

pub fn oauth1_authorization_header(
    credentials: &OAuthCredentials,
    method: &str,
    base_url: &str,
    request_params: &[(&str, &str)],
    nonce: &str,
    timestamp: i64,
) -> Result<String, AdapterError> {
    let timestamp = timestamp.to_string();
    let oauth_params = [
        ("oauth_consumer_key", credentials.consumer_key.as_str()),
        ("oauth_nonce", nonce),
        ("oauth_signature_method", "HMAC-SHA1"),
        ("oauth_timestamp", timestamp.as_str()),
        ("oauth_token", credentials.access_token.as_str()),
        ("oauth_version", "1.0"),
    ];
    let mut all_params = request_params.to_vec();
    all_params.extend_from_slice(&oauth_params);
    let signature = oauth1_signature(
        method,
        base_url,
        &all_params,
        &credentials.consumer_secret,
        &credentials.access_token_secret,
    )?;

    let mut header_params = oauth_params.to_vec();
    header_params.push(("oauth_signature", signature.as_str()));
    header_params.sort();
    let fields = header_params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("OAuth {fields}"))
}

/// Time to sleep before retrying after a 429.
pub fn rate_limit_wait(reset_at: Option<i64>, now: i64) -> Duration {
    match reset_at {
        Some(reset_at) => Duration::from_secs(reset_at.saturating_sub(now).max(0) as u64 + 1),
        None => DEFAULT_RATE_LIMIT_WINDOW,
    }
}

#[derive(Debug, Clone)]
pub struct SearchClientConfig {
    pub search_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub count: u32,
    pub wait_on_rate_limit: bool,
}

impl Default for SearchClientConfig {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            count: DEFAULT_SEARCH_COUNT,
            wait_on_rate_limit: true,
        }
    }
}

/// Standard search API client signing every request with OAuth 1.0a user
/// credentials.
#[derive(Debug)]
pub struct TwitterSearchClient {
    client: reqwest::Client,
    credentials: OAuthCredentials,
    config: SearchClientConfig,
}

impl TwitterSearchClient {
    pub fn new(credentials: OAuthCredentials, config: SearchClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            credentials,
            config,
        })
    }

    pub fn search_params(&self, query: &str) -> Vec<(String, String)> {
        vec![
            ("q".to_string(), hashtag_query(query)),
            ("tweet_mode".to_string(), "extended".to_string()),
            ("count".to_string(), self.config.count.to_string()),
        ]
    }

    async fn search_once(&self, query: &str) -> Result<Option<Vec<RawStatus>>, AdapterError> {
        let params = self.search_params(query);
        let param_refs = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<Vec<_>>();
        let nonce = Uuid::new_v4().simple().to_string();
        let authorization = oauth1_authorization_header(
            &self.credentials,
            "GET",
            &self.config.search_url,
            &param_refs,
            &nonce,
            Utc::now().timestamp(),
        )?;
        let url = format!("{}?{}", self.config.search_url, encode_pairs(&param_refs));

        let resp = self
            .client
            .get(&url)
            .header(AUTHORIZATION, authorization)
            .send()
            .await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset_at = resp
                .headers()
                .get("x-rate-limit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok());
            if !self.config.wait_on_rate_limit {
                return Err(AdapterError::RateLimited { reset_at });
            }
            let wait = rate_limit_wait(reset_at, Utc::now().timestamp());
            warn!(wait_secs = wait.as_secs(), "rate limited; waiting for window reset");
            tokio::time::sleep(wait).await;
            return Ok(None);
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::HttpStatus {
                status: status.as_u16(),
                url: self.config.search_url.clone(),
                body,
            });
        }

        let body = resp.bytes().await?;
        decode_search_response(&body).map(Some)
    }

    /// Repeats the request after each rate-limit wait.
    async fn search_until_served(&self, query: &str) -> Result<Vec<RawStatus>, AdapterError> {
        loop {
            if let Some(statuses) = self.search_once(query).await? {
                info!(retrieved = statuses.len(), "search complete");
                return Ok(statuses);
            }
        }
    }
}

#[async_trait]
impl SearchSource for TwitterSearchClient {
    fn source_id(&self) -> &'static str {
        "twitter-search"
    }

    async fn search(&self, query: &str) -> Result<Vec<RawStatus>, AdapterError> {
        let span = info_span!("search", query);
        self.search_until_served(query).instrument(span).await
    }
}

/// Offline source answering each query from `{dir}/{query}.json`, a stored
/// search response body. Unknown queries return no statuses.
#[derive(Debug, Clone)]
pub struct FixtureSearchSource {
    dir: PathBuf,
}

impl FixtureSearchSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fixture_path(&self, query: &str) -> PathBuf {
        let name = query.trim().trim_start_matches('#').to_lowercase();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl SearchSource for FixtureSearchSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, query: &str) -> Result<Vec<RawStatus>, AdapterError> {
        let path = self.fixture_path(query);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no fixture for query");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", path.display()))
                    .into())
            }
        };
        decode_search_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn collected_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap()
    }

    fn raw(id: i64, text: &str, tags: &[&str], mentions: &[&str]) -> RawStatus {
        RawStatus {
            id,
            full_text: text.to_string(),
            created_at: "Wed Oct 10 20:19:24 +0000 2018".to_string(),
            entities: RawEntities {
                hashtags: tags.iter().map(|t| RawHashtag { text: t.to_string() }).collect(),
                user_mentions: mentions
                    .iter()
                    .map(|m| RawMention { screen_name: m.to_string() })
                    .collect(),
            },
            user: RawUser { screen_name: "OilWatcher".into() },
            lang: Some("en".into()),
            favorite_count: 3,
            retweet_count: 1,
        }
    }

    #[test]
    fn extracts_lowercased_post() {
        let status = raw(42, "Prices #OPEC @Alice", &["OPEC", "Oil", "OPEC"], &["Alice"]);
        let extracted = extract_post(&status, &ExtractorConfig::default(), collected_at()).unwrap();
        let Extracted::Post(post) = extracted else {
            panic!("expected a post");
        };
        assert_eq!(post.status_id, 42);
        assert_eq!(post.url, "https://twitter.com/twitter/statuses/42");
        assert_eq!(post.author, "oilwatcher");
        assert_eq!(post.hashtags, vec!["opec", "oil", "opec"]);
        assert_eq!(post.tagged_persons, vec!["alice"]);
        assert_eq!(post.created_at, Utc.with_ymd_and_hms(2018, 10, 10, 20, 19, 24).single().unwrap());
        assert_eq!(post.time_collected, collected_at());
        assert_eq!(post.text, "Prices #OPEC @Alice");
    }

    #[test]
    fn reposts_are_dropped() {
        let status = raw(1, "RT @bob: #opec rising", &["opec"], &["bob"]);
        let extracted = extract_post(&status, &ExtractorConfig::default(), collected_at()).unwrap();
        assert_eq!(extracted, Extracted::Repost);
    }

    #[test]
    fn more_than_seven_hashtags_is_dropped() {
        let tags = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let status = raw(1, "spam", &tags, &[]);
        let batch = extract_posts(&[status], &ExtractorConfig::default(), collected_at());
        assert!(batch.posts.is_empty());
        assert_eq!(batch.over_tagged, 1);

        let seven = raw(2, "busy", &tags[..7], &[]);
        let batch = extract_posts(&[seven], &ExtractorConfig::default(), collected_at());
        assert_eq!(batch.posts.len(), 1);
    }

    #[test]
    fn threshold_is_configurable() {
        let config = ExtractorConfig { max_hashtags: 1, ..ExtractorConfig::default() };
        let status = raw(1, "two tags", &["opec", "oil"], &[]);
        assert_eq!(
            extract_post(&status, &config, collected_at()).unwrap(),
            Extracted::TooManyHashtags(2)
        );
    }

    #[test]
    fn malformed_dates_are_counted_not_raised() {
        let mut status = raw(1, "bad date", &["opec"], &[]);
        status.created_at = "yesterday".into();
        let batch = extract_posts(&[status, raw(2, "fine", &[], &[])], &ExtractorConfig::default(), collected_at());
        assert_eq!(batch.malformed, 1);
        assert_eq!(batch.posts.len(), 1);
        assert_eq!(batch.posts[0].status_id, 2);
    }

    #[test]
    fn decode_skips_statuses_missing_required_fields() {
        let body = br#"{"statuses": [
            {"id": 1, "full_text": "ok", "created_at": "Wed Oct 10 20:19:24 +0000 2018", "user": {"screen_name": "a"}},
            {"id": 2, "full_text": "no user", "created_at": "Wed Oct 10 20:19:24 +0000 2018"}
        ], "search_metadata": {}}"#;
        let statuses = decode_search_response(body).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].id, 1);
        assert!(statuses[0].entities.hashtags.is_empty());
    }

    #[test]
    fn hashtag_query_prefixes_once() {
        assert_eq!(hashtag_query("opec"), "#opec");
        assert_eq!(hashtag_query("#opec"), "#opec");
    }

    #[test]
    fn oauth_signature_matches_reference_vector() {
        let params = [
            ("status", "Hello Ladies + Gentlemen, a signed OAuth request!"),
            ("include_entities", "true"),
            ("oauth_consumer_key", "xvz1evFS4wEEPTGEFPHBog"),
            ("oauth_nonce", "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg"),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", "1318622958"),
            ("oauth_token", "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb"),
            ("oauth_version", "1.0"),
        ];
        let signature = oauth1_signature(
            "POST",
            "https://api.twitter.com/1.1/statuses/update.json",
            &params,
            "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw",
            "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE",
        )
        .unwrap();
        assert_eq!(signature, "hCtSmYh+iHYCEqBWrE7C7hYmtUk=");
    }

    #[test]
    fn signature_accepts_empty_secrets() {
        let signature = oauth1_signature("GET", DEFAULT_SEARCH_URL, &[("q", "#opec")], "", "")
            .expect("empty signing key");
        assert_eq!(BASE64.decode(signature).unwrap().len(), 20);
    }

    #[test]
    fn authorization_header_carries_encoded_signature() {
        let credentials = OAuthCredentials {
            consumer_key: "xvz1evFS4wEEPTGEFPHBog".into(),
            consumer_secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".into(),
            access_token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".into(),
            access_token_secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".into(),
        };
        let header = oauth1_authorization_header(
            &credentials,
            "POST",
            "https://api.twitter.com/1.1/statuses/update.json",
            &[
                ("status", "Hello Ladies + Gentlemen, a signed OAuth request!"),
                ("include_entities", "true"),
            ],
            "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg",
            1318622958,
        )
        .unwrap();
        assert!(header.starts_with("OAuth oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\""));
        assert!(header.contains("oauth_signature=\"hCtSmYh%2BiHYCEqBWrE7C7hYmtUk%3D\""));
        assert!(!format!("{credentials:?}").contains("kAcSOq"));
    }

    #[test]
    fn rate_limit_wait_uses_reset_header() {
        assert_eq!(rate_limit_wait(Some(1_000), 990), Duration::from_secs(11));
        assert_eq!(rate_limit_wait(Some(900), 990), Duration::from_secs(1));
        assert_eq!(rate_limit_wait(None, 990), DEFAULT_RATE_LIMIT_WINDOW);
    }
}
