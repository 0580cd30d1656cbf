//! Disk cache of decoded API responses.
//!
//! Entries live in a directory versioned by the crate's major version. Each
//! file is named by the SHA-256 of the canonical request description and
//! holds a JSON array `[description, payload, cached_at]`.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::params::EncodedParams;
use crate::request::Request;
use crate::site::{AuthClass, SiteIdentity};

const CACHE_DIR_PREFIX: &str = "apicache-v";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record(String, Value, DateTime<Utc>);

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub description: String,
    pub payload: Value,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub kept: usize,
    pub expired: usize,
    pub corrupt: usize,
}

pub struct ResponseCache {
    dir: PathBuf,
    expiry: Duration,
}

impl ResponseCache {
    pub fn new(root: &Path, expiry: Duration) -> Self {
        Self {
            dir: root.join(format!("{CACHE_DIR_PREFIX}{}", env!("CARGO_PKG_VERSION_MAJOR"))),
            expiry,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.cache_dir(), config.cache_expiry())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Canonical description of a request; independent of parameter order.
    pub fn description(site: &SiteIdentity, auth: &AuthClass, params: &EncodedParams) -> String {
        format!(
            "site={site}\nauth={}\n{}",
            auth.cache_key(),
            params.canonical()
        )
    }

    pub fn fingerprint(description: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(description.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(fingerprint)
    }

    /// Fresh entry for `description`, if any. Unreadable entries are deleted
    /// and reported as misses.
    pub fn load(&self, description: &str) -> Option<CacheEntry> {
        let fingerprint = Self::fingerprint(description);
        let path = self.entry_path(&fingerprint);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to read cache entry");
                return None;
            }
        };
        let Record(stored, payload, cached_at) = match serde_json::from_slice::<Record>(&bytes) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "deleting corrupt cache entry");
                if let Err(error) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), %error, "failed to delete corrupt cache entry");
                }
                return None;
            }
        };
        if stored != description {
            tracing::debug!(fingerprint = %fingerprint, "cache description mismatch");
            return None;
        }
        if is_stale(cached_at, self.expiry, Utc::now()) {
            tracing::debug!(fingerprint = %fingerprint, %cached_at, "cache entry expired");
            return None;
        }
        Some(CacheEntry {
            description: stored,
            payload,
            cached_at,
        })
    }

    /// Write an entry through a temporary file and an atomic rename.
    pub fn store(&self, description: &str, payload: &Value) -> Result<()> {
        self.store_at(description, payload, Utc::now())
    }

    fn store_at(&self, description: &str, payload: &Value, cached_at: DateTime<Utc>) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|error| {
            Error::Cache(format!("failed to create {}: {error}", self.dir.display()))
        })?;
        let fingerprint = Self::fingerprint(description);
        let record = Record(description.to_string(), payload.clone(), cached_at);
        let bytes = serde_json::to_vec(&record)
            .map_err(|error| Error::Cache(format!("failed to encode cache entry: {error}")))?;

        let target = self.entry_path(&fingerprint);
        let write_failed =
            |error: io::Error| Error::Cache(format!("failed to write {}: {error}", target.display()));
        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{fingerprint}."))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(write_failed)?;
        temp.write_all(&bytes).map_err(write_failed)?;
        temp.persist(&target)
            .map_err(|error| write_failed(error.error))?;
        tracing::debug!(fingerprint = %fingerprint, "stored cache entry");
        Ok(())
    }

    /// Submit through the cache: a fresh entry answers without any HTTP call.
    pub fn submit(&self, request: &mut Request<'_>) -> Result<Value> {
        request.prepare();
        let description = Self::description(
            request.site().identity(),
            &request.site().auth_class(),
            &request.encoded(),
        );
        if let Some(entry) = self.load(&description) {
            tracing::debug!(action = %request.action(), "cache hit");
            return Ok(entry.payload);
        }
        let document = request.submit()?;
        if let Err(error) = self.store(&description, &document) {
            tracing::warn!(%error, "failed to cache API response");
        }
        Ok(document)
    }

    /// Delete entries older than `max_age` and entries that cannot be parsed.
    pub fn purge(&self, max_age: Duration) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(report),
            Err(error) => {
                return Err(Error::Cache(format!(
                    "failed to list {}: {error}",
                    self.dir.display()
                )));
            }
        };
        let now = Utc::now();
        for entry in entries {
            let entry = entry.map_err(|error| Error::Cache(error.to_string()))?;
            let path = entry.path();
            if !path.is_file() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let record = fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Record>(&bytes).ok());
            let remove = match &record {
                None => {
                    report.corrupt += 1;
                    true
                }
                Some(Record(_, _, cached_at)) if is_stale(*cached_at, max_age, now) => {
                    report.expired += 1;
                    true
                }
                Some(_) => {
                    report.kept += 1;
                    false
                }
            };
            if remove {
                fs::remove_file(&path).map_err(|error| {
                    Error::Cache(format!("failed to delete {}: {error}", path.display()))
                })?;
            }
        }
        tracing::info!(
            kept = report.kept,
            expired = report.expired,
            corrupt = report.corrupt,
            "purged response cache"
        );
        Ok(report)
    }
}

fn is_stale(cached_at: DateTime<Utc>, expiry: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(expiry) {
        Ok(expiry) => cached_at
            .checked_add_signed(expiry)
            .is_some_and(|end| end < now),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    use super::{ResponseCache, is_stale};
    use crate::params::{ParameterSet, SiteEncoding};
    use crate::request::Request;
    use crate::site::{AuthClass, SiteIdentity};
    use crate::testing::{site_with, test_config};

    fn describe(params: &ParameterSet, auth: &AuthClass) -> String {
        ResponseCache::description(
            &SiteIdentity::new("wikipedia", "en"),
            auth,
            &params.encode(SiteEncoding::Utf8),
        )
    }

    #[test]
    fn round_trip_returns_same_payload() {
        let temp = tempdir().expect("tempdir");
        let cache = ResponseCache::new(temp.path(), Duration::from_secs(3600));
        let payload = json!({"query": {"pages": [{"title": "Ä", "size": 12.5}]}});
        let description = describe(
            &ParameterSet::from_pairs([("action", "query"), ("titles", "Ä")]),
            &AuthClass::Anonymous,
        );
        cache.store(&description, &payload).expect("store");

        let entry = cache.load(&description).expect("hit");
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.description, description);
        assert!(cache.dir().ends_with(format!("apicache-v{}", env!("CARGO_PKG_VERSION_MAJOR"))));
        let fingerprint = ResponseCache::fingerprint(&description);
        assert_eq!(fingerprint.len(), 64);
        assert!(cache.dir().join(&fingerprint).is_file());
    }

    #[test]
    fn stale_entries_are_misses_but_kept_on_disk() {
        let temp = tempdir().expect("tempdir");
        let cache = ResponseCache::new(temp.path(), Duration::from_secs(60));
        let description = "site=x\nauth=anonymous\naction=query";
        let old = Utc::now() - chrono::Duration::seconds(120);
        cache.store_at(description, &json!({"a": 1}), old).expect("store");

        assert!(cache.load(description).is_none());
        assert!(cache.dir().join(ResponseCache::fingerprint(description)).is_file());
    }

    #[test]
    fn concurrent_writers_of_one_entry_all_succeed() {
        let temp = tempdir().expect("tempdir");
        let cache = ResponseCache::new(temp.path(), Duration::from_secs(3600));
        let description = "site=x\nauth=anonymous\naction=query";

        for round in 0..50 {
            std::thread::scope(|scope| {
                let workers = (0..4)
                    .map(|worker| {
                        let cache = &cache;
                        scope.spawn(move || {
                            cache.store(description, &json!({"round": round, "worker": worker}))
                        })
                    })
                    .collect::<Vec<_>>();
                for worker in workers {
                    worker.join().expect("writer thread").expect("store");
                }
            });
            let entry = cache.load(description).expect("complete entry");
            assert_eq!(entry.payload["round"], json!(round));
        }

        let leftovers = fs::read_dir(cache.dir())
            .expect("cache dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn huge_expiry_never_goes_stale() {
        let cached_at = Utc::now();
        let forever = Duration::from_secs(1_000_000_000_000_000);
        assert!(chrono::Duration::from_std(forever).is_ok());
        assert!(!is_stale(cached_at, forever, Utc::now()));
        assert!(is_stale(
            cached_at - chrono::Duration::seconds(10),
            Duration::from_secs(5),
            cached_at
        ));
    }

    #[test]
    fn fingerprint_ignores_order_but_not_values_or_auth() {
        let left = ParameterSet::from_pairs([("action", "query"), ("list", "allpages")]);
        let right = ParameterSet::from_pairs([("list", "allpages"), ("action", "query")]);
        let other = ParameterSet::from_pairs([("action", "query"), ("list", "allusers")]);
        let anonymous = AuthClass::Anonymous;
        assert_eq!(
            ResponseCache::fingerprint(&describe(&left, &anonymous)),
            ResponseCache::fingerprint(&describe(&right, &anonymous))
        );
        assert_ne!(
            ResponseCache::fingerprint(&describe(&left, &anonymous)),
            ResponseCache::fingerprint(&describe(&other, &anonymous))
        );
        assert_ne!(
            describe(&left, &anonymous),
            describe(&left, &AuthClass::User("Bot".to_string()))
        );
        assert_ne!(
            describe(&left, &AuthClass::NotLoggedIn),
            describe(&left, &AuthClass::User("Bot".to_string()))
        );
    }

    #[test]
    fn corrupt_entry_is_deleted_and_missed() {
        let temp = tempdir().expect("tempdir");
        let cache = ResponseCache::new(temp.path(), Duration::from_secs(60));
        let description = "site=x\nauth=anonymous\naction=query";
        let path = cache.dir().join(ResponseCache::fingerprint(description));
        fs::create_dir_all(cache.dir()).expect("cache dir");
        fs::write(&path, b"{not json").expect("write corrupt entry");

        assert!(cache.load(description).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn mismatched_description_is_a_miss() {
        let temp = tempdir().expect("tempdir");
        let cache = ResponseCache::new(temp.path(), Duration::from_secs(60));
        let description = "site=x\nauth=anonymous\naction=query";
        let path = cache.dir().join(ResponseCache::fingerprint(description));
        fs::create_dir_all(cache.dir()).expect("cache dir");
        let record = json!(["site=y\nauth=anonymous\naction=query", {"a": 1}, Utc::now()]);
        fs::write(&path, record.to_string()).expect("write entry");

        assert!(cache.load(description).is_none());
        assert!(path.exists());
    }

    #[test]
    fn submit_serves_second_call_from_disk() {
        let temp = tempdir().expect("tempdir");
        let cache = ResponseCache::new(temp.path(), Duration::from_secs(3600));
        let (mut site, handle) = site_with(test_config());
        handle.push_json(json!({"query": {"general": {"sitename": "Example"}}}));

        let params = ParameterSet::from_pairs([("action", "query"), ("meta", "siteinfo")]);
        let first = {
            let mut request = Request::new(&mut site, params.clone()).expect("request");
            cache.submit(&mut request).expect("first submit")
        };
        let second = {
            let mut request = Request::new(&mut site, params).expect("request");
            cache.submit(&mut request).expect("cached submit")
        };
        assert_eq!(first, second);
        assert_eq!(handle.calls().len(), 1);
    }

    #[test]
    fn purge_removes_expired_and_corrupt_entries() {
        let temp = tempdir().expect("tempdir");
        let cache = ResponseCache::new(temp.path(), Duration::from_secs(3600));
        cache.store("fresh", &json!(1)).expect("fresh");
        cache
            .store_at("old", &json!(2), Utc::now() - chrono::Duration::hours(2))
            .expect("old");
        fs::write(cache.dir().join("garbage"), b"nope").expect("garbage");

        let report = cache.purge(Duration::from_secs(3600)).expect("purge");
        assert_eq!(report.kept, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(report.corrupt, 1);
        assert!(cache.load("fresh").is_some());

        let missing = ResponseCache::new(&temp.path().join("absent"), Duration::from_secs(1));
        assert_eq!(missing.purge(Duration::from_secs(1)).expect("empty"), Default::default());
    }
}
