//! Cross-region inference profile resolution
//!
//! Maps a plain model id to a system-defined inference profile (`global.` or a
//! regional prefix such as `us.`) so requests route across regions. Lookups are
//! cached on disk for an hour, keyed by `region:model-id`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config;
use crate::error::BodsError;
use crate::models::ModelId;

pub const CACHE_FILE: &str = "cache.db";
pub const CACHE_TTL_SECS: i64 = 60 * 60;

/// Source of system-defined inference profile ids
#[async_trait]
pub trait ProfileLister: Send + Sync {
    async fn list_profiles(&self) -> Result<Vec<String>, BodsError>;
}

// ═══════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    profile_id: String,
    expires_at: DateTime<Utc>,
}

/// TTL key-value store backed by one JSON file
#[derive(Debug, Clone)]
pub struct ProfileCache {
    path: PathBuf,
    ttl: Duration,
}

impl ProfileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ttl: Duration::seconds(CACHE_TTL_SECS),
        }
    }

    /// `<cache dir>/bods/cache.db`
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(config::cache_dir()?.join(CACHE_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(region: &str, model: &ModelId) -> String {
        format!("{}:{}", region, model.as_str())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .load()?
            .entries
            .remove(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.profile_id))
    }

    pub fn put(&self, key: &str, profile_id: &str) -> Result<()> {
        self.put_at(key, profile_id, Utc::now())
    }

    /// Insert and drop expired entries, replacing the file atomically
    pub fn put_at(&self, key: &str, profile_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut cache = self.load().unwrap_or_else(|e| {
            tracing::warn!("discarding unreadable profile cache: {:#}", e);
            CacheFile::default()
        });
        cache.entries.retain(|_, entry| entry.expires_at > now);
        cache.entries.insert(
            key.to_string(),
            CacheEntry {
                profile_id: profile_id.to_string(),
                expires_at: now + self.ttl,
            },
        );

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("db.tmp");
        let content = serde_json::to_string_pretty(&cache)?;
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn load(&self) -> Result<CacheFile> {
        if !self.path.exists() {
            return Ok(CacheFile::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", self.path.display()))
    }
}

// ═══════════════════════════════════════════════════════════════
// RESOLVER
// ═══════════════════════════════════════════════════════════════

pub struct ProfileResolver<'a, L: ProfileLister> {
    lister: &'a L,
    cache: Option<ProfileCache>,
}

impl<'a, L: ProfileLister> ProfileResolver<'a, L> {
    pub fn new(lister: &'a L, cache: Option<ProfileCache>) -> Self {
        Self { lister, cache }
    }

    /// Profile id for `model` in `region`; any failure yields `model` unchanged
    pub async fn resolve(&self, model: &ModelId, region: &str) -> ModelId {
        if model.has_profile_prefix() {
            return model.clone();
        }
        match self.lookup(model, region).await {
            Ok(Some(profile)) => {
                tracing::info!("using inference profile {} for {}", profile, model);
                ModelId::new(profile)
            }
            Ok(None) => {
                tracing::info!("no inference profile for {} in {}", model, region);
                model.clone()
            }
            Err(e) => {
                tracing::warn!("inference profile lookup failed: {:#}", e);
                model.clone()
            }
        }
    }

    async fn lookup(&self, model: &ModelId, region: &str) -> Result<Option<String>> {
        let key = ProfileCache::key(region, model);
        if let Some(cache) = &self.cache {
            match cache.get(&key) {
                Ok(Some(hit)) => {
                    tracing::debug!("profile cache hit {} -> {}", key, hit);
                    return Ok(Some(hit));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("profile cache read failed: {:#}", e),
            }
        }

        let profiles = self.lister.list_profiles().await?;
        let Some(profile) = select_profile(&profiles, model.as_str()) else {
            return Ok(None);
        };

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(&key, profile) {
                tracing::warn!("profile cache write failed: {:#}", e);
            }
        }
        Ok(Some(profile.to_string()))
    }
}

/// Profiles whose id after the first `.` is `model_id`; `global.` wins over regional
pub fn select_profile<'p>(profiles: &'p [String], model_id: &str) -> Option<&'p str> {
    let mut regional = None;
    for id in profiles {
        let Some((prefix, rest)) = id.split_once('.') else {
            continue;
        };
        if rest != model_id {
            continue;
        }
        if prefix == "global" {
            return Some(id);
        }
        regional.get_or_insert(id.as_str());
    }
    regional
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeLister {
        profiles: Vec<String>,
        calls: AtomicUsize,
    }

    impl FakeLister {
        fn new(profiles: &[&str]) -> Self {
            Self {
                profiles: profiles.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProfileLister for FakeLister {
        async fn list_profiles(&self) -> Result<Vec<String>, BodsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.profiles.clone())
        }
    }

    struct FailingLister;

    #[async_trait]
    impl ProfileLister for FailingLister {
        async fn list_profiles(&self) -> Result<Vec<String>, BodsError> {
            Err(BodsError::transport("API error 403 Forbidden: AccessDeniedException"))
        }
    }

    const SONNET: &str = "anthropic.claude-3-7-sonnet-20250219-v1:0";

    #[test]
    fn test_select_prefers_global() {
        let profiles = vec![
            format!("us.{}", SONNET),
            format!("global.{}", SONNET),
            "eu.anthropic.claude-3-haiku-20240307-v1:0".to_string(),
        ];
        assert_eq!(select_profile(&profiles, SONNET), Some(format!("global.{}", SONNET).as_str()));
        assert_eq!(select_profile(&profiles[..1], SONNET), Some(profiles[0].as_str()));
        assert_eq!(select_profile(&profiles, "anthropic.claude-v2"), None);
    }

    #[test]
    fn test_cache_expiry() {
        let dir = TempDir::new().unwrap();
        let cache = ProfileCache::new(dir.path().join("bods/cache.db"));
        let now = Utc::now();

        cache.put_at("us-east-1:m", "us.m", now).unwrap();
        assert_eq!(cache.get_at("us-east-1:m", now).unwrap().as_deref(), Some("us.m"));
        assert_eq!(
            cache.get_at("us-east-1:m", now + Duration::seconds(CACHE_TTL_SECS - 1)).unwrap().as_deref(),
            Some("us.m")
        );
        assert_eq!(cache.get_at("us-east-1:m", now + Duration::seconds(CACHE_TTL_SECS + 1)).unwrap(), None);
        assert_eq!(cache.get_at("eu-west-1:m", now).unwrap(), None);
        assert!(!dir.path().join("bods/cache.db.tmp").exists());
    }

    #[tokio::test]
    async fn test_prefixed_id_short_circuits() {
        let lister = FakeLister::new(&[]);
        let resolver = ProfileResolver::new(&lister, None);
        for id in [format!("us.{}", SONNET), format!("global.{}", SONNET)] {
            let model = ModelId::new(id.clone());
            assert_eq!(resolver.resolve(&model, "us-east-1").await, model);
        }
        assert_eq!(lister.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_uses_cache_after_first_lookup() {
        let dir = TempDir::new().unwrap();
        let cache = ProfileCache::new(dir.path().join("cache.db"));
        let lister = FakeLister::new(&["us.anthropic.claude-3-7-sonnet-20250219-v1:0"]);
        let resolver = ProfileResolver::new(&lister, Some(cache.clone()));
        let model = ModelId::new(SONNET);

        let first = resolver.resolve(&model, "us-east-1").await;
        let second = resolver.resolve(&model, "us-east-1").await;
        assert_eq!(first.as_str(), "us.anthropic.claude-3-7-sonnet-20250219-v1:0");
        assert_eq!(first, second);
        assert_eq!(lister.calls.load(Ordering::SeqCst), 1);
        assert!(cache.get(&format!("us-east-1:{}", SONNET)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_model() {
        let resolver = ProfileResolver::new(&FailingLister, None);
        let model = ModelId::new(SONNET);
        assert_eq!(resolver.resolve(&model, "us-east-1").await, model);

        let lister = FakeLister::new(&["us.anthropic.claude-v2"]);
        let resolver = ProfileResolver::new(&lister, None);
        assert_eq!(resolver.resolve(&model, "us-east-1").await, model);
    }

    #[test]
    fn test_corrupt_cache_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        std::fs::write(&path, "{ not json").unwrap();
        let cache = ProfileCache::new(&path);

        assert!(cache.get("k").is_err());
        cache.put("k", "v").unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v"));
    }
}
