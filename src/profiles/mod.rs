use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{LinkBotError, Result};

/// Selector overrides for one retail domain.
///
/// Each field lists CSS selectors tried in order; the first element with a
/// `content` attribute or non-empty text wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    pub title: Vec<String>,
    pub original_price: Vec<String>,
    pub sale_price: Vec<String>,
    pub currency: Option<String>,
}

/// Immutable domain -> profile lookup, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct SiteProfileStore {
    profiles: HashMap<String, SiteProfile>,
}

impl SiteProfileStore {
    pub fn new(profiles: HashMap<String, SiteProfile>) -> Self {
        let profiles = profiles
            .into_iter()
            .map(|(domain, profile)| (normalize_domain(&domain), profile))
            .collect();
        Self { profiles }
    }

    /// Loads a JSON object keyed by domain. A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Site profile file {:?} not found, using heuristics only", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| LinkBotError::ConfigError(format!("Failed to read site profiles {:?}: {}", path, e)))?;
        let store = Self::from_json(&content)?;
        info!("Loaded {} site profiles from {:?}", store.len(), path);
        Ok(store)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let profiles: HashMap<String, SiteProfile> = serde_json::from_str(content)
            .map_err(|e| LinkBotError::ConfigError(format!("Malformed site profiles: {}", e)))?;
        Ok(Self::new(profiles))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Finds the profile for a URL's host, falling back to parent domains.
    pub fn lookup(&self, url: &Url) -> Option<&SiteProfile> {
        let host = normalize_domain(url.host_str()?);
        let mut candidate = host.as_str();
        loop {
            if let Some(profile) = self.profiles.get(candidate) {
                debug!("Site profile '{}' matched host {}", candidate, host);
                return Some(profile);
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent,
                _ => return None,
            }
        }
    }
}

fn normalize_domain(domain: &str) -> String {
    let lowered = domain.trim().trim_end_matches('.').to_lowercase();
    match lowered.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => lowered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PROFILES: &str = r#"{
        "WWW.Example.com": {
            "title": ["h1.product-title"],
            "sale_price": [".price-now", "meta[itemprop=price]"],
            "currency": "USD"
        },
        "shop.test": { "title": ["h1"] }
    }"#;

    #[test]
    fn test_lookup_normalizes_host_and_walks_parents() {
        let store = SiteProfileStore::from_json(PROFILES).unwrap();
        assert_eq!(store.len(), 2);

        let direct = Url::parse("https://www.example.com/item/1").unwrap();
        let profile = store.lookup(&direct).unwrap();
        assert_eq!(profile.sale_price.len(), 2);
        assert!(profile.original_price.is_empty());
        assert_eq!(profile.currency.as_deref(), Some("USD"));

        let nested = Url::parse("https://deals.EXAMPLE.com/item/1").unwrap();
        assert!(store.lookup(&nested).is_some());

        let other = Url::parse("https://example.org/item/1").unwrap();
        assert!(store.lookup(&other).is_none());
    }

    #[test]
    fn test_lookup_never_matches_bare_tld() {
        let mut profiles = HashMap::new();
        profiles.insert("com".to_string(), SiteProfile::default());
        let store = SiteProfileStore::new(profiles);
        assert!(store.lookup(&Url::parse("https://example.com/").unwrap()).is_none());
    }

    #[test]
    fn test_missing_file_is_empty_and_malformed_is_config_error() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("profiles.json");
        assert!(SiteProfileStore::load(&missing).unwrap().is_empty());

        fs::write(&missing, "{ not json").unwrap();
        assert!(matches!(
            SiteProfileStore::load(&missing),
            Err(LinkBotError::ConfigError(_))
        ));
    }
}
