use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::models::{CacheEntry, ProductRecord, Recipe, ReuseMode, StyleProfile, value_is_blank};

/// Coarse value shape used in the fingerprint. Deliberately rough: a price
/// column read as `"24.99"` and one read as `24.99` should fingerprint the
/// same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Numeric,
    List,
    Text,
}

impl FieldKind {
    fn tag(self) -> &'static str {
        match self {
            FieldKind::Numeric => "num",
            FieldKind::List => "list",
            FieldKind::Text => "text",
        }
    }
}

fn classify_field(records: &[ProductRecord], name: &str) -> FieldKind {
    let mut saw_any = false;
    let mut all_numeric = true;
    let mut all_lists = true;
    for record in records {
        let Some(value) = record.fields.get(name) else {
            continue;
        };
        if value_is_blank(value) {
            continue;
        }
        saw_any = true;
        let numeric = match value {
            serde_json::Value::Number(_) => true,
            serde_json::Value::String(text) => text.trim().parse::<f64>().is_ok(),
            _ => false,
        };
        all_numeric &= numeric;
        all_lists &= value.is_array();
    }
    if !saw_any {
        FieldKind::Text
    } else if all_lists {
        FieldKind::List
    } else if all_numeric {
        FieldKind::Numeric
    } else {
        FieldKind::Text
    }
}

/// Structural fingerprint of an upload: sorted, case-normalized field names
/// with coarse type tags. Depends only on shape, never on values, so two
/// uploads of the same spreadsheet layout collide on purpose.
pub fn fingerprint(records: &[ProductRecord]) -> String {
    let mut fields: BTreeMap<String, FieldKind> = BTreeMap::new();
    for record in records {
        for name in record.fields.keys() {
            let normalized = name.trim().to_lowercase();
            fields
                .entry(normalized)
                .or_insert_with(|| classify_field(records, name));
        }
    }

    let canonical = fields
        .iter()
        .map(|(name, kind)| format!("{name}:{}", kind.tag()))
        .collect::<Vec<_>>()
        .join("|");

    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hex[..16].to_string()
}

pub fn fingerprint_fields(records: &[ProductRecord]) -> Vec<String> {
    let mut fields: Vec<String> = records
        .iter()
        .flat_map(|record| record.fields.keys())
        .map(|name| name.trim().to_lowercase())
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

/// Pipeline cache keyed by fingerprint. Redis when configured, otherwise an
/// in-process map; redis failures degrade to a miss rather than an error.
#[derive(Clone)]
pub struct CacheStore {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

const REDIS_KEY_PREFIX: &str = "listwright:cache:";

impl CacheStore {
    pub fn in_memory() -> Self {
        Self {
            redis: None,
            local: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok());
        if redis.is_some() {
            tracing::info!(target = "listwright.cache", "pipeline cache backed by redis");
        }
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn lookup(&self, fingerprint: &str) -> Option<CacheEntry> {
        if let Some(client) = &self.redis
            && let Some(entry) = redis_get(client, fingerprint).await
        {
            return Some(entry);
        }
        self.local.lock().await.get(fingerprint).cloned()
    }

    pub async fn store(&self, entry: CacheEntry) {
        if let Some(client) = &self.redis {
            redis_set(client, &entry).await;
        }
        self.local
            .lock()
            .await
            .insert(entry.fingerprint.clone(), entry);
    }
}

async fn redis_get(client: &redis::Client, fingerprint: &str) -> Option<CacheEntry> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(conn) => conn,
        Err(_) => return None,
    };
    let raw: Option<String> = conn.get(format!("{REDIS_KEY_PREFIX}{fingerprint}")).await.ok();
    raw.and_then(|value| serde_json::from_str(&value).ok())
}

async fn redis_set(client: &redis::Client, entry: &CacheEntry) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(entry)
    {
        let _: Result<(), _> = conn
            .set(format!("{REDIS_KEY_PREFIX}{}", entry.fingerprint), json)
            .await;
    }
}

/// Artifacts a cache hit contributes to a new job under a given mode.
#[derive(Debug, Clone, Default)]
pub struct ReusedArtifacts {
    pub style_profile: Option<StyleProfile>,
    pub recipe: Option<Recipe>,
}

/// Apply a cache entry. `FullReuse` hands back the stored profile and an
/// already-approved recipe so the new job can go straight to batch; the
/// other modes reuse nothing from the entry itself (the hit still told the
/// caller the upload shape is known).
pub fn apply_entry(entry: &CacheEntry, mode: ReuseMode) -> ReusedArtifacts {
    match mode {
        ReuseMode::FullReuse => {
            let mut recipe = entry.recipe.clone();
            recipe.approved = true;
            ReusedArtifacts {
                style_profile: Some(entry.style_profile.clone()),
                recipe: Some(recipe),
            }
        }
        ReuseMode::AdjustStyle | ReuseMode::Fresh => ReusedArtifacts::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(id: &str, fields: &[(&str, serde_json::Value)]) -> ProductRecord {
        let mut record = ProductRecord::new(id);
        for (name, value) in fields {
            record.fields.insert((*name).to_string(), value.clone());
        }
        record
    }

    fn entry(fp: &str) -> CacheEntry {
        CacheEntry {
            fingerprint: fp.to_string(),
            fields: vec!["name".into(), "price".into()],
            product_count: 12,
            platform: "etsy".into(),
            style_profile: StyleProfile::default(),
            recipe: Recipe::fallback_draft(),
            created_at: Utc::now(),
            source_job_id: "job-1".into(),
        }
    }

    #[test]
    fn fingerprint_ignores_field_order_and_case() {
        let a = vec![record(
            "p1",
            &[("Name", json!("Mug")), ("Price", json!(24.0))],
        )];
        let b = vec![record(
            "p9",
            &[("price", json!("99.5")), ("name", json!("Tray"))],
        )];
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_with_shape() {
        let a = vec![record("p1", &[("name", json!("Mug"))])];
        let b = vec![record("p1", &[("name", json!("Mug")), ("color", json!("red"))])];
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 16);
    }

    #[test]
    fn fingerprint_distinguishes_value_shapes() {
        let numeric = vec![record("p1", &[("price", json!("24.99"))])];
        let textual = vec![record("p1", &[("price", json!("ask in store"))])];
        let listy = vec![record("p1", &[("price", json!(["24.99"]))])];
        assert_ne!(fingerprint(&numeric), fingerprint(&textual));
        assert_ne!(fingerprint(&numeric), fingerprint(&listy));
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = CacheStore::in_memory();
        assert!(store.lookup("abc").await.is_none());
        store.store(entry("abc")).await;
        let hit = store.lookup("abc").await.unwrap();
        assert_eq!(hit.product_count, 12);
    }

    #[test]
    fn full_reuse_yields_an_approved_recipe() {
        let entry = entry("abc");
        assert!(!entry.recipe.approved);
        let reused = apply_entry(&entry, ReuseMode::FullReuse);
        assert!(reused.recipe.unwrap().approved);
        assert!(reused.style_profile.is_some());
    }

    #[test]
    fn other_modes_reuse_nothing() {
        let entry = entry("abc");
        assert!(apply_entry(&entry, ReuseMode::AdjustStyle).recipe.is_none());
        assert!(apply_entry(&entry, ReuseMode::Fresh).style_profile.is_none());
    }
}
