use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One catalog item as produced by discovery extraction.
///
/// Only `id`, `image_files`, and `source` are guaranteed; every other field is
/// discovered per upload and carried in the flattened `fields` map (sku, name,
/// material, price, ...). Records are immutable once the data model is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    #[serde(default)]
    pub image_files: Vec<String>,
    #[serde(default)]
    pub source: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

const NAME_FIELDS: &[&str] = &["name", "item", "title", "product_name", "product", "sku"];

impl ProductRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image_files: Vec::new(),
            source: String::new(),
            fields: Map::new(),
        }
    }

    /// Best-effort display name from whatever field the upload happened to use.
    pub fn display_name(&self) -> &str {
        for field in NAME_FIELDS {
            if let Some(Value::String(value)) = self.fields.get(*field)
                && !value.trim().is_empty()
            {
                return value;
            }
        }
        &self.id
    }

    pub fn category(&self) -> Option<&str> {
        match self.fields.get("category") {
            Some(Value::String(value)) if !value.trim().is_empty() => Some(value),
            _ => None,
        }
    }

    /// Count of meaningfully filled fields, used for diverse sample selection.
    pub fn richness(&self) -> usize {
        let filled = self
            .fields
            .values()
            .filter(|value| !value_is_blank(value))
            .count();
        filled + usize::from(!self.image_files.is_empty())
    }
}

pub fn value_is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => {
            let trimmed = text.trim();
            trimmed.is_empty() || trimmed == "N/A" || trimmed == "None"
        }
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// The discovery phase output: every record plus the discovered field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataModel {
    pub products: Vec<ProductRecord>,
    pub fields_discovered: Vec<String>,
    #[serde(default)]
    pub extraction_attempts: u32,
}

/// Seller voice and platform preferences captured during the style interview
/// (the interview itself lives outside this service; the core only consumes
/// the resulting profile).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StyleProfile {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub seller_type: String,
    #[serde(default)]
    pub target_buyer: String,
    #[serde(default)]
    pub brand_voice: String,
    #[serde(default)]
    pub description_structure: String,
    #[serde(default)]
    pub avg_description_length: String,
    #[serde(default)]
    pub pricing_strategy: String,
    #[serde(default)]
    pub tags_style: String,
    #[serde(default)]
    pub title_format: String,
    #[serde(default)]
    pub always_mention: Vec<String>,
}

impl StyleProfile {
    /// One-line summary used in prompt templates.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.brand_voice.is_empty() {
            parts.push(format!("Voice: {}", self.brand_voice));
        }
        if !self.seller_type.is_empty() {
            parts.push(format!("Seller type: {}", self.seller_type));
        }
        if !self.target_buyer.is_empty() {
            parts.push(format!("Target buyer: {}", self.target_buyer));
        }
        if parts.is_empty() {
            "No style profile provided".to_string()
        } else {
            parts.join(". ")
        }
    }

    pub fn always_mention_block(&self) -> String {
        if self.always_mention.is_empty() {
            "None".to_string()
        } else {
            self.always_mention
                .iter()
                .map(|item| format!("- {item}"))
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

/// The generation recipe: prompt template, output schema, and validation code.
///
/// Recipes are replaced wholesale (never mutated in place); the version bumps
/// on every refine. Only an approved recipe may be applied in batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub version: u32,
    pub prompt_template: String,
    pub output_schema: Value,
    pub validation_code: String,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes_made: Option<String>,
}

/// Verdict of a single model-judged quality criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub name: String,
    pub pass: bool,
    pub rationale: String,
}

/// Combined report from code-based checks and the judge criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub score: u8,
    pub passed: bool,
    pub code_issues: Vec<String>,
    pub judge_criteria: Vec<JudgeVerdict>,
    /// Set when a judge verdict could not be obtained and the criterion was
    /// conservatively counted as failed.
    #[serde(default)]
    pub degraded: bool,
}

const CODE_ISSUE_PENALTY: u32 = 15;
const JUDGE_FAIL_PENALTY: u32 = 12;

impl ValidationReport {
    /// `max(0, 100 - 15*code_issues - 12*failed_criteria)`.
    pub fn score_for(code_issues: usize, failed_criteria: usize) -> u8 {
        let penalty =
            CODE_ISSUE_PENALTY * code_issues as u32 + JUDGE_FAIL_PENALTY * failed_criteria as u32;
        100u32.saturating_sub(penalty) as u8
    }

    pub fn failed_criteria(&self) -> impl Iterator<Item = &JudgeVerdict> {
        self.judge_criteria.iter().filter(|verdict| !verdict.pass)
    }

    /// Itemized issue lines fed back to the model during refine and batch retry.
    pub fn issue_lines(&self) -> Vec<String> {
        let mut lines = self.code_issues.clone();
        for verdict in self.failed_criteria() {
            let rationale: String = verdict.rationale.chars().take(160).collect();
            lines.push(format!("[{}] {rationale}", verdict.name));
        }
        lines
    }
}

/// A code issue that blocks a pass outright regardless of score, e.g. a
/// missing required output field or a broken validation function.
pub fn issue_is_critical(issue: &str) -> bool {
    let lower = issue.to_lowercase();
    lower.starts_with("critical:") || lower.contains("missing required field")
}

/// Outcome of testing the recipe on one sample item during auto-refine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub product_id: String,
    pub product_name: String,
    pub listing: Option<Value>,
    pub validation: ValidationReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Ok,
    Retrying,
    Failed,
}

/// Per-item outcome of a batch run. Terminal states are `Ok` and `Failed`;
/// `Retrying` only ever appears on progress events, never in stored results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub product_id: String,
    pub status: BatchItemStatus,
    pub attempt_count: u32,
    pub escalation_tier: crate::llm::Effort,
    pub listing: Option<Value>,
    pub score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub job_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retried: usize,
    pub avg_score: f64,
    pub elapsed_seconds: f64,
    pub completed_at: DateTime<Utc>,
}

/// Cached artifacts keyed by the structural fingerprint of an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub fields: Vec<String>,
    pub product_count: usize,
    pub platform: String,
    pub style_profile: StyleProfile,
    pub recipe: Recipe,
    pub created_at: DateTime<Utc>,
    pub source_job_id: String,
}

/// How a returning upload wants to use a cache hit. The mode is always a
/// caller decision; the cache itself never infers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReuseMode {
    FullReuse,
    AdjustStyle,
    Fresh,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn score_formula_penalizes_code_and_judge_failures() {
        assert_eq!(ValidationReport::score_for(0, 0), 100);
        assert_eq!(ValidationReport::score_for(1, 1), 73);
        assert_eq!(ValidationReport::score_for(2, 0), 70);
        assert_eq!(ValidationReport::score_for(0, 5), 40);
        // clamps at zero
        assert_eq!(ValidationReport::score_for(10, 5), 0);
    }

    #[test]
    fn critical_issue_detection() {
        assert!(issue_is_critical("critical: missing title"));
        assert!(issue_is_critical("Missing required field `tags`"));
        assert!(!issue_is_critical("Description too short (12 words)"));
    }

    #[test]
    fn record_display_name_falls_back_to_id() {
        let mut record = ProductRecord::new("product_007");
        assert_eq!(record.display_name(), "product_007");
        record
            .fields
            .insert("name".into(), json!("Copper Mule Mug"));
        assert_eq!(record.display_name(), "Copper Mule Mug");
    }

    #[test]
    fn record_richness_counts_filled_fields_and_images() {
        let mut record = ProductRecord::new("p1");
        record.fields.insert("name".into(), json!("Mug"));
        record.fields.insert("notes".into(), json!(""));
        record.fields.insert("price".into(), json!(24.5));
        assert_eq!(record.richness(), 2);
        record.image_files.push("mug.jpg".into());
        assert_eq!(record.richness(), 3);
    }

    #[test]
    fn record_round_trips_dynamic_fields() {
        let raw = json!({
            "id": "p9",
            "image_files": ["a.jpg"],
            "source": "spreadsheet_row_9",
            "material": "oak",
            "price": 39.0,
        });
        let record: ProductRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.fields["material"], json!("oak"));
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["price"], json!(39.0));
    }
}
