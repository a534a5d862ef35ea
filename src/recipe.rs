use std::collections::BTreeMap;

use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::models::{ProductRecord, Recipe, StyleProfile, TestResult, value_is_blank};

/// Listing shape requested from the model when a draft does not supply its
/// own schema.
pub fn default_output_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": { "type": "string" },
            "description": { "type": "string" },
            "tags": { "type": "array", "items": { "type": "string" } },
            "category_suggestion": { "type": "string" },
            "suggested_price": { "type": "number" },
            "pricing_rationale": { "type": "string" },
            "seo_keywords": { "type": "array", "items": { "type": "string" } },
            "confidence": { "type": "string", "enum": ["high", "medium", "low"] },
            "notes_for_seller": { "type": "string" }
        },
        "required": ["title", "description", "tags", "suggested_price", "confidence"]
    })
}

/// Structural checks applied when a draft does not supply validation code.
/// Issues prefixed with `critical:` block approval regardless of score.
pub const DEFAULT_VALIDATION_CODE: &str = r#"
fn validate_listing(listing, product) {
    let issues = [];

    let title = listing.title;
    if title == () || title == "" {
        issues.push("critical: missing required field title");
    } else {
        if title.len() > 140 { issues.push("Title exceeds 140 characters"); }
        if title.len() < 10 { issues.push("Title is shorter than 10 characters"); }
    }

    let description = listing.description;
    if description == () || description == "" {
        issues.push("critical: missing required field description");
    } else {
        let words = description.split(" ").len();
        if words < 50 { issues.push("Description is under 50 words"); }
        if words > 400 { issues.push("Description is over 400 words"); }
    }

    let tags = listing.tags;
    if tags == () {
        issues.push("critical: missing required field tags");
    } else if tags.len() < 5 {
        issues.push("Fewer than 5 tags");
    }

    let price = listing.suggested_price;
    if price == () {
        issues.push("critical: missing required field suggested_price");
    } else if price <= 0 {
        issues.push("Suggested price must be positive");
    }

    issues
}
"#;

pub fn default_prompt_template() -> String {
    [
        "You are writing a marketplace listing for {platform}.",
        "Seller style: {style_summary}",
        "Title format: {title_format}",
        "Description structure: {description_structure}",
        "Target length: {avg_description_length}",
        "Pricing strategy: {pricing_strategy}",
        "Tag style: {tags_style}",
        "Always mention:\n{always_mention}",
        "",
        "Product ({product_id}):",
        "{product_json}",
        "",
        "Write the listing as JSON matching the output schema. Ground every \
         claim in the product data; never invent measurements or materials.",
    ]
    .join("\n")
}

impl Recipe {
    /// Version-1 recipe built entirely from defaults, used when drafting
    /// fails or produces unparseable output.
    pub fn fallback_draft() -> Self {
        Self {
            version: 1,
            prompt_template: default_prompt_template(),
            output_schema: default_output_schema(),
            validation_code: DEFAULT_VALIDATION_CODE.to_string(),
            approved: false,
            changes_made: None,
        }
    }
}

/// What the model returns when asked to draft or revise a recipe.
#[derive(Debug, Deserialize)]
pub struct RecipeDraft {
    pub prompt_template: String,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub validation_code: Option<String>,
    #[serde(default)]
    pub changes_made: Option<String>,
}

impl RecipeDraft {
    pub fn into_recipe(self, version: u32) -> Recipe {
        Recipe {
            version,
            prompt_template: self.prompt_template,
            output_schema: self.output_schema.unwrap_or_else(default_output_schema),
            validation_code: self
                .validation_code
                .filter(|code| !code.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_VALIDATION_CODE.to_string()),
            approved: false,
            changes_made: self.changes_made,
        }
    }
}

/// Drop a single surrounding markdown fence, tolerating a language tag and
/// missing closer.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Lenient parse of a draft/revision reply: fenced JSON first, then the
/// outermost brace span for replies with surrounding prose.
pub fn parse_recipe_response(text: &str) -> Option<RecipeDraft> {
    let stripped = strip_code_fences(text);
    if let Ok(draft) = serde_json::from_str(stripped) {
        return Some(draft);
    }
    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if start >= end {
        return None;
    }
    serde_json::from_str(&stripped[start..=end]).ok()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "N/A".to_string(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Substitute `{placeholder}` slots with style settings and product fields.
/// Unknown placeholders are left in place so they show up in test listings
/// instead of silently vanishing.
pub fn fill_template(template: &str, product: &ProductRecord, style: &StyleProfile) -> String {
    let product_json = serde_json::to_string_pretty(&Value::Object(product.fields.clone()))
        .unwrap_or_else(|_| "{}".to_string());

    let mut pairs: Vec<(String, String)> = vec![
        ("product_id".into(), product.id.clone()),
        ("product_name".into(), product.display_name().to_string()),
        ("product_json".into(), product_json),
        ("image_count".into(), product.image_files.len().to_string()),
        ("style_summary".into(), style.summary()),
        ("platform".into(), style.platform.clone()),
        ("brand_voice".into(), style.brand_voice.clone()),
        ("title_format".into(), style.title_format.clone()),
        (
            "description_structure".into(),
            style.description_structure.clone(),
        ),
        (
            "avg_description_length".into(),
            style.avg_description_length.clone(),
        ),
        ("pricing_strategy".into(), style.pricing_strategy.clone()),
        ("tags_style".into(), style.tags_style.clone()),
        ("target_buyer".into(), style.target_buyer.clone()),
        ("always_mention".into(), style.always_mention_block()),
    ];
    for (name, value) in &product.fields {
        pairs.push((name.clone(), render_value(value)));
    }

    let mut out = template.to_string();
    for (key, value) in pairs {
        out = out.replace(&format!("{{{key}}}"), &value);
    }
    out
}

/// Per-field summary across all records, given to the model while drafting
/// so the template only references fields that actually exist.
pub fn field_stats(records: &[ProductRecord]) -> Value {
    let mut stats: BTreeMap<&str, (usize, Vec<String>)> = BTreeMap::new();
    for record in records {
        for (name, value) in &record.fields {
            let entry = stats.entry(name.as_str()).or_default();
            if !value_is_blank(value) {
                entry.0 += 1;
                let rendered: String = render_value(value).chars().take(48).collect();
                if entry.1.len() < 3 && !entry.1.contains(&rendered) {
                    entry.1.push(rendered);
                }
            }
        }
    }

    let total = records.len().max(1);
    let mut out = Map::new();
    for (name, (filled, samples)) in stats {
        out.insert(
            name.to_string(),
            json!({
                "fill_rate": (filled as f64 / total as f64 * 100.0).round() / 100.0,
                "samples": samples,
            }),
        );
    }
    Value::Object(out)
}

/// Pick up to `count` test samples covering the extremes of the upload: the
/// richest record, the sparsest, one from a different category, then random
/// fill. Testing only on lookalike records hides template weaknesses.
pub fn select_diverse_samples<R: Rng>(
    records: &[ProductRecord],
    count: usize,
    rng: &mut R,
) -> Vec<ProductRecord> {
    if records.len() <= count {
        return records.to_vec();
    }

    let mut chosen: Vec<usize> = Vec::with_capacity(count);
    let mut push = |idx: usize, chosen: &mut Vec<usize>| {
        if !chosen.contains(&idx) {
            chosen.push(idx);
        }
    };

    if let Some(richest) = (0..records.len()).max_by_key(|&i| records[i].richness()) {
        push(richest, &mut chosen);
        let anchor_category = records[richest].category().map(str::to_string);

        if let Some(sparsest) = (0..records.len()).min_by_key(|&i| records[i].richness()) {
            push(sparsest, &mut chosen);
        }
        if let Some(different) = (0..records.len())
            .find(|&i| records[i].category().map(str::to_string) != anchor_category)
        {
            push(different, &mut chosen);
        }
    }

    let mut remaining: Vec<usize> = (0..records.len())
        .filter(|idx| !chosen.contains(idx))
        .collect();
    while chosen.len() < count && !remaining.is_empty() {
        let pick = rng.random_range(0..remaining.len());
        chosen.push(remaining.swap_remove(pick));
    }
    chosen.truncate(count);
    chosen.into_iter().map(|idx| records[idx].clone()).collect()
}

/// Turn failed test results into the corrective feedback block for the next
/// refine round.
pub fn build_auto_feedback(results: &[TestResult]) -> String {
    let failed: Vec<&TestResult> = results.iter().filter(|r| !r.validation.passed).collect();
    if failed.is_empty() {
        return "All test listings passed validation.".to_string();
    }

    let mut lines = vec![format!(
        "{} of {} test listings failed validation:",
        failed.len(),
        results.len()
    )];
    for result in &failed {
        lines.push(format!(
            "- {} (score {}):",
            result.product_name, result.validation.score
        ));
        for issue in result.validation.issue_lines() {
            lines.push(format!("  * {issue}"));
        }
    }
    lines.join("\n")
}

const DRAFT_REPLY_SHAPE: &str = "Reply with a single JSON object: \
{\"prompt_template\": string, \"output_schema\": JSON schema object, \
\"validation_code\": string, \"changes_made\": string}. \
validation_code must be a Rhai script defining \
`fn validate_listing(listing, product)` that returns an array of issue \
strings (empty when the listing is fine). Prefix blocking issues with \
\"critical:\". The script has no file, network, or import access.";

pub fn draft_prompt(style: &StyleProfile, records: &[ProductRecord]) -> String {
    let stats = serde_json::to_string_pretty(&field_stats(records))
        .unwrap_or_else(|_| "{}".to_string());
    let samples: Vec<&ProductRecord> = records.iter().take(2).collect();
    let samples_json =
        serde_json::to_string_pretty(&samples).unwrap_or_else(|_| "[]".to_string());
    format!(
        "Design a listing-generation recipe for a {platform} seller.\n\
         Seller style: {summary}\n\
         Title format: {title}\nDescription structure: {structure}\n\
         Pricing strategy: {pricing}\nTags: {tags}\n\
         Always mention:\n{mention}\n\n\
         Field statistics across {count} products:\n{stats}\n\n\
         Sample products:\n{samples}\n\n\
         The prompt_template may use {{placeholder}} slots for any field \
         above plus {{product_json}}, {{product_id}}, {{product_name}}, and \
         the style settings. {shape}",
        platform = style.platform,
        summary = style.summary(),
        title = style.title_format,
        structure = style.description_structure,
        pricing = style.pricing_strategy,
        tags = style.tags_style,
        mention = style.always_mention_block(),
        count = records.len(),
        stats = stats,
        samples = samples_json,
        shape = DRAFT_REPLY_SHAPE,
    )
}

pub fn refine_prompt(recipe: &Recipe, style: &StyleProfile, feedback: &str) -> String {
    format!(
        "Revise this listing-generation recipe (version {version}) for a \
         {platform} seller.\n\nCurrent prompt template:\n{template}\n\n\
         Current validation code:\n{code}\n\n\
         Test feedback:\n{feedback}\n\n\
         Fix the reported problems while keeping what already works. {shape}",
        version = recipe.version,
        platform = style.platform,
        template = recipe.prompt_template,
        code = recipe.validation_code,
        feedback = feedback,
        shape = DRAFT_REPLY_SHAPE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JudgeVerdict, ValidationReport};
    use crate::sandbox::Sandbox;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn record(id: &str, fields: &[(&str, Value)]) -> ProductRecord {
        let mut record = ProductRecord::new(id);
        for (name, value) in fields {
            record.fields.insert((*name).to_string(), value.clone());
        }
        record
    }

    #[test]
    fn strips_fences_with_language_tags() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\nlet x = 1;\n```"), "let x = 1;");
        assert_eq!(strip_code_fences("plain text"), "plain text");
        // missing closer
        assert_eq!(strip_code_fences("```rhai\nfn f() {}"), "fn f() {}");
    }

    #[test]
    fn parses_draft_wrapped_in_prose() {
        let reply = "Here is the recipe you asked for:\n\n\
            {\"prompt_template\": \"Write about {product_name}\", \
             \"validation_code\": \"fn validate_listing(l, p) { [] }\"}\n\nLet me know!";
        let draft = parse_recipe_response(reply).unwrap();
        assert_eq!(draft.prompt_template, "Write about {product_name}");
        let recipe = draft.into_recipe(2);
        assert_eq!(recipe.version, 2);
        assert_eq!(recipe.output_schema, default_output_schema());
        assert!(!recipe.approved);
    }

    #[test]
    fn rejects_garbage_draft() {
        assert!(parse_recipe_response("I could not produce a recipe").is_none());
    }

    #[test]
    fn fills_product_and_style_placeholders() {
        let product = record("p1", &[("material", json!("walnut")), ("price", json!(30))]);
        let style = StyleProfile {
            platform: "etsy".into(),
            brand_voice: "warm, handmade".into(),
            ..StyleProfile::default()
        };
        let out = fill_template(
            "Sell {material} goods on {platform} ({product_id}); voice {brand_voice}; {unknown}",
            &product,
            &style,
        );
        assert_eq!(
            out,
            "Sell walnut goods on etsy (p1); voice warm, handmade; {unknown}"
        );
    }

    #[test]
    fn diverse_samples_cover_the_extremes() {
        let mut records = vec![record(
            "rich",
            &[
                ("name", json!("Full record")),
                ("material", json!("oak")),
                ("price", json!(50)),
                ("category", json!("furniture")),
            ],
        )];
        records.push(record("sparse", &[("name", json!("Bare"))]));
        for i in 0..6 {
            records.push(record(
                &format!("mid{i}"),
                &[
                    ("name", json!(format!("Item {i}"))),
                    ("category", json!("furniture")),
                    ("price", json!(10 + i)),
                ],
            ));
        }

        let mut rng = SmallRng::seed_from_u64(7);
        let samples = select_diverse_samples(&records, 3, &mut rng);
        assert_eq!(samples.len(), 3);
        let ids: Vec<&str> = samples.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"rich"));
        assert!(ids.contains(&"sparse"));
    }

    #[test]
    fn small_uploads_are_sampled_whole() {
        let records = vec![record("a", &[]), record("b", &[])];
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(select_diverse_samples(&records, 3, &mut rng).len(), 2);
    }

    #[test]
    fn feedback_lists_failing_samples_with_issues() {
        let results = vec![
            TestResult {
                product_id: "p1".into(),
                product_name: "Copper Mug".into(),
                listing: None,
                validation: ValidationReport {
                    score: 61,
                    passed: false,
                    code_issues: vec!["Fewer than 5 tags".into()],
                    judge_criteria: vec![JudgeVerdict {
                        name: "persuasiveness".into(),
                        pass: false,
                        rationale: "Reads like a spec sheet".into(),
                    }],
                    degraded: false,
                },
            },
            TestResult {
                product_id: "p2".into(),
                product_name: "Oak Tray".into(),
                listing: None,
                validation: ValidationReport {
                    score: 100,
                    passed: true,
                    code_issues: vec![],
                    judge_criteria: vec![],
                    degraded: false,
                },
            },
        ];
        let feedback = build_auto_feedback(&results);
        assert!(feedback.starts_with("1 of 2 test listings failed"));
        assert!(feedback.contains("Copper Mug"));
        assert!(feedback.contains("Fewer than 5 tags"));
        assert!(feedback.contains("persuasiveness"));
        assert!(!feedback.contains("Oak Tray"));
    }

    #[test]
    fn default_validation_code_accepts_a_solid_listing() {
        let listing = json!({
            "title": "Handmade Copper Moscow Mule Mug",
            "description": (0..60).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" "),
            "tags": ["copper", "mug", "handmade", "barware", "gift", "mule"],
            "suggested_price": 24.5,
            "confidence": "high"
        });
        let product = json!({ "id": "p1", "name": "Copper Mug" });
        let issues = Sandbox::default()
            .run(DEFAULT_VALIDATION_CODE, "validate_listing", &[listing, product])
            .unwrap();
        assert_eq!(issues, json!([]));
    }

    #[test]
    fn default_validation_code_flags_missing_fields_as_critical() {
        let listing = json!({ "description": "too short" });
        let product = json!({ "id": "p1" });
        let issues = Sandbox::default()
            .run(DEFAULT_VALIDATION_CODE, "validate_listing", &[listing, product])
            .unwrap();
        let issues: Vec<String> = serde_json::from_value(issues).unwrap();
        assert!(issues.iter().any(|i| i == "critical: missing required field title"));
        assert!(issues.iter().any(|i| i == "critical: missing required field tags"));
        assert!(issues.iter().any(|i| i.contains("under 50 words")));
    }
}
