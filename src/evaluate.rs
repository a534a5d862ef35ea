use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinSet;

use crate::llm::{Effort, LlmService};
use crate::models::{
    JudgeVerdict, ProductRecord, Recipe, StyleProfile, ValidationReport, issue_is_critical,
};
use crate::recipe::DEFAULT_VALIDATION_CODE;
use crate::sandbox::Sandbox;

pub struct JudgeCriterion {
    pub name: &'static str,
    pub question: &'static str,
    pub focus: &'static str,
}

/// The fixed criteria panel. Every listing is judged on all five; there is no
/// per-recipe criteria configuration.
pub const JUDGE_CRITERIA: &[JudgeCriterion] = &[
    JudgeCriterion {
        name: "brand_voice_match",
        question: "Does the listing text match the seller's stated brand voice?",
        focus: "tone, word choice, and personality versus the seller profile",
    },
    JudgeCriterion {
        name: "description_completeness",
        question: "Does the description cover the product's actual attributes?",
        focus: "material, size, condition, and use, without inventing details",
    },
    JudgeCriterion {
        name: "tag_relevance",
        question: "Are the tags specific and relevant to this product?",
        focus: "searchability; generic filler tags count against",
    },
    JudgeCriterion {
        name: "persuasiveness",
        question: "Would this listing convince the target buyer?",
        focus: "benefit framing and a reason to buy, not just a spec sheet",
    },
    JudgeCriterion {
        name: "image_text_consistency",
        question: "Is the text consistent with the photos that will accompany it?",
        focus: "no claims about views the photos cannot show",
    },
];

/// Reasoning is requested before the verdict so the boolean is grounded in
/// the written rationale rather than pattern-matched.
fn judge_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "reasoning": { "type": "string" },
            "pass": { "type": "boolean" }
        },
        "required": ["reasoning", "pass"]
    })
}

fn judge_prompt(
    criterion: &JudgeCriterion,
    listing: &Value,
    product: &ProductRecord,
    style: &StyleProfile,
) -> String {
    let listing_json = serde_json::to_string_pretty(listing).unwrap_or_else(|_| "{}".to_string());
    let product_json = serde_json::to_string_pretty(&Value::Object(product.fields.clone()))
        .unwrap_or_else(|_| "{}".to_string());
    format!(
        "You are judging one quality criterion of a marketplace listing.\n\
         Criterion: {name}\nQuestion: {question}\nFocus on: {focus}\n\n\
         Seller style: {summary}\n\
         Product data:\n{product_json}\n\
         Product photos: {images}\n\n\
         Listing under review:\n{listing_json}\n\n\
         Think through the criterion step by step in `reasoning`, then give a \
         strict boolean `pass`. Borderline is a fail.",
        name = criterion.name,
        question = criterion.question,
        focus = criterion.focus,
        summary = style.summary(),
        product_json = product_json,
        images = if product.image_files.is_empty() {
            "none".to_string()
        } else {
            product.image_files.join(", ")
        },
        listing_json = listing_json,
    )
}

#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub pass_threshold: u8,
    pub judge_timeout: Duration,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 80,
            judge_timeout: Duration::from_secs(45),
        }
    }
}

impl EvalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let pass_threshold = std::env::var("PASS_THRESHOLD")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.pass_threshold);
        let judge_timeout = std::env::var("JUDGE_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.judge_timeout);
        Self {
            pass_threshold,
            judge_timeout,
        }
    }
}

/// Hybrid listing validation: the recipe's sandboxed code checks structure,
/// five model judges check quality, and both fold into one score.
///
/// `evaluate` is total: every failure mode becomes part of the report instead
/// of an error, so callers can always act on the result.
#[derive(Clone)]
pub struct Evaluator {
    llm: Arc<dyn LlmService>,
    sandbox: Sandbox,
    config: EvalConfig,
}

impl Evaluator {
    pub fn new(llm: Arc<dyn LlmService>, sandbox: Sandbox, config: EvalConfig) -> Self {
        Self {
            llm,
            sandbox,
            config,
        }
    }

    pub async fn evaluate(
        &self,
        listing: &Value,
        product: &ProductRecord,
        recipe: &Recipe,
        style: &StyleProfile,
    ) -> ValidationReport {
        let (code_issues, judge_results) = tokio::join!(
            self.run_code_checks(listing, product, recipe),
            self.run_judges(listing, product, style),
        );
        let (judge_criteria, degraded) = judge_results;

        let failed = judge_criteria.iter().filter(|verdict| !verdict.pass).count();
        let score = ValidationReport::score_for(code_issues.len(), failed);
        let critical = code_issues.iter().any(|issue| issue_is_critical(issue));
        let passed = score >= self.config.pass_threshold && !critical;

        tracing::info!(
            target = "listwright.evaluate",
            product_id = %product.id,
            score,
            passed,
            code_issues = code_issues.len(),
            failed_criteria = failed,
            degraded,
            "listing evaluated"
        );

        ValidationReport {
            score,
            passed,
            code_issues,
            judge_criteria,
            degraded,
        }
    }

    /// Run the recipe's validation function. A broken or hostile validation
    /// script is itself a critical issue; it is never retried here because
    /// the same code would fail the same way.
    async fn run_code_checks(
        &self,
        listing: &Value,
        product: &ProductRecord,
        recipe: &Recipe,
    ) -> Vec<String> {
        let code = if recipe.validation_code.trim().is_empty() {
            DEFAULT_VALIDATION_CODE
        } else {
            &recipe.validation_code
        };
        let product_value = Value::Object(product.fields.clone());
        let result = self
            .sandbox
            .run_async(
                code.to_string(),
                "validate_listing".to_string(),
                vec![listing.clone(), product_value],
            )
            .await;

        match result {
            Ok(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(text) => text,
                    other => other.to_string(),
                })
                .collect(),
            Ok(other) => vec![format!(
                "critical: validation code returned {} instead of an issue array",
                kind_name(&other)
            )],
            Err(err) => vec![format!("critical: validation code failed: {err}")],
        }
    }

    /// Fan the five criteria out concurrently and fan back in. A judge that
    /// errors or times out is conservatively recorded as a failed criterion
    /// with the report marked degraded.
    async fn run_judges(
        &self,
        listing: &Value,
        product: &ProductRecord,
        style: &StyleProfile,
    ) -> (Vec<JudgeVerdict>, bool) {
        let schema = judge_schema();
        let mut set: JoinSet<(usize, JudgeVerdict, bool)> = JoinSet::new();

        for (idx, criterion) in JUDGE_CRITERIA.iter().enumerate() {
            let llm = Arc::clone(&self.llm);
            let prompt = judge_prompt(criterion, listing, product, style);
            let schema = schema.clone();
            let timeout = self.config.judge_timeout;
            let name = criterion.name;
            set.spawn(async move {
                let reply =
                    tokio::time::timeout(timeout, llm.generate_structured(&prompt, &schema, Effort::Medium))
                        .await;
                match reply {
                    Ok(Ok(value)) => match parse_verdict(name, &value) {
                        Some(verdict) => (idx, verdict, false),
                        None => (idx, degraded_verdict(name, "judge reply was malformed"), true),
                    },
                    Ok(Err(err)) => (
                        idx,
                        degraded_verdict(name, &format!("judge call failed: {err}")),
                        true,
                    ),
                    Err(_) => (idx, degraded_verdict(name, "judge call timed out"), true),
                }
            });
        }

        let mut slots: Vec<Option<JudgeVerdict>> = vec![None; JUDGE_CRITERIA.len()];
        let mut degraded = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, verdict, was_degraded)) => {
                    degraded |= was_degraded;
                    slots[idx] = Some(verdict);
                }
                Err(err) => {
                    tracing::warn!(target = "listwright.evaluate", error = %err, "judge task panicked");
                    degraded = true;
                }
            }
        }

        let verdicts = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| degraded_verdict(JUDGE_CRITERIA[idx].name, "judge task lost"))
            })
            .collect();
        (verdicts, degraded)
    }
}

fn parse_verdict(name: &str, value: &Value) -> Option<JudgeVerdict> {
    let pass = value.get("pass")?.as_bool()?;
    let rationale = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Some(JudgeVerdict {
        name: name.to_string(),
        pass,
        rationale,
    })
}

fn degraded_verdict(name: &str, reason: &str) -> JudgeVerdict {
    JudgeVerdict {
        name: name.to_string(),
        pass: false,
        rationale: format!("criterion could not be judged ({reason}); counted as failed"),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
