use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;

use crate::llm::{Effort, LlmService};
use crate::models::{DataModel, ProductRecord, value_is_blank};
use crate::recipe::strip_code_fences;
use crate::sandbox::{Sandbox, SandboxError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How much raw upload text the extraction prompt may carry.
const RAW_SAMPLE_LIMIT: usize = 4_000;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction failed after {attempts} attempts: {last_error}")]
    Failed { attempts: u32, last_error: String },
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub data_model: DataModel,
    pub script: String,
}

/// Turns raw seller uploads into product records by asking the model for an
/// extraction script, running it in the sandbox, and feeding any failure
/// back as a correction until it works or the attempt budget runs out.
pub struct Extractor {
    llm: Arc<dyn LlmService>,
    sandbox: Sandbox,
    max_attempts: u32,
}

impl Extractor {
    pub fn new(llm: Arc<dyn LlmService>, sandbox: Sandbox, max_attempts: u32) -> Self {
        Self {
            llm,
            sandbox,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts_from_env() -> u32 {
        std::env::var("EXTRACTION_MAX_ATTEMPTS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    pub async fn extract(
        &self,
        raw_data: &str,
        image_names: &[String],
    ) -> Result<ExtractionOutcome, ExtractionError> {
        let args = vec![json!(raw_data), json!(image_names)];
        let mut last_error = String::new();
        let mut last_script: Option<String> = None;
        let mut attempts = 0;

        while attempts < self.max_attempts {
            attempts += 1;
            let prompt = match &last_script {
                None => initial_prompt(raw_data, image_names),
                Some(script) => correction_prompt(script, &last_error),
            };

            let mut script = match self.llm.generate_code(&prompt, Effort::High).await {
                Ok(reply) => strip_code_fences(&reply).to_string(),
                Err(err) => {
                    last_error = format!("script generation failed: {err}");
                    tracing::warn!(target = "listwright.discovery", attempts, error = %last_error, "extraction attempt failed");
                    continue;
                }
            };

            let mut repaired = false;
            loop {
                match self
                    .sandbox
                    .run_async(script.clone(), "extract".to_string(), args.clone())
                    .await
                {
                    Ok(value) => match parse_records(value).and_then(audit_records) {
                        Ok(records) => {
                            let fields_discovered = discovered_fields(&records);
                            tracing::info!(
                                target = "listwright.discovery",
                                attempts,
                                products = records.len(),
                                fields = fields_discovered.len(),
                                "extraction succeeded"
                            );
                            return Ok(ExtractionOutcome {
                                data_model: DataModel {
                                    products: records,
                                    fields_discovered,
                                    extraction_attempts: attempts,
                                },
                                script,
                            });
                        }
                        Err(issue) => {
                            last_error = issue;
                            break;
                        }
                    },
                    // Leftover fences and unbalanced braces are common enough
                    // to fix locally before spending another model round-trip.
                    Err(SandboxError::Syntax { message, .. }) if !repaired => {
                        repaired = true;
                        match repair_script(&script) {
                            Some(fixed) => {
                                script = fixed;
                                continue;
                            }
                            None => {
                                last_error = format!("syntax error: {message}");
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        last_error = err.to_string();
                        break;
                    }
                }
            }

            tracing::warn!(target = "listwright.discovery", attempts, error = %last_error, "extraction attempt failed");
            last_script = Some(script);
        }

        Err(ExtractionError::Failed {
            attempts,
            last_error,
        })
    }
}

/// Cheap deterministic fixes for the usual script-generation artifacts:
/// smart quotes and a missing closing brace. Returns None when nothing
/// changed.
fn repair_script(script: &str) -> Option<String> {
    let mut fixed = strip_code_fences(script).to_string();
    for (fancy, plain) in [('\u{201c}', '"'), ('\u{201d}', '"'), ('\u{2018}', '\''), ('\u{2019}', '\'')] {
        fixed = fixed.replace(fancy, &plain.to_string());
    }

    let open = fixed.matches('{').count();
    let close = fixed.matches('}').count();
    if open > close {
        fixed.push_str(&"}".repeat(open - close));
    }

    (fixed != script).then_some(fixed)
}

fn parse_records(value: Value) -> Result<Vec<ProductRecord>, String> {
    let Value::Array(items) = value else {
        return Err("script returned something other than an array of records".to_string());
    };
    let mut records = Vec::with_capacity(items.len());
    let mut problems = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<ProductRecord>(item) {
            Ok(mut record) => {
                if record.source.is_empty() {
                    record.source = "extraction".to_string();
                }
                records.push(record);
            }
            Err(err) => {
                if problems.len() < 3 {
                    problems.push(format!("record {index}: {err}"));
                }
            }
        }
    }
    if problems.is_empty() {
        Ok(records)
    } else {
        Err(format!("malformed records: {}", problems.join("; ")))
    }
}

/// Reject output that is technically well-formed but useless, so the
/// correction loop gets a chance to do better.
fn audit_records(records: Vec<ProductRecord>) -> Result<Vec<ProductRecord>, String> {
    if records.is_empty() {
        return Err("script produced no records".to_string());
    }

    let mut seen = BTreeSet::new();
    for record in &records {
        if record.id.trim().is_empty() {
            return Err("a record has an empty id".to_string());
        }
        if !seen.insert(record.id.as_str()) {
            return Err(format!("duplicate record id `{}`", record.id));
        }
    }

    let mostly_empty = records
        .iter()
        .filter(|record| {
            record
                .fields
                .values()
                .filter(|value| !value_is_blank(value))
                .count()
                <= 1
        })
        .count();
    if mostly_empty * 2 > records.len() {
        return Err(format!(
            "{mostly_empty} of {} records carry at most one filled field; \
             the script is likely misreading the data layout",
            records.len()
        ));
    }

    Ok(records)
}

fn discovered_fields(records: &[ProductRecord]) -> Vec<String> {
    let mut fields: BTreeSet<&str> = BTreeSet::new();
    for record in records {
        fields.extend(record.fields.keys().map(String::as_str));
    }
    fields.into_iter().map(str::to_string).collect()
}

fn raw_sample(raw_data: &str) -> &str {
    match raw_data.char_indices().nth(RAW_SAMPLE_LIMIT) {
        Some((idx, _)) => &raw_data[..idx],
        None => raw_data,
    }
}

const SCRIPT_CONTRACT: &str = "Write a Rhai script that defines \
`fn extract(raw, image_names)`. `raw` is the upload text, `image_names` an \
array of photo filenames. Return an array of maps; every map needs a unique \
string `id`, should carry every data field you can recover (name, price, \
material, ...), and may set `image_files` to matching photo names. Use only \
string, array, and map builtins (`split`, `trim`, `parse_float`, `to_lower`, \
`contains`); the sandbox has no file, network, or import access. Reply with \
the script only.";

fn initial_prompt(raw_data: &str, image_names: &[String]) -> String {
    format!(
        "Raw seller upload (possibly truncated):\n{raw}\n\n\
         Available photo filenames: {images}\n\n{contract}",
        raw = raw_sample(raw_data),
        images = if image_names.is_empty() {
            "none".to_string()
        } else {
            image_names.join(", ")
        },
        contract = SCRIPT_CONTRACT,
    )
}

fn correction_prompt(script: &str, error: &str) -> String {
    format!(
        "The extraction script below failed.\n\nScript:\n{script}\n\n\
         Failure:\n{error}\n\n\
         Return the complete corrected script. {contract}",
        contract = SCRIPT_CONTRACT,
    )
}
