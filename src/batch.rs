use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::evaluate::Evaluator;
use crate::events::{EventBus, EventKind};
use crate::jobs::JobContext;
use crate::llm::{Effort, LlmService};
use crate::models::{
    BatchItemResult, BatchItemStatus, BatchReport, ProductRecord, Recipe, StyleProfile,
};
use crate::recipe::fill_template;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub concurrency: usize,
    /// Inter-request pause per worker, to stay under gateway rate limits.
    pub pacing: Duration,
    pub call_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            pacing: Duration::from_millis(500),
            call_timeout: Duration::from_secs(90),
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let concurrency = std::env::var("BATCH_CONCURRENCY")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.concurrency);
        let pacing = std::env::var("BATCH_PACING_MS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.pacing);
        let call_timeout = std::env::var("LLM_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.call_timeout);
        Self {
            concurrency,
            pacing,
            call_timeout,
        }
    }
}

/// Applies an approved recipe to every record with bounded concurrency.
///
/// Per item: generate at low effort, validate, and on failure retry once at
/// high effort with the issues as corrective context. Every item reaches a
/// terminal state; a cancelled run marks unstarted items failed rather than
/// leaving them in limbo.
#[derive(Clone)]
pub struct BatchScheduler {
    llm: Arc<dyn LlmService>,
    evaluator: Evaluator,
    config: BatchConfig,
}

struct ItemShared {
    recipe: Recipe,
    style: StyleProfile,
    job: JobContext,
    bus: EventBus,
    semaphore: Arc<Semaphore>,
    completed: AtomicUsize,
    total: usize,
}

impl BatchScheduler {
    pub fn new(llm: Arc<dyn LlmService>, evaluator: Evaluator, config: BatchConfig) -> Self {
        Self {
            llm,
            evaluator,
            config,
        }
    }

    pub async fn execute(
        &self,
        job: &JobContext,
        bus: &EventBus,
        recipe: &Recipe,
        style: &StyleProfile,
        records: &[ProductRecord],
    ) -> (BatchReport, Vec<BatchItemResult>) {
        let started = Instant::now();
        let job_id = job.id.to_string();
        let total = records.len();
        bus.emit(&job_id, EventKind::BatchStarted { total });
        tracing::info!(
            target = "listwright.batch",
            job_id,
            total,
            concurrency = self.config.concurrency,
            recipe_version = recipe.version,
            "batch started"
        );

        let shared = Arc::new(ItemShared {
            recipe: recipe.clone(),
            style: style.clone(),
            job: job.clone(),
            bus: bus.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.concurrency)),
            completed: AtomicUsize::new(0),
            total,
        });

        let mut set: JoinSet<BatchItemResult> = JoinSet::new();
        for record in records.iter().cloned() {
            let scheduler = self.clone();
            let shared = Arc::clone(&shared);
            set.spawn(async move { scheduler.process_item(record, shared).await });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => {
                    tracing::error!(target = "listwright.batch", job_id, error = %err, "item task panicked");
                }
            }
        }

        // completion order is nondeterministic; put results back in upload order
        let order: HashMap<&str, usize> = records
            .iter()
            .enumerate()
            .map(|(idx, record)| (record.id.as_str(), idx))
            .collect();
        results.sort_by_key(|result| order.get(result.product_id.as_str()).copied());

        let report = build_report(&job_id, total, &results, started.elapsed());
        bus.emit(
            &job_id,
            EventKind::BatchCompleted {
                report: report.clone(),
            },
        );
        tracing::info!(
            target = "listwright.batch",
            job_id,
            succeeded = report.succeeded,
            failed = report.failed,
            retried = report.retried,
            avg_score = report.avg_score,
            "batch finished"
        );
        (report, results)
    }

    async fn process_item(&self, record: ProductRecord, shared: Arc<ItemShared>) -> BatchItemResult {
        let job_id = shared.job.id.to_string();
        let Ok(_permit) = Arc::clone(&shared.semaphore).acquire_owned().await else {
            return self.finish(
                &shared,
                failed_item(&record.id, 0, Effort::Low, "scheduler shut down"),
            );
        };

        if shared.job.cancelled() {
            return self.finish(&shared, failed_item(&record.id, 0, Effort::Low, "cancelled"));
        }

        shared.bus.emit(
            &job_id,
            EventKind::ItemStarted {
                product_id: record.id.clone(),
            },
        );

        if !self.config.pacing.is_zero() {
            tokio::time::sleep(self.config.pacing).await;
        }

        let first = match self.generate(&record, &shared, Effort::Low, None).await {
            Ok(listing) => listing,
            Err(error) => {
                return self.finish(&shared, failed_item(&record.id, 1, Effort::Low, &error));
            }
        };
        let report = self
            .evaluator
            .evaluate(&first, &record, &shared.recipe, &shared.style)
            .await;
        if report.passed {
            return self.finish(
                &shared,
                BatchItemResult {
                    product_id: record.id.clone(),
                    status: BatchItemStatus::Ok,
                    attempt_count: 1,
                    escalation_tier: Effort::Low,
                    listing: Some(first),
                    score: Some(report.score),
                    error: None,
                },
            );
        }

        if shared.job.cancelled() {
            return self.finish(&shared, failed_item(&record.id, 1, Effort::Low, "cancelled"));
        }

        let issues = report.issue_lines();
        shared.bus.emit(
            &job_id,
            EventKind::ItemRetrying {
                product_id: record.id.clone(),
                issues: issues.clone(),
            },
        );
        if !self.config.pacing.is_zero() {
            tokio::time::sleep(self.config.pacing).await;
        }

        let effort = Effort::Low.escalated();
        let second = match self.generate(&record, &shared, effort, Some(&issues)).await {
            Ok(listing) => listing,
            Err(error) => {
                return self.finish(&shared, failed_item(&record.id, 2, effort, &error));
            }
        };
        let report = self
            .evaluator
            .evaluate(&second, &record, &shared.recipe, &shared.style)
            .await;
        let result = if report.passed {
            BatchItemResult {
                product_id: record.id.clone(),
                status: BatchItemStatus::Ok,
                attempt_count: 2,
                escalation_tier: effort,
                listing: Some(second),
                score: Some(report.score),
                error: None,
            }
        } else {
            BatchItemResult {
                product_id: record.id.clone(),
                status: BatchItemStatus::Failed,
                attempt_count: 2,
                escalation_tier: effort,
                listing: Some(second),
                score: Some(report.score),
                error: Some(format!(
                    "validation failed after retry: {}",
                    report.issue_lines().join("; ")
                )),
            }
        };
        self.finish(&shared, result)
    }

    async fn generate(
        &self,
        record: &ProductRecord,
        shared: &ItemShared,
        effort: Effort,
        corrective_issues: Option<&[String]>,
    ) -> Result<Value, String> {
        let mut prompt = fill_template(&shared.recipe.prompt_template, record, &shared.style);
        if let Some(issues) = corrective_issues {
            prompt.push_str("\n\nThe previous attempt failed validation:\n");
            for issue in issues {
                prompt.push_str(&format!("- {issue}\n"));
            }
            prompt.push_str("Fix these problems in the new listing.");
        }

        match tokio::time::timeout(
            self.config.call_timeout,
            self.llm
                .generate_structured(&prompt, &shared.recipe.output_schema, effort),
        )
        .await
        {
            Ok(Ok(listing)) => Ok(listing),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("listing generation timed out".to_string()),
        }
    }

    fn finish(&self, shared: &ItemShared, result: BatchItemResult) -> BatchItemResult {
        let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
        shared.bus.emit(
            &shared.job.id.to_string(),
            EventKind::ItemCompleted {
                product_id: result.product_id.clone(),
                status: result.status,
                score: result.score,
                completed,
                total: shared.total,
            },
        );
        result
    }
}

fn failed_item(product_id: &str, attempts: u32, tier: Effort, error: &str) -> BatchItemResult {
    BatchItemResult {
        product_id: product_id.to_string(),
        status: BatchItemStatus::Failed,
        attempt_count: attempts,
        escalation_tier: tier,
        listing: None,
        score: None,
        error: Some(error.to_string()),
    }
}

fn build_report(
    job_id: &str,
    total: usize,
    results: &[BatchItemResult],
    elapsed: Duration,
) -> BatchReport {
    let succeeded = results
        .iter()
        .filter(|result| result.status == BatchItemStatus::Ok)
        .count();
    let failed = results
        .iter()
        .filter(|result| result.status == BatchItemStatus::Failed)
        .count();
    let retried = results
        .iter()
        .filter(|result| result.attempt_count > 1)
        .count();
    let scores: Vec<f64> = results
        .iter()
        .filter(|result| result.status == BatchItemStatus::Ok)
        .filter_map(|result| result.score.map(f64::from))
        .collect();
    let avg_score = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };
    BatchReport {
        job_id: job_id.to_string(),
        total,
        succeeded,
        failed,
        retried,
        avg_score,
        elapsed_seconds: elapsed.as_secs_f64(),
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::EvalConfig;
    use crate::jobs::JobRegistry;
    use crate::llm::LlmError;
    use crate::llm::testing::FakeLlm;
    use crate::sandbox::Sandbox;
    use serde_json::json;
    use std::sync::Mutex;

    fn records(count: usize) -> Vec<ProductRecord> {
        (0..count)
            .map(|i| {
                let mut record = ProductRecord::new(format!("p{i}"));
                record
                    .fields
                    .insert("name".into(), json!(format!("Item {i}")));
                record.fields.insert("price".into(), json!(10 + i));
                record
            })
            .collect()
    }

    fn good_listing() -> Value {
        json!({
            "title": "Handmade Copper Moscow Mule Mug",
            "description": (0..60).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" "),
            "tags": ["copper", "mug", "handmade", "barware", "gift", "mule"],
            "suggested_price": 24.5,
            "confidence": "high"
        })
    }

    fn bad_listing() -> Value {
        json!({ "description": "too short" })
    }

    fn is_judge_call(schema: &Value) -> bool {
        schema
            .get("properties")
            .is_some_and(|props| props.get("reasoning").is_some())
    }

    fn prompt_product_id(prompt: &str, count: usize) -> Option<String> {
        (0..count)
            .map(|i| format!("p{i}"))
            .find(|id| prompt.contains(&format!("({id})")))
    }

    fn scheduler(llm: FakeLlm, concurrency: usize) -> BatchScheduler {
        let service = llm.into_service();
        let evaluator = Evaluator::new(
            Arc::clone(&service),
            Sandbox::default(),
            EvalConfig::default(),
        );
        BatchScheduler::new(
            service,
            evaluator,
            BatchConfig {
                concurrency,
                pacing: Duration::ZERO,
                call_timeout: Duration::from_secs(5),
            },
        )
    }

    fn approved_recipe() -> Recipe {
        let mut recipe = Recipe::fallback_draft();
        recipe.approved = true;
        recipe
    }

    #[tokio::test]
    async fn mixed_batch_retries_and_reports() {
        // p3 fails its first attempt and recovers; p7 fails both
        let attempts: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let attempts_in = Arc::clone(&attempts);
        let llm = FakeLlm::new().with_structured(move |prompt, schema, effort| {
            if is_judge_call(schema) {
                return Ok(json!({ "reasoning": "fine", "pass": true }));
            }
            let id = prompt_product_id(prompt, 10).expect("prompt names a product");
            let mut guard = attempts_in.lock().unwrap();
            let attempt = guard.entry(id.clone()).or_insert(0);
            *attempt += 1;
            match (id.as_str(), *attempt) {
                ("p3", 1) => Ok(bad_listing()),
                ("p3", _) => {
                    assert_eq!(effort, Effort::High);
                    assert!(prompt.contains("previous attempt failed validation"));
                    Ok(good_listing())
                }
                ("p7", _) => Ok(bad_listing()),
                _ => Ok(good_listing()),
            }
        });

        let registry = JobRegistry::new();
        let entry = registry.create().await;
        let (report, results) = scheduler(llm, 4)
            .execute(
                &entry.context,
                &entry.bus,
                &approved_recipe(),
                &StyleProfile::default(),
                &records(10),
            )
            .await;

        assert_eq!(report.total, 10);
        assert_eq!(report.succeeded, 9);
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 2);
        assert!(report.avg_score > 0.0);

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.status != BatchItemStatus::Retrying));
        let p3 = results.iter().find(|r| r.product_id == "p3").unwrap();
        assert_eq!(p3.status, BatchItemStatus::Ok);
        assert_eq!(p3.attempt_count, 2);
        assert_eq!(p3.escalation_tier, Effort::High);
        let p7 = results.iter().find(|r| r.product_id == "p7").unwrap();
        assert_eq!(p7.status, BatchItemStatus::Failed);
        assert_eq!(p7.attempt_count, 2);
        assert!(p7.error.as_deref().unwrap().contains("after retry"));
        // results come back in upload order
        assert_eq!(results[3].product_id, "p3");
    }

    #[tokio::test]
    async fn concurrency_stays_bounded() {
        let llm = FakeLlm::new()
            .with_delay(Duration::from_millis(15))
            .with_structured(|_, schema, _| {
                if is_judge_call(schema) {
                    Ok(json!({ "reasoning": "fine", "pass": true }))
                } else {
                    Ok(good_listing())
                }
            });

        let registry = JobRegistry::new();
        let entry = registry.create().await;
        let mut rx = entry.bus.subscribe();
        let (report, _) = scheduler(llm, 3)
            .execute(
                &entry.context,
                &entry.bus,
                &approved_recipe(),
                &StyleProfile::default(),
                &records(12),
            )
            .await;
        assert_eq!(report.succeeded, 12);

        // replay the event stream and track how many items were in flight
        let mut running: i64 = 0;
        let mut peak: i64 = 0;
        while let Ok(event) = rx.try_recv() {
            match event.kind {
                EventKind::ItemStarted { .. } => {
                    running += 1;
                    peak = peak.max(running);
                }
                EventKind::ItemCompleted { .. } => running -= 1,
                _ => {}
            }
        }
        assert!(peak >= 1);
        assert!(peak <= 3, "peak concurrency was {peak}");
    }

    #[tokio::test]
    async fn cancelled_batch_fails_every_item_terminally() {
        let llm = FakeLlm::new();
        let registry = JobRegistry::new();
        let entry = registry.create().await;
        entry.context.cancel();
        let (report, results) = scheduler(llm, 3)
            .execute(
                &entry.context,
                &entry.bus,
                &approved_recipe(),
                &StyleProfile::default(),
                &records(6),
            )
            .await;
        assert_eq!(report.failed, 6);
        assert_eq!(report.succeeded, 0);
        assert!(results
            .iter()
            .all(|r| r.status == BatchItemStatus::Failed
                && r.error.as_deref() == Some("cancelled")));
    }

    #[tokio::test]
    async fn permanent_gateway_failure_fails_fast_without_escalation() {
        let llm = FakeLlm::new().with_structured(|_, schema, _| {
            if is_judge_call(schema) {
                Ok(json!({ "reasoning": "fine", "pass": true }))
            } else {
                Err(LlmError::Permanent("quota exhausted".into()))
            }
        });
        let registry = JobRegistry::new();
        let entry = registry.create().await;
        let (report, results) = scheduler(llm, 2)
            .execute(
                &entry.context,
                &entry.bus,
                &approved_recipe(),
                &StyleProfile::default(),
                &records(2),
            )
            .await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.retried, 0);
        for result in results {
            assert_eq!(result.attempt_count, 1);
            assert_eq!(result.escalation_tier, Effort::Low);
            assert!(result.error.as_deref().unwrap().contains("quota"));
        }
    }
}
