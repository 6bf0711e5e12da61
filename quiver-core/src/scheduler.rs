//! Cron scheduler.
//!
//! Wakes every five seconds and matches each schedule trigger against the
//! wall clock. Cron expressions use the 5-field minute/hour/day/month/weekday
//! form where every field is either `*` or a literal integer; ranges, lists,
//! and steps are not supported. A per-(function, expression) guard suppresses
//! re-fires within 50 seconds so one matching minute fires at most twice
//! across ticks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::function::Trigger;
use crate::handler::{ExecutionIds, FunctionRequest};
use crate::harness::Harness;
use crate::registry::Registry;

pub const TICK_INTERVAL: Duration = Duration::from_secs(5);
pub const REFIRE_WINDOW: Duration = Duration::from_secs(50);

/// Whether a cron expression matches the given instant.
pub fn cron_matches(expr: &str, now: &DateTime<Local>) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_matches(fields[0], now.minute())
        && field_matches(fields[1], now.hour())
        && field_matches(fields[2], now.day())
        && field_matches(fields[3], now.month())
        && field_matches(fields[4], now.weekday().num_days_from_sunday())
}

fn field_matches(field: &str, value: u32) -> bool {
    field == "*" || field.parse::<u32>() == Ok(value)
}

#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<Registry>,
    harness: Harness,
    fired: Mutex<HashMap<(String, String), Instant>>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, harness: Harness) -> Self {
        Self {
            registry,
            harness,
            fired: Mutex::new(HashMap::new()),
        }
    }

    /// Long-running scheduler loop.
    pub async fn run(self: Arc<Self>) {
        info!("Cron scheduler started ({:?} tick)", TICK_INTERVAL);
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            self.tick(Local::now());
        }
    }

    /// Evaluate every schedule trigger against `now`, dispatching matches.
    pub fn tick(&self, now: DateTime<Local>) {
        for record in self.registry.snapshot() {
            if record.run_once && self.registry.is_completed(&record.name) {
                continue;
            }
            for trigger in &record.triggers {
                let Trigger::Schedule { cron, .. } = trigger else {
                    continue;
                };
                if !cron_matches(cron, &now) {
                    continue;
                }
                if !self.should_fire(&record.name, cron) {
                    debug!(
                        "Suppressing re-fire of '{}' for cron '{}'",
                        record.name, cron
                    );
                    continue;
                }

                info!("Cron '{}' fired for function '{}'", cron, record.name);
                let harness = self.harness.clone();
                let record = record.clone();
                tokio::spawn(async move {
                    let request =
                        FunctionRequest::synthetic(format!("/{}", record.name), "schedule");
                    harness
                        .execute(&record, request, ExecutionIds::fresh(), None)
                        .await;
                });
            }
        }
    }

    /// Record a fire for the (function, expression) pair unless one happened
    /// within the re-fire window.
    fn should_fire(&self, function: &str, cron: &str) -> bool {
        let key = (function.to_string(), cron.to_string());
        let now = Instant::now();
        let mut fired = self.fired.lock().expect("scheduler lock poisoned");
        if let Some(last) = fired.get(&key)
            && now.duration_since(*last) < REFIRE_WINDOW
        {
            return false;
        }
        fired.insert(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendClient;
    use crate::error::Result;
    use crate::function::{FunctionRecord, FunctionStatus};
    use crate::handler::{FunctionContext, Handler, HandlerOutput};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        // 2026-03-04 was a Wednesday (weekday 3).
        Local.with_ymd_and_hms(2026, 3, 4, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_cron_wildcards_match_everything() {
        assert!(cron_matches("* * * * *", &at(10, 30)));
    }

    #[test]
    fn test_cron_literal_fields() {
        let now = at(10, 30);
        assert!(cron_matches("30 10 4 3 3", &now));
        assert!(cron_matches("30 * * * *", &now));
        assert!(!cron_matches("31 * * * *", &now));
        assert!(!cron_matches("30 11 * * *", &now));
        assert!(!cron_matches("* * * * 0", &now));
    }

    #[test]
    fn test_cron_rejects_unsupported_syntax() {
        let now = at(10, 30);
        assert!(!cron_matches("*/5 * * * *", &now));
        assert!(!cron_matches("1-5 * * * *", &now));
        assert!(!cron_matches("* * * *", &now));
        assert!(!cron_matches("* * * * * *", &now));
    }

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn call(
            &self,
            _request: &FunctionRequest,
            _context: &FunctionContext,
        ) -> Result<HandlerOutput> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutput::value(json!(null)))
        }
    }

    fn scheduled_record(
        name: &str,
        crons: &[&str],
        run_once: bool,
        count: Arc<AtomicUsize>,
    ) -> Arc<FunctionRecord> {
        Arc::new(FunctionRecord {
            name: name.to_string(),
            description: String::new(),
            triggers: crons
                .iter()
                .map(|cron| Trigger::Schedule {
                    cron: cron.to_string(),
                    name: None,
                })
                .collect(),
            handler: Arc::new(CountingHandler(count)),
            source_path: format!("{name}.ts").into(),
            env_vars: HashMap::new(),
            run_once,
            status: std::sync::RwLock::new(FunctionStatus::default()),
        })
    }

    fn scheduler(registry: &Arc<Registry>) -> Arc<Scheduler> {
        let backend = BackendClient::new("http://127.0.0.1:1", "test-key");
        let harness = Harness::new(registry.clone(), backend, Duration::from_secs(5));
        Arc::new(Scheduler::new(registry.clone(), harness))
    }

    #[tokio::test(start_paused = true)]
    async fn test_refire_window_bounds_fires_per_minute() {
        let registry = Arc::new(Registry::new());
        let count = Arc::new(AtomicUsize::new(0));
        registry.insert(scheduled_record("job", &["* * * * *"], false, count.clone()));
        let scheduler = scheduler(&registry);

        let now = at(9, 15);
        // Twelve 5-second ticks inside one matching minute.
        for _ in 0..12 {
            scheduler.tick(now);
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        // One fire at t=0; the 50s guard admits at most one more fire within
        // the same minute.
        assert!(count.load(Ordering::SeqCst) <= 2);
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_run_once_is_skipped() {
        let registry = Arc::new(Registry::new());
        let count = Arc::new(AtomicUsize::new(0));
        registry.insert(scheduled_record("seed", &["* * * * *"], true, count.clone()));
        registry.mark_completed("seed");
        let scheduler = scheduler(&registry);

        scheduler.tick(at(9, 15));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_cron_expressions_fire_independently() {
        let registry = Arc::new(Registry::new());
        let count = Arc::new(AtomicUsize::new(0));
        registry.insert(scheduled_record(
            "multi",
            &["* * * * *", "15 9 * * *"],
            false,
            count.clone(),
        ));
        let scheduler = scheduler(&registry);

        scheduler.tick(at(9, 15));
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Both expressions match 09:15 and fire concurrently.
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
