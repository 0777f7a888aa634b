//! Scrape orchestration.
//!
//! One scrape runs every configured target concurrently and waits for all of
//! them, whatever their outcome. A failing or panicking target only affects
//! its own metrics.

use crate::collector::{Collector, TargetOutcome};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

/// Target name to shell command. Immutable once the exporter has started.
pub type Targets = BTreeMap<String, String>;

/// Runs one collection per target on every scrape.
pub struct Scraper {
    collector: Arc<Collector>,
    targets: Arc<Targets>,
}

impl Scraper {
    /// Create a scraper for `targets`.
    ///
    /// The collector counters of every target are created up front so that
    /// they are exported at zero.
    pub fn new(collector: Arc<Collector>, targets: Arc<Targets>) -> Self {
        for target in targets.keys() {
            collector.store().register_target(target);
        }
        Self { collector, targets }
    }

    /// Configured targets.
    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    /// Collect every target once.
    ///
    /// Returns one outcome per target, sorted by target name.
    pub async fn run_scrape(&self) -> Vec<TargetOutcome> {
        let start = Instant::now();
        let mut tasks = JoinSet::new();
        let mut names = HashMap::with_capacity(self.targets.len());

        for (target, command) in self.targets.iter() {
            let collector = Arc::clone(&self.collector);
            let task_target = target.clone();
            let task_command = command.clone();

            let handle = tasks.spawn(async move {
                collector.collect(&task_target, &task_command).await
            });
            names.insert(handle.id(), target.clone());
        }

        let mut outcomes = Vec::with_capacity(self.targets.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => outcomes.push(outcome),
                Err(e) => {
                    let target = names.remove(&e.id()).unwrap_or_default();
                    outcomes.push(self.aborted(target, &e));
                }
            }
        }
        outcomes.sort_by(|a, b| a.target.cmp(&b.target));

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(
            "Scrape finished: {} targets, {} failed, took {:?}",
            outcomes.len(),
            failed,
            start.elapsed()
        );

        outcomes
    }

    /// Count a collection task that panicked or was cancelled as a failure of
    /// its target.
    fn aborted(&self, target: String, error: &JoinError) -> TargetOutcome {
        self.collector.store().record_exception(&target);
        error!("Collector for target {} aborted: {}", target, error);
        TargetOutcome::failed(target)
    }
}
