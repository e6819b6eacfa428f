//! Worker pool feeding task ids to the executor.

use super::executor::{MigrationExecutor, TaskOutcome};
use super::task::TaskStore;
use crate::cancel::CancellationToken;
use crate::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Polls durable task state and hands runnable ids to `workers` executors.
#[derive(Clone)]
pub struct Dispatcher {
    executor: MigrationExecutor,
    tasks: TaskStore,
    workers: usize,
    tick: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Dispatcher {
    pub fn new(executor: MigrationExecutor, workers: usize, tick: Duration) -> Self {
        Self {
            tasks: executor.tasks().clone(),
            executor,
            workers: workers.max(1),
            tick,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Ids due now that no worker holds. Marks them in flight.
    fn claim_due(&self) -> Result<Vec<String>> {
        let now = Utc::now().timestamp();
        let rearmed = self.tasks.rearm_due(now)?;
        if rearmed > 0 {
            debug!("Re-armed {} failed tasks", rearmed);
        }

        let runnable = self.tasks.runnable(now)?;
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(runnable
            .into_iter()
            .filter(|t| in_flight.insert(t.id.clone()))
            .map(|t| t.id)
            .collect())
    }

    fn release(&self, id: &str) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(id);
        }
    }

    async fn run_one(&self, id: String, cancel: &CancellationToken) -> (String, TaskOutcome) {
        let outcome = match self.executor.execute(&id, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Task {} could not be executed: {}", id, e);
                TaskOutcome::Deferred
            }
        };
        self.release(&id);
        (id, outcome)
    }

    /// Run every task due now once, `workers` at a time.
    pub async fn run_due(&self, cancel: &CancellationToken) -> Result<Vec<(String, TaskOutcome)>> {
        let ids = self.claim_due()?;
        Ok(stream::iter(ids)
            .map(|id| self.run_one(id, cancel))
            .buffer_unordered(self.workers)
            .collect()
            .await)
    }

    /// Run [`run_due`](Self::run_due) until nothing is due, at most
    /// `max_rounds` times.
    pub async fn drain(
        &self,
        cancel: &CancellationToken,
        max_rounds: usize,
    ) -> Result<Vec<(String, TaskOutcome)>> {
        let mut outcomes = Vec::new();
        for _ in 0..max_rounds {
            let round = self.run_due(cancel).await?;
            if round.is_empty() {
                break;
            }
            outcomes.extend(round);
            if cancel.is_cancelled() {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Dispatch until cancelled. Workers finish their current phase, then
    /// exit.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Migration dispatcher started with {} workers", self.workers);
        let (tx, rx) = mpsc::channel::<String>(self.workers * 4);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let rx = Arc::clone(&rx);
            let this = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(id) = next else {
                        break;
                    };
                    let (id, outcome) = this.run_one(id, &cancel).await;
                    debug!("Worker {} finished task {}: {:?}", worker, id, outcome);
                }
            }));
        }

        loop {
            match self.claim_due() {
                Ok(ids) => {
                    for id in ids {
                        if tx.send(id).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => warn!("Failed to poll migration tasks: {}", e),
            }
            if !cancel.sleep(self.tick).await {
                break;
            }
        }

        drop(tx);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Migration worker panicked: {}", e);
            }
        }
        info!("Migration dispatcher stopped");
    }
}
