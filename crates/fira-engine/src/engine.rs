use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use fira_mcp::{ToolError, ToolInvoker};
use fira_models::{BasketConfig, EngineConfig, EventOutcome, PartialEvent, Task, TaskId, TaskStatus};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregate;
use crate::basket::{validate_baskets, Basket, BasketCall, BasketResult};
use crate::error::EngineError;
use crate::store::{TaskSlot, TaskStore};

/// Runs research tasks in the background and keeps their state queryable.
///
/// Each task walks the configured baskets strictly in order, one tool server
/// at a time, appending a partial event after every basket.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    baskets: Vec<Basket>,
    invoker: Arc<dyn ToolInvoker>,
    store: TaskStore,
    call_permits: Option<Arc<Semaphore>>,
}

impl TaskEngine {
    pub fn new(
        config: EngineConfig,
        baskets: &[BasketConfig],
        invoker: Arc<dyn ToolInvoker>,
    ) -> Result<Self, EngineError> {
        if config.conflict_tolerance.is_sign_negative() {
            return Err(EngineError::Config(format!(
                "conflict_tolerance must not be negative, got {}",
                config.conflict_tolerance
            )));
        }
        if config.basket_timeout_seconds == 0 {
            return Err(EngineError::Config(
                "basket_timeout_seconds must be positive".to_string(),
            ));
        }
        if config.max_concurrent_calls == Some(0) {
            return Err(EngineError::Config(
                "max_concurrent_calls must be positive when set".to_string(),
            ));
        }
        if config.max_tasks == 0 {
            return Err(EngineError::Config("max_tasks must be positive".to_string()));
        }
        if config.task_ttl_seconds == 0 {
            return Err(EngineError::Config(
                "task_ttl_seconds must be positive".to_string(),
            ));
        }

        let baskets = validate_baskets(baskets)?;
        let store = TaskStore::new(
            config.max_tasks,
            Duration::from_secs(config.task_ttl_seconds),
        );
        let call_permits = config
            .max_concurrent_calls
            .map(|limit| Arc::new(Semaphore::new(limit)));

        info!(
            baskets = baskets.len(),
            retry_attempts = config.retry_attempts,
            pacing_delay_ms = config.pacing_delay_ms,
            "Task engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                baskets,
                invoker,
                store,
                call_permits,
            }),
        })
    }

    /// Basket names in execution order.
    pub fn basket_names(&self) -> Vec<String> {
        self.inner
            .baskets
            .iter()
            .map(|b| b.name().to_string())
            .collect()
    }

    /// Create a task and start working on it in the background.
    ///
    /// Returns as soon as the task is stored; the caller polls [`Self::status`].
    pub async fn submit(&self, ticker: &str, company_name: &str) -> TaskId {
        let ticker = ticker.trim().to_uppercase();
        let task = Task::new(&ticker, company_name.trim());
        let id = task.id;
        let slot = self.inner.store.insert(task).await;

        info!(task_id = %id, %ticker, "Task submitted");
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(slot).await });
        id
    }

    /// A snapshot of the task as it is right now.
    pub async fn status(&self, id: &TaskId) -> Result<Task, EngineError> {
        self.inner
            .store
            .snapshot(id)
            .await
            .ok_or(EngineError::TaskNotFound(*id))
    }

    /// Ask a task to stop at the next basket boundary.
    ///
    /// The basket in flight is allowed to finish and its event is still
    /// recorded. Cancelling a finished task changes nothing. Returns the
    /// status at the time of the request.
    pub async fn cancel(&self, id: &TaskId) -> Result<TaskStatus, EngineError> {
        let slot = self
            .inner
            .store
            .get(id)
            .await
            .ok_or(EngineError::TaskNotFound(*id))?;

        let status = slot.update(|task| {
            if !task.status.is_terminal() && !task.cancel_requested {
                task.cancel_requested = true;
                task.updated_at = Utc::now();
            }
            task.status
        });
        if !status.is_terminal() {
            slot.cancel_token().cancel();
            info!(task_id = %id, %status, "Cancellation requested");
        }
        Ok(status)
    }

    /// Poll until the task reaches a terminal status.
    pub async fn wait(&self, id: &TaskId, poll_interval: Duration) -> Result<Task, EngineError> {
        loop {
            let task = self.status(id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Approximate number of tasks held in the store.
    pub fn task_count(&self) -> u64 {
        self.inner.store.len()
    }
}

impl EngineInner {
    async fn run(&self, slot: Arc<TaskSlot>) {
        let task_id = slot.read(|t| t.id);
        self.work(&slot).await;
        self.store.retire(&task_id).await;
    }

    async fn work(&self, slot: &TaskSlot) {
        let started = Instant::now();
        let (task_id, ticker, company_name) =
            slot.read(|t| (t.id, t.ticker.clone(), t.company_name.clone()));
        let cancel = slot.cancel_token().clone();

        if !slot.update(|t| t.transition(TaskStatus::Working)) {
            return;
        }

        let mut aggregate = Aggregate::new(&ticker, &company_name, self.config.conflict_tolerance);
        let pacing = Duration::from_millis(self.config.pacing_delay_ms);

        for (index, basket) in self.baskets.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let call = self
                .call_basket(basket, &ticker, &company_name, &cancel)
                .await;
            let event = match call.outcome {
                Ok(result) => {
                    let fold = aggregate.record_success(basket, result);
                    info!(
                        task_id = %task_id,
                        basket = %call.basket,
                        found = fold.completeness.found,
                        required = fold.completeness.required,
                        fallback_used = fold.fallback_used,
                        attempts = call.attempts,
                        elapsed_ms = call.elapsed.as_millis() as u64,
                        "Basket complete"
                    );
                    PartialEvent {
                        sequence: 0,
                        basket: call.basket,
                        outcome: EventOutcome::Succeeded,
                        metrics: fold.metrics,
                        completeness: fold.completeness,
                        fallback_used: fold.fallback_used,
                        error: None,
                        emitted_at: Utc::now(),
                    }
                }
                Err(error) => {
                    warn!(
                        task_id = %task_id,
                        basket = %call.basket,
                        command = %call.command,
                        kind = error.kind(),
                        error = %error,
                        attempts = call.attempts,
                        elapsed_ms = call.elapsed.as_millis() as u64,
                        "Basket failed"
                    );
                    let completeness = aggregate.record_failure(basket, &error, call.attempts);
                    PartialEvent {
                        sequence: 0,
                        basket: call.basket,
                        outcome: EventOutcome::Failed,
                        metrics: Default::default(),
                        completeness,
                        fallback_used: false,
                        error: Some(error.to_string()),
                        emitted_at: Utc::now(),
                    }
                }
            };
            slot.update(|t| t.push_event(event));

            let is_last = index + 1 == self.baskets.len();
            if !is_last && !pacing.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pacing) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if cancel.is_cancelled() {
            let events = slot.update(|t| {
                t.transition(TaskStatus::Canceled);
                t.partial_events.len()
            });
            info!(task_id = %task_id, events, elapsed_ms, "Task canceled");
        } else if aggregate.all_failed() {
            let summary = aggregate.failure_summary();
            warn!(task_id = %task_id, elapsed_ms, error = %summary, "Task failed");
            slot.update(|t| t.fail(summary));
        } else {
            let report = aggregate.finish();
            info!(
                task_id = %task_id,
                available = report.sources_available.len(),
                failed = report.sources_failed.len(),
                conflicts = report.conflicts.len(),
                completeness = %report.completeness.percentage,
                elapsed_ms,
                "Task completed"
            );
            slot.update(|t| t.complete(report));
        }
    }

    /// Call one basket, retrying failed attempts up to the configured limit.
    /// No retry starts once cancellation has been requested.
    async fn call_basket(
        &self,
        basket: &Basket,
        ticker: &str,
        company_name: &str,
        cancel: &CancellationToken,
    ) -> BasketCall {
        let timeout = basket.timeout(Duration::from_secs(self.config.basket_timeout_seconds));
        let started = Instant::now();
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            match self.invoke_once(basket, ticker, company_name, timeout).await {
                Ok(result) => break Ok(result),
                Err(error) if attempts <= self.config.retry_attempts && !cancel.is_cancelled() => {
                    debug!(
                        basket = basket.name(),
                        attempt = attempts,
                        error = %error,
                        "Basket attempt failed, retrying"
                    );
                }
                Err(error) => break Err(error),
            }
        };

        BasketCall {
            basket: basket.name().to_string(),
            command: basket.config().command.clone(),
            tool: basket.config().tool.clone(),
            timeout,
            attempts,
            elapsed: started.elapsed(),
            outcome,
        }
    }

    async fn invoke_once(
        &self,
        basket: &Basket,
        ticker: &str,
        company_name: &str,
        timeout: Duration,
    ) -> Result<BasketResult, ToolError> {
        let _permit = match &self.call_permits {
            Some(permits) => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| ToolError::Launch(format!("call limiter closed: {e}")))?,
            ),
            None => None,
        };

        let fetch = basket.fetch(self.invoker.as_ref(), ticker, company_name, timeout);
        let guard = self.invoker.max_call_duration(timeout);
        match tokio::time::timeout(guard, fetch).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolError::Timeout(timeout)),
        }
    }
}
