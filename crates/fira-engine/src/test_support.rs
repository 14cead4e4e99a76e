//! Scripted tool invoker for exercising the engine without subprocesses.
//!
//! `ScriptedInvoker` answers each basket from a queue of canned steps, so a
//! test can make one basket time out, another fail once and then succeed,
//! and a third block until the test opens its gate.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fira_mcp::{ToolCall, ToolError, ToolInvoker, DEFAULT_CALL_SLACK};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

/// One scripted answer to a tool call.
#[derive(Debug, Clone)]
pub enum Step {
    Respond(Value),
    Fail(FailureKind),
    /// Sleep before taking the next step.
    Delay(Duration, Box<Step>),
    /// Block until the gate has a permit, then take the next step.
    Gated(Arc<Semaphore>, Box<Step>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Launch,
    Timeout,
    Protocol,
    Handshake,
    Payload,
}

impl FailureKind {
    fn to_error(self, call: &ToolCall) -> ToolError {
        let detail = format!("scripted failure for {}", call.basket);
        match self {
            Self::Launch => ToolError::Launch(detail),
            Self::Timeout => ToolError::Timeout(call.timeout),
            Self::Protocol => ToolError::Protocol(detail),
            Self::Handshake => ToolError::Handshake(detail),
            Self::Payload => ToolError::Payload(detail),
        }
    }
}

/// A [`ToolInvoker`] that replays scripted steps per basket.
///
/// Each basket's queue is consumed in order; the last step repeats once the
/// queue is down to one. Baskets without a script fail with a launch error.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<ToolCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_slack: Option<Duration>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script every default basket with a healthy two-source payload.
    pub fn healthy() -> Self {
        let invoker = Self::new();
        for (basket, payload) in healthy_payloads() {
            invoker.push(basket, Step::Respond(payload));
        }
        invoker
    }

    /// Report `timeout + slack` as the longest a call may run.
    pub fn with_call_slack(mut self, slack: Duration) -> Self {
        self.call_slack = Some(slack);
        self
    }

    /// Append a step to a basket's queue.
    pub fn push(&self, basket: &str, step: Step) -> &Self {
        self.lock_scripts()
            .entry(basket.to_string())
            .or_default()
            .push_back(step);
        self
    }

    /// Replace a basket's queue with a single step.
    pub fn set(&self, basket: &str, step: Step) -> &Self {
        self.lock_scripts()
            .insert(basket.to_string(), VecDeque::from([step]));
        self
    }

    pub fn respond(&self, basket: &str, payload: Value) -> &Self {
        self.set(basket, Step::Respond(payload))
    }

    pub fn fail(&self, basket: &str, kind: FailureKind) -> &Self {
        self.set(basket, Step::Fail(kind))
    }

    /// Hold the basket's current step behind a closed gate. Add permits to release it.
    pub fn gate(&self, basket: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        let mut scripts = self.lock_scripts();
        let queue = scripts.entry(basket.to_string()).or_default();
        let step = queue
            .pop_front()
            .unwrap_or(Step::Fail(FailureKind::Launch));
        queue.push_front(Step::Gated(gate.clone(), Box::new(step)));
        gate
    }

    /// Basket names in the order they were called, retries included.
    pub fn called_baskets(&self) -> Vec<String> {
        self.lock_calls().iter().map(|c| c.basket.clone()).collect()
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.lock_calls().clone()
    }

    pub fn call_count(&self, basket: &str) -> usize {
        self.lock_calls()
            .iter()
            .filter(|c| c.basket == basket)
            .count()
    }

    /// Highest number of calls that were running at the same moment.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, basket: &str) -> Option<Step> {
        let mut scripts = self.lock_scripts();
        let queue = scripts.get_mut(basket)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Step>>> {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<ToolCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn play(&self, mut step: Step, call: &ToolCall) -> Result<Value, ToolError> {
        loop {
            step = match step {
                Step::Respond(payload) => return Ok(payload),
                Step::Fail(kind) => return Err(kind.to_error(call)),
                Step::Delay(duration, next) => {
                    tokio::time::sleep(duration).await;
                    *next
                }
                Step::Gated(gate, next) => {
                    // A closed semaphore also releases the call.
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    *next
                }
            };
        }
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(&self, call: ToolCall) -> Result<Value, ToolError> {
        self.lock_calls().push(call.clone());
        let Some(step) = self.next_step(&call.basket) else {
            return Err(ToolError::Launch(format!(
                "no script for basket {}",
                call.basket
            )));
        };

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let outcome = self.play(step, &call).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn max_call_duration(&self, timeout: Duration) -> Duration {
        timeout + self.call_slack.unwrap_or(DEFAULT_CALL_SLACK)
    }
}

/// Wrap per-source sections in the `{"sources": {...}}` envelope.
pub fn sources_payload(sections: &[(&str, Value)]) -> Value {
    let sources: serde_json::Map<String, Value> = sections
        .iter()
        .map(|(name, section)| (name.to_string(), section.clone()))
        .collect();
    json!({ "sources": sources })
}

/// Realistic payloads for the six default baskets, every manifest satisfied.
pub fn healthy_payloads() -> Vec<(&'static str, Value)> {
    vec![
        (
            "fundamentals",
            sources_payload(&[
                ("sec_edgar", json!({"data": {
                    "revenue": {"value": 391_035_000_000u64, "end_date": "2024-09-28", "form": "10-K"},
                    "net_income": {"value": 93_736_000_000u64, "end_date": "2024-09-28"},
                    "eps": {"value": 6.11, "end_date": "2024-09-28"},
                    "debt_to_equity": null
                }})),
                ("yahoo_finance", json!({"data": {
                    "revenue": 391_035_000_000u64,
                    "debt_to_equity": 1.87
                }})),
            ]),
        ),
        (
            "valuation",
            sources_payload(&[
                ("yahoo_finance", json!({"data": {"trailing_pe": 37.2, "pb_ratio": 60.1, "ps_ratio": 9.4}})),
                ("alpha_vantage", json!({"data": {"trailing_pe": 37.0}})),
            ]),
        ),
        (
            "volatility",
            sources_payload(&[
                ("yahoo_finance", json!({"data": {"beta": 1.24}})),
                ("alpha_vantage", json!({"data": {"beta": 1.25}})),
                ("fred", json!({"data": {"vix": {"value": 16.8, "date": "2025-10-14"}}})),
            ]),
        ),
        (
            "macro",
            sources_payload(&[
                ("bea_bls", json!({"data": {
                    "gdp_growth": {"value": 4.3, "as_of": "2025-Q2"},
                    "cpi_inflation": {"value": 2.9, "as_of": "2025-08"}
                }})),
                ("fred", json!({"data": {
                    "gdp_growth": {"value": 4.1, "date": "2025-06-30"},
                    "interest_rate": {"value": 4.33, "date": "2025-09-30"}
                }})),
            ]),
        ),
        (
            "news",
            sources_payload(&[
                ("tavily", json!({"data": {"items": [
                    {"title": "Apple unveils new iPhone lineup", "datetime": "2025-09-09T17:00:00Z"},
                    {"title": "Apple services revenue hits record", "datetime": "2025-08-01T12:00:00Z"}
                ]}})),
                ("nyt", json!({"data": {"items": [
                    {"title": "Inside Apple's supply chain shift", "datetime": "2025-09-12T08:30:00Z"}
                ]}})),
            ]),
        ),
        (
            "sentiment",
            sources_payload(&[
                ("finnhub", json!({"data": {"items": [
                    {"headline": "Analysts raise AAPL targets", "datetime": 1_757_900_000, "sentiment": 0.6}
                ]}})),
                ("reddit", json!({"data": {"items": [
                    {"title": "AAPL earnings thread", "datetime": 1_757_800_000, "score": 412}
                ]}})),
            ]),
        ),
    ]
}
