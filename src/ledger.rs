//! Usage ledger: tokens, cost and issues for one document run.
//!
//! Every phase executor writes here: usage after each model call (successful
//! or not), an [`IssueRecord`] for every non-fatal failure, a warning for
//! merge inconsistencies. Page tasks run concurrently, so all state sits
//! behind a single mutex and callers only ever see `&self` methods.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──▶ start_run ──▶ log_usage / log_error / log_warning … ──▶ end_run
//!                                                                  │
//!                                             (idempotent, cached) ◀┘
//! ```
//!
//! `end_run` computes the final [`ExtractionMetrics`] once and caches it.
//! Later calls return the cached snapshot, and writes arriving after
//! finalisation are ignored. [`LedgerGuard`] calls `end_run` on drop so a run
//! that is cancelled mid-flight still finalises with whatever it collected.

use crate::error::PageError;
use crate::model::{AgentUsage, ExtractionMetrics, IssueRecord, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Token usage & rates ──────────────────────────────────────────────────

/// Tokens consumed by one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// Price of one model in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Static per-model rate table.
///
/// Lookup is exact first, then the longest registered prefix (so
/// `claude-sonnet-4-20250514` prices as `claude-sonnet-4`). Unknown models
/// cost nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    rates: BTreeMap<String, ModelRate>,
}

impl Default for RateTable {
    fn default() -> Self {
        Self::empty()
            .with_rate("gpt-4.1-nano", 0.10, 0.40)
            .with_rate("gpt-4.1-mini", 0.40, 1.60)
            .with_rate("gpt-4.1", 2.00, 8.00)
            .with_rate("gpt-4o", 2.50, 10.00)
            .with_rate("gpt-4o-mini", 0.15, 0.60)
            .with_rate("claude-sonnet-4", 3.00, 15.00)
            .with_rate("gemini-2.0-flash", 0.10, 0.40)
            .with_rate("gemini-2.5-flash", 0.075, 0.30)
            .with_rate("gemini-1.5-flash", 0.075, 0.30)
            .with_rate("gemini-1.5-pro", 1.25, 5.00)
    }
}

impl RateTable {
    /// A table with no entries; every model costs zero.
    pub fn empty() -> Self {
        Self {
            rates: BTreeMap::new(),
        }
    }

    pub fn with_rate(mut self, model: impl Into<String>, input: f64, output: f64) -> Self {
        self.rates.insert(
            model.into(),
            ModelRate {
                input_per_million: input,
                output_per_million: output,
            },
        );
        self
    }

    pub fn rate_for(&self, model: &str) -> Option<ModelRate> {
        if let Some(rate) = self.rates.get(model) {
            return Some(*rate);
        }
        self.rates
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, rate)| *rate)
    }

    /// USD cost of `usage` on `model`.
    pub fn cost(&self, model: &str, usage: TokenUsage) -> f64 {
        self.rate_for(model).map_or(0.0, |r| {
            (usage.input_tokens as f64 * r.input_per_million
                + usage.output_tokens as f64 * r.output_per_million)
                / 1_000_000.0
        })
    }
}

// ── Ledger ───────────────────────────────────────────────────────────────

/// Counts the orchestrator reports just before finalising.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub pages_processed: usize,
    pub questions_extracted: usize,
    pub diagrams_extracted: usize,
    pub answers_merged: usize,
}

#[derive(Debug, Clone)]
struct UsageRecord {
    agent: String,
    operation: String,
    model: String,
    usage: TokenUsage,
}

#[derive(Debug, Default)]
struct LedgerState {
    run_id: Option<String>,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    records: Vec<UsageRecord>,
    errors: Vec<IssueRecord>,
    warnings: Vec<IssueRecord>,
    agents: Vec<String>,
    counts: RunCounts,
    finalized: Option<ExtractionMetrics>,
}

/// Concurrency-safe usage and issue accumulator for one document run.
#[derive(Debug)]
pub struct UsageLedger {
    rates: RateTable,
    state: Mutex<LedgerState>,
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new(RateTable::default())
    }
}

impl UsageLedger {
    pub fn new(rates: RateTable) -> Self {
        Self {
            rates,
            state: Mutex::new(LedgerState::default()),
        }
    }

    // A panicking page task must not take accounting down with it.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the run and return its id. A second call returns the same id.
    pub fn start_run(&self) -> String {
        let mut state = self.lock();
        if let Some(id) = &state.run_id {
            warn!("start_run called twice for run {}", id);
            return id.clone();
        }
        let id = Uuid::new_v4().to_string();
        state.run_id = Some(id.clone());
        state.started = Some(Instant::now());
        state.started_at = Some(Utc::now());
        debug!("Ledger run {} started", id);
        id
    }

    /// Record one model call's token usage.
    pub fn log_usage(&self, agent: &str, operation: &str, usage: TokenUsage, model: &str) {
        let mut state = self.lock();
        if state.finalized.is_some() {
            debug!("Ignoring usage from {}/{} after finalize", agent, operation);
            return;
        }
        push_agent(&mut state.agents, agent);
        state.records.push(UsageRecord {
            agent: agent.to_string(),
            operation: operation.to_string(),
            model: model.to_string(),
            usage,
        });
    }

    /// Record a non-fatal error.
    pub fn log_error(&self, agent: &str, phase: Phase, page: Option<usize>, message: impl Into<String>) {
        let message = message.into();
        warn!("[{}/{}] {}", agent, phase, message);
        let mut state = self.lock();
        if state.finalized.is_some() {
            return;
        }
        state.errors.push(IssueRecord {
            agent: agent.to_string(),
            phase,
            page,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Record a [`PageError`] as a non-fatal error on its page.
    pub fn log_page_error(&self, agent: &str, phase: Phase, error: &PageError) {
        self.log_error(agent, phase, Some(error.page()), error.to_string());
    }

    /// Record a non-fatal warning (e.g. an ambiguous multiple-choice key).
    pub fn log_warning(&self, agent: &str, phase: Phase, page: Option<usize>, message: impl Into<String>) {
        let message = message.into();
        debug!("[{}/{}] warning: {}", agent, phase, message);
        let mut state = self.lock();
        if state.finalized.is_some() {
            return;
        }
        state.warnings.push(IssueRecord {
            agent: agent.to_string(),
            phase,
            page,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Note that an agent took part in the run even if it made no calls.
    pub fn record_agent(&self, agent: &str) {
        let mut state = self.lock();
        if state.finalized.is_none() {
            push_agent(&mut state.agents, agent);
        }
    }

    /// Set the result counts reported in the final metrics.
    pub fn record_counts(&self, counts: RunCounts) {
        let mut state = self.lock();
        if state.finalized.is_none() {
            state.counts = counts;
        }
    }

    pub fn error_count(&self) -> usize {
        self.lock().errors.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized.is_some()
    }

    /// Running totals without finalising. After `end_run` this is the
    /// finalised snapshot.
    pub fn snapshot(&self) -> ExtractionMetrics {
        let state = self.lock();
        match &state.finalized {
            Some(done) => done.clone(),
            None => self.compute(&state, None),
        }
    }

    /// Finalise the run. Idempotent: later calls return the same snapshot.
    pub fn end_run(&self) -> ExtractionMetrics {
        let mut state = self.lock();
        if let Some(done) = &state.finalized {
            return done.clone();
        }
        let metrics = self.compute(&state, Some(Utc::now()));
        info!(
            "Run {} finalized: {} tokens, ${:.6}, {} errors",
            metrics.run_id,
            metrics.total_tokens,
            metrics.total_cost_usd,
            metrics.errors.len()
        );
        state.finalized = Some(metrics.clone());
        metrics
    }

    fn compute(&self, state: &LedgerState, finished_at: Option<DateTime<Utc>>) -> ExtractionMetrics {
        let mut by_agent: BTreeMap<&str, AgentUsage> = BTreeMap::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut total_cost = 0.0;

        for rec in &state.records {
            let cost = self.rates.cost(&rec.model, rec.usage);
            input_tokens += rec.usage.input_tokens;
            output_tokens += rec.usage.output_tokens;
            total_cost += cost;

            let entry = by_agent.entry(rec.agent.as_str()).or_insert_with(|| AgentUsage {
                agent: rec.agent.clone(),
                ..Default::default()
            });
            entry.calls += 1;
            entry.input_tokens += rec.usage.input_tokens;
            entry.output_tokens += rec.usage.output_tokens;
            entry.cost_usd += cost;
            debug!("usage {}/{}: {:?}", rec.agent, rec.operation, rec.usage);
        }

        ExtractionMetrics {
            run_id: state.run_id.clone().unwrap_or_default(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            total_cost_usd: total_cost,
            elapsed_ms: state
                .started
                .map_or(0, |t| t.elapsed().as_millis() as u64),
            pages_processed: state.counts.pages_processed,
            questions_extracted: state.counts.questions_extracted,
            diagrams_extracted: state.counts.diagrams_extracted,
            answers_merged: state.counts.answers_merged,
            agents_used: state.agents.clone(),
            usage_by_agent: by_agent.into_values().collect(),
            errors: state.errors.clone(),
            warnings: state.warnings.clone(),
            started_at: state.started_at,
            finished_at,
        }
    }
}

fn push_agent(agents: &mut Vec<String>, agent: &str) {
    if !agents.iter().any(|a| a == agent) {
        agents.push(agent.to_string());
    }
}

/// Finalises a ledger when dropped.
///
/// Held by the orchestrator for the duration of a document run. If the run
/// future is dropped (cancelled, timed out) the ledger still closes with the
/// partial data it has.
pub struct LedgerGuard {
    ledger: Arc<UsageLedger>,
}

impl LedgerGuard {
    pub fn new(ledger: Arc<UsageLedger>) -> Self {
        Self { ledger }
    }
}

impl Drop for LedgerGuard {
    fn drop(&mut self) {
        if !self.ledger.is_finalized() {
            debug!("Finalizing ledger from drop guard");
            self.ledger.end_run();
        }
    }
}
