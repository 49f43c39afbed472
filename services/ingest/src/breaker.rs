//! Circuit breaker guarding calls to the accounting API.
//!
//! States:
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls fail fast until the cooldown elapses
//! - HalfOpen: exactly one trial call is in flight; only its outcome, matched
//!   by probe id, closes or re-opens the circuit
//!
//! Every failed trial doubles the next cooldown up to `max_cooldown`. The
//! multiplier drops back to 1 only after `stable_successes` consecutive
//! successes while closed. Transitions hold a short mutex and never span a
//! network call.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_common::error::TallyResult;
use tally_common::types::ResourceType;
use tally_config::parse_var_or;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Answer to "may I call the upstream now?". The caller hands it back with
/// the outcome so a trial result can be told apart from a late ordinary one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open probe. The caller must report its outcome.
    Trial { probe: u64 },
    Denied { retry_in: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }

    pub fn is_trial(&self) -> bool {
        matches!(self, Self::Trial { .. })
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    /// Consecutive closed-state successes that reset the backoff multiplier.
    pub stable_successes: u32,
    /// A trial that never reports back is abandoned after this long.
    pub probe_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(960),
            stable_successes: 5,
            probe_timeout: Duration::from_secs(90),
        }
    }
}

impl BreakerConfig {
    pub fn from_env() -> TallyResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            failure_threshold: parse_var_or(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )?
            .max(1),
            cooldown: Duration::from_secs(parse_var_or(
                "BREAKER_COOLDOWN_SECS",
                defaults.cooldown.as_secs(),
            )?),
            max_cooldown: Duration::from_secs(parse_var_or(
                "BREAKER_MAX_COOLDOWN_SECS",
                defaults.max_cooldown.as_secs(),
            )?),
            stable_successes: parse_var_or(
                "BREAKER_STABLE_SUCCESSES",
                defaults.stable_successes,
            )?
            .max(1),
            probe_timeout: Duration::from_secs(parse_var_or(
                "BREAKER_PROBE_TIMEOUT_SECS",
                defaults.probe_timeout.as_secs(),
            )?),
        })
    }
}

/// Read-only snapshot for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cooldown_remaining_secs: u64,
    pub next_cooldown_secs: u64,
    pub open_until: Option<DateTime<Utc>>,
}

/// The gate every upstream call passes through.
pub trait Gate: Send + Sync {
    fn allow(&self) -> Admission;
    fn record_success(&self, admission: Admission);
    fn record_failure(&self, admission: Admission, error: &str);
    fn status(&self) -> BreakerStatus;
    /// Operator override: force `Closed` and clear the backoff.
    fn reset(&self);
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    closed_successes: u32,
    backoff: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    open_until: Option<DateTime<Utc>>,
    probe_started_at: Option<DateTime<Utc>>,
    /// Id of the trial currently allowed to decide `HalfOpen`.
    probe: Option<u64>,
    /// Last issued probe id; survives resets so stale ids never match.
    probe_seq: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            closed_successes: 0,
            backoff: 1,
            last_failure_at: None,
            last_error: None,
            open_until: None,
            probe_started_at: None,
            probe: None,
            probe_seq: 0,
        }
    }

    fn start_probe(&mut self, now: DateTime<Utc>) -> Admission {
        self.probe_seq = self.probe_seq.wrapping_add(1);
        self.probe = Some(self.probe_seq);
        self.probe_started_at = Some(now);
        Admission::Trial {
            probe: self.probe_seq,
        }
    }

    /// Whether `admission` is the trial that currently owns `HalfOpen`.
    fn owns_trial(&self, admission: Admission) -> bool {
        match admission {
            Admission::Trial { probe } => {
                self.state == CircuitState::HalfOpen && self.probe == Some(probe)
            }
            _ => false,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // The state is plain data; a panic mid-transition leaves it usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cooldown_for(&self, backoff: u32) -> Duration {
        self.config
            .cooldown
            .saturating_mul(backoff)
            .min(self.config.max_cooldown)
    }

    fn trip(&self, inner: &mut BreakerState, now: DateTime<Utc>) {
        let cooldown = self.cooldown_for(inner.backoff);
        let open_until = now + chrono::Duration::from_std(cooldown).unwrap_or_default();
        inner.state = CircuitState::Open;
        inner.open_until = Some(open_until);
        inner.probe_started_at = None;
        inner.probe = None;
        inner.closed_successes = 0;
        tracing::warn!(
            circuit = %self.name,
            cooldown_secs = cooldown.as_secs(),
            %open_until,
            "circuit opened"
        );
    }
}

fn remaining(until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or_default()
}

impl Gate for CircuitBreaker {
    fn allow(&self) -> Admission {
        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let until = inner.open_until.unwrap_or(now);
                if now < until {
                    return Admission::Denied {
                        retry_in: remaining(until, now),
                    };
                }
                inner.state = CircuitState::HalfOpen;
                tracing::info!(circuit = %self.name, "circuit half-open, admitting trial call");
                inner.start_probe(now)
            }
            CircuitState::HalfOpen => {
                let probe_timeout =
                    chrono::Duration::from_std(self.config.probe_timeout).unwrap_or_default();
                match inner.probe_started_at {
                    Some(started) if now < started + probe_timeout => Admission::Denied {
                        retry_in: remaining(started + probe_timeout, now),
                    },
                    _ => {
                        tracing::warn!(circuit = %self.name, "trial call never reported back, admitting another");
                        inner.start_probe(now)
                    }
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed if admission == Admission::Allowed => {
                inner.consecutive_failures = 0;
                inner.closed_successes = inner.closed_successes.saturating_add(1);
                if inner.backoff > 1 && inner.closed_successes >= self.config.stable_successes {
                    inner.backoff = 1;
                    tracing::debug!(circuit = %self.name, "sustained success, backoff reset");
                }
            }
            CircuitState::HalfOpen if inner.owns_trial(admission) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.closed_successes = 0;
                inner.open_until = None;
                inner.probe_started_at = None;
                inner.probe = None;
                tracing::info!(circuit = %self.name, "circuit closed");
            }
            // Late result of a call admitted earlier, or of an abandoned trial.
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission, error: &str) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_failure_at = Some(now);
        inner.last_error = Some(error.to_string());

        match inner.state {
            CircuitState::Closed if admission == Admission::Allowed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.closed_successes = 0;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen if inner.owns_trial(admission) => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                let max = self.config.max_cooldown.as_secs().max(1);
                let base = self.config.cooldown.as_secs().max(1);
                if u64::from(inner.backoff) * base < max {
                    inner.backoff = inner.backoff.saturating_mul(2);
                }
                self.trip(&mut inner, now);
            }
            _ => {}
        }
    }

    fn status(&self) -> BreakerStatus {
        let now = self.clock.now();
        let inner = self.lock();
        let cooldown_remaining = match (inner.state, inner.open_until) {
            (CircuitState::Open, Some(until)) => remaining(until, now),
            _ => Duration::ZERO,
        };
        // While open, the next trip follows a failed trial and doubles.
        let next_backoff = match inner.state {
            CircuitState::Closed => inner.backoff,
            _ => inner.backoff.saturating_mul(2),
        };

        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            last_error: inner.last_error.clone(),
            cooldown_remaining_secs: cooldown_remaining.as_secs(),
            next_cooldown_secs: self.cooldown_for(next_backoff).as_secs(),
            open_until: inner.open_until,
        }
    }

    fn reset(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        *inner = BreakerState {
            probe_seq: inner.probe_seq,
            ..BreakerState::closed()
        };
        tracing::info!(circuit = %self.name, %previous, "circuit reset by operator");
    }
}

/// One independent gate per accounting resource type.
#[derive(Clone)]
pub struct Breakers {
    customer: Arc<dyn Gate>,
    invoice: Arc<dyn Gate>,
    payment: Arc<dyn Gate>,
}

impl Breakers {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let make = |resource: ResourceType| -> Arc<dyn Gate> {
            Arc::new(CircuitBreaker::new(
                resource.as_str(),
                config.clone(),
                clock.clone(),
            ))
        };
        Self {
            customer: make(ResourceType::Customer),
            invoice: make(ResourceType::Invoice),
            payment: make(ResourceType::Payment),
        }
    }

    /// Substitute gates, e.g. deterministic doubles in tests.
    pub fn from_gates(
        customer: Arc<dyn Gate>,
        invoice: Arc<dyn Gate>,
        payment: Arc<dyn Gate>,
    ) -> Self {
        Self {
            customer,
            invoice,
            payment,
        }
    }

    pub fn gate(&self, resource: ResourceType) -> &Arc<dyn Gate> {
        match resource {
            ResourceType::Customer => &self.customer,
            ResourceType::Invoice => &self.invoice,
            ResourceType::Payment => &self.payment,
        }
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        ResourceType::SYNC_ORDER
            .iter()
            .map(|r| self.gate(*r).status())
            .collect()
    }
}
