use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_between;
use crate::models::ResourceGroup;
use crate::{QueueError, QueueResult};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - tasks are rejected without executing
    Open,
    /// Circuit is half-open - a single probe is allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            other => Err(QueueError::validation(format!("未知的熔断状态: {other}"))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for CircuitState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for CircuitState {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<CircuitState>()
            .map_err(|_| format!("Invalid circuit state: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for CircuitState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed
    pub recovery_timeout: Duration,
    /// Growth factor applied to the recovery timeout after a failed probe
    pub backoff_multiplier: f64,
    /// Upper bound for the grown recovery timeout
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            backoff_multiplier: 1.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

/// How a task was let through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    /// The single half-open probe; its outcome decides the next state
    Probe,
}

/// Result of asking the breaker whether a task may start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed(Permit),
    Rejected { retry_after: Duration },
    /// Half-open with a probe already running; the task should stay queued
    ProbeInFlight,
}

/// Persisted form of a breaker, one row per resource group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub resource_group: ResourceGroup,
    pub session_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub failure_rate: f64,
}

/// Per-resource-group failure isolation state machine.
///
/// The breaker is plain data owned by a single scheduler; every method takes the
/// current wall-clock time so that recovery can be driven by any [`crate::Clock`].
/// Open -> HalfOpen happens lazily, the first time the breaker is consulted after
/// the recovery timeout has elapsed.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    resource_group: ResourceGroup,
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// Consecutive failures while closed
    failure_count: u32,
    /// Consecutive successes
    success_count: u32,
    total_requests: u64,
    total_failures: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    state_changed_at: DateTime<Utc>,
    current_recovery_timeout: Duration,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(
        resource_group: ResourceGroup,
        config: CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let current_recovery_timeout = config.recovery_timeout;
        Self {
            resource_group,
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            total_failures: 0,
            last_failure_time: None,
            last_success_time: None,
            state_changed_at: now,
            current_recovery_timeout,
            probe_in_flight: false,
        }
    }

    /// Rebuild a breaker from its persisted snapshot.
    ///
    /// A snapshot taken while a probe was running restores as Open with the
    /// original `state_changed_at`, so the next consultation starts a new probe.
    pub fn restore(snapshot: &CircuitBreakerSnapshot, config: CircuitBreakerConfig) -> Self {
        let state = match snapshot.state {
            CircuitState::HalfOpen => CircuitState::Open,
            other => other,
        };
        let current_recovery_timeout = Duration::from_millis(snapshot.recovery_timeout_ms)
            .clamp(config.recovery_timeout, config.max_recovery_timeout.max(config.recovery_timeout));
        Self {
            resource_group: snapshot.resource_group,
            config,
            state,
            failure_count: snapshot.failure_count,
            success_count: snapshot.success_count,
            total_requests: snapshot.total_requests,
            total_failures: snapshot.total_failures,
            last_failure_time: snapshot.last_failure_time,
            last_success_time: snapshot.last_success_time,
            state_changed_at: snapshot.state_changed_at,
            current_recovery_timeout,
            probe_in_flight: false,
        }
    }

    pub fn resource_group(&self) -> ResourceGroup {
        self.resource_group
    }

    /// Current state after applying a due Open -> HalfOpen transition
    pub fn state(&mut self, now: DateTime<Utc>) -> CircuitState {
        if self.state == CircuitState::Open
            && elapsed_between(self.state_changed_at, now) >= self.current_recovery_timeout
        {
            self.transition(CircuitState::HalfOpen, now);
        }
        self.state
    }

    /// Last computed state, without applying time-based transitions
    pub fn current_state(&self) -> CircuitState {
        self.state
    }

    /// Time left until a probe will be allowed, zero unless open
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        match self.state {
            CircuitState::Open => self
                .current_recovery_timeout
                .saturating_sub(elapsed_between(self.state_changed_at, now)),
            _ => Duration::ZERO,
        }
    }

    pub fn admit(&mut self, now: DateTime<Utc>) -> Admission {
        match self.state(now) {
            CircuitState::Closed => Admission::Allowed(Permit::Normal),
            CircuitState::Open => Admission::Rejected {
                retry_after: self.retry_after(now),
            },
            CircuitState::HalfOpen if self.probe_in_flight => Admission::ProbeInFlight,
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Admission::Allowed(Permit::Probe)
            }
        }
    }

    /// Build the error returned to callers while the circuit is open
    pub fn open_error(&self, now: DateTime<Utc>) -> QueueError {
        QueueError::circuit_open(
            self.resource_group.as_str(),
            self.retry_after(now).as_millis() as u64,
        )
    }

    /// Gate used at submission time: only an open circuit rejects
    pub fn check_admission(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        if self.state(now) == CircuitState::Open {
            Err(self.open_error(now))
        } else {
            Ok(())
        }
    }

    /// Give back a probe permit whose task never executed
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    pub fn record_success(&mut self, permit: Permit, now: DateTime<Utc>) {
        self.total_requests += 1;
        self.last_success_time = Some(now);
        self.success_count = self.success_count.saturating_add(1);

        match (self.state, permit) {
            (CircuitState::HalfOpen, Permit::Probe) => {
                self.probe_in_flight = false;
                self.failure_count = 0;
                self.current_recovery_timeout = self.config.recovery_timeout;
                self.transition(CircuitState::Closed, now);
            }
            (CircuitState::Closed, _) => {
                self.failure_count = 0;
            }
            _ => {}
        }
    }

    pub fn record_failure(&mut self, permit: Permit, now: DateTime<Utc>) {
        self.total_requests += 1;
        self.total_failures += 1;
        self.last_failure_time = Some(now);
        self.success_count = 0;

        match (self.state, permit) {
            (CircuitState::HalfOpen, Permit::Probe) => {
                self.probe_in_flight = false;
                self.current_recovery_timeout = self.grown_recovery_timeout();
                self.transition(CircuitState::Open, now);
            }
            (CircuitState::Closed, _) => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= self.config.failure_threshold {
                    self.transition(CircuitState::Open, now);
                }
            }
            _ => {}
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_requests as f64
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn snapshot(&self, session_id: &str) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            resource_group: self.resource_group,
            session_id: session_id.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            state_changed_at: self.state_changed_at,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.current_recovery_timeout.as_millis() as u64,
            total_requests: self.total_requests,
            total_failures: self.total_failures,
            failure_rate: self.failure_rate(),
        }
    }

    fn grown_recovery_timeout(&self) -> Duration {
        let grown = self
            .current_recovery_timeout
            .mul_f64(self.config.backoff_multiplier.max(1.0));
        grown.min(self.config.max_recovery_timeout.max(self.config.recovery_timeout))
    }

    fn transition(&mut self, to: CircuitState, now: DateTime<Utc>) {
        if self.state != to {
            self.state = to;
            self.state_changed_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(now: DateTime<Utc>) -> CircuitBreaker {
        CircuitBreaker::new(ResourceGroup::Network, CircuitBreakerConfig::default(), now)
    }

    fn secs(s: i64) -> chrono::Duration {
        chrono::Duration::seconds(s)
    }

    #[test]
    fn test_opens_after_threshold_consecutive_failures() {
        let t0 = Utc::now();
        let mut cb = breaker(t0);

        for _ in 0..4 {
            cb.record_failure(Permit::Normal, t0);
        }
        assert_eq!(cb.state(t0), CircuitState::Closed);

        cb.record_failure(Permit::Normal, t0);
        assert_eq!(cb.state(t0), CircuitState::Open);
        assert!(matches!(cb.admit(t0), Admission::Rejected { .. }));
        assert!(cb.check_admission(t0).unwrap_err().is_circuit_open());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let t0 = Utc::now();
        let mut cb = breaker(t0);

        for _ in 0..4 {
            cb.record_failure(Permit::Normal, t0);
        }
        cb.record_success(Permit::Normal, t0);
        for _ in 0..4 {
            cb.record_failure(Permit::Normal, t0);
        }
        assert_eq!(cb.state(t0), CircuitState::Closed);
        assert_eq!(cb.total_requests(), 9);
        assert_eq!(cb.total_failures(), 8);
    }

    #[test]
    fn test_half_open_allows_single_probe() {
        let t0 = Utc::now();
        let mut cb = breaker(t0);
        for _ in 0..5 {
            cb.record_failure(Permit::Normal, t0);
        }

        let before = t0 + secs(59);
        assert_eq!(cb.state(before), CircuitState::Open);
        assert_eq!(cb.retry_after(before), Duration::from_secs(1));

        let after = t0 + secs(60);
        assert_eq!(cb.admit(after), Admission::Allowed(Permit::Probe));
        assert_eq!(cb.state(after), CircuitState::HalfOpen);
        assert_eq!(cb.admit(after), Admission::ProbeInFlight);

        cb.record_success(Permit::Probe, after);
        assert_eq!(cb.state(after), CircuitState::Closed);
        assert_eq!(cb.admit(after), Admission::Allowed(Permit::Normal));
    }

    #[test]
    fn test_failed_probe_reopens_and_resets_timer() {
        let t0 = Utc::now();
        let mut cb = breaker(t0);
        for _ in 0..5 {
            cb.record_failure(Permit::Normal, t0);
        }

        let probe_time = t0 + secs(61);
        assert_eq!(cb.admit(probe_time), Admission::Allowed(Permit::Probe));
        cb.record_failure(Permit::Probe, probe_time);
        assert_eq!(cb.state(probe_time), CircuitState::Open);

        assert_eq!(cb.state(probe_time + secs(59)), CircuitState::Open);
        assert_eq!(cb.state(probe_time + secs(60)), CircuitState::HalfOpen);
    }

    #[test]
    fn test_backoff_multiplier_grows_recovery_timeout() {
        let t0 = Utc::now();
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(30),
        };
        let mut cb = CircuitBreaker::new(ResourceGroup::Filesystem, config, t0);
        cb.record_failure(Permit::Normal, t0);

        let mut now = t0 + secs(10);
        for expected in [20, 30, 30] {
            assert_eq!(cb.admit(now), Admission::Allowed(Permit::Probe));
            cb.record_failure(Permit::Probe, now);
            assert_eq!(cb.retry_after(now), Duration::from_secs(expected));
            now += secs(expected as i64);
        }
    }

    #[test]
    fn test_released_probe_can_be_reissued() {
        let t0 = Utc::now();
        let mut cb = breaker(t0);
        for _ in 0..5 {
            cb.record_failure(Permit::Normal, t0);
        }
        let later = t0 + secs(60);
        assert_eq!(cb.admit(later), Admission::Allowed(Permit::Probe));
        cb.release_probe();
        assert_eq!(cb.admit(later), Admission::Allowed(Permit::Probe));
    }

    #[test]
    fn test_late_completions_do_not_close_open_circuit() {
        let t0 = Utc::now();
        let mut cb = breaker(t0);
        for _ in 0..5 {
            cb.record_failure(Permit::Normal, t0);
        }
        cb.record_success(Permit::Normal, t0);
        assert_eq!(cb.state(t0), CircuitState::Open);
        assert_eq!(cb.total_requests(), 6);
        assert!(cb.snapshot("s").last_success_time.is_some());
    }

    #[test]
    fn test_snapshot_restore() {
        let t0 = Utc::now();
        let mut cb = breaker(t0);
        for _ in 0..5 {
            cb.record_failure(Permit::Normal, t0);
        }
        let snapshot = cb.snapshot("session-1");
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.total_failures, 5);
        assert_eq!(snapshot.failure_rate, 1.0);
        assert_eq!(snapshot.recovery_timeout_ms, 60_000);

        let mut restored = CircuitBreaker::restore(&snapshot, CircuitBreakerConfig::default());
        assert_eq!(restored.state(t0 + secs(1)), CircuitState::Open);
        assert_eq!(restored.state(t0 + secs(60)), CircuitState::HalfOpen);

        let mut half_open = snapshot.clone();
        half_open.state = CircuitState::HalfOpen;
        let restored = CircuitBreaker::restore(&half_open, CircuitBreakerConfig::default());
        assert_eq!(restored.current_state(), CircuitState::Open);
    }
}
