//! Host metrics for monitoring registrations, resolution and calls.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::{error::McpError, inventory::QualifiedName};

/// How a registration attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Success,
    Failure,
    Timeout,
    Duplicate,
}

/// Metrics for host operations.
pub struct HostMetrics {
    // Registration metrics
    registrations: AtomicU64,
    registration_failures: AtomicU64,
    registration_timeouts: AtomicU64,
    duplicate_registrations: AtomicU64,
    active_servers: AtomicU64,

    // Resolution metrics
    not_found: AtomicU64,
    ambiguous: AtomicU64,
    permission_denied: AtomicU64,

    // Call metrics
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    active_executions: AtomicU64,

    // Per-tool latency tracking
    tool_latencies: DashMap<QualifiedName, LatencyStats>,
}

impl HostMetrics {
    pub fn new() -> Self {
        Self {
            registrations: AtomicU64::new(0),
            registration_failures: AtomicU64::new(0),
            registration_timeouts: AtomicU64::new(0),
            duplicate_registrations: AtomicU64::new(0),
            active_servers: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            ambiguous: AtomicU64::new(0),
            permission_denied: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            active_executions: AtomicU64::new(0),
            tool_latencies: DashMap::new(),
        }
    }

    pub fn record_registration(&self, outcome: RegistrationOutcome) {
        let counter = match outcome {
            RegistrationOutcome::Success => {
                self.active_servers.fetch_add(1, Ordering::Relaxed);
                &self.registrations
            }
            RegistrationOutcome::Failure => &self.registration_failures,
            RegistrationOutcome::Timeout => &self.registration_timeouts,
            RegistrationOutcome::Duplicate => &self.duplicate_registrations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unregistration(&self) {
        let _ = self
            .active_servers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Count a resolution failure, if `error` is one.
    pub fn record_resolution_error(&self, error: &McpError) {
        let counter = match error {
            McpError::ToolNotFound(_)
            | McpError::PromptNotFound(_)
            | McpError::ResourceNotFound(_) => &self.not_found,
            McpError::Ambiguous { .. } => &self.ambiguous,
            McpError::PermissionDenied { .. } => &self.permission_denied,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the start of a tool call.
    pub fn record_call_start(&self, _tool: &QualifiedName) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.active_executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a tool call.
    pub fn record_call_end(&self, tool: &QualifiedName, success: bool, duration_ms: u64) {
        self.active_executions.fetch_sub(1, Ordering::Relaxed);

        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }

        self.tool_latencies
            .entry(tool.clone())
            .or_insert_with(LatencyStats::new)
            .record(duration_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            registrations: self.registrations.load(Ordering::Relaxed),
            registration_failures: self.registration_failures.load(Ordering::Relaxed),
            registration_timeouts: self.registration_timeouts.load(Ordering::Relaxed),
            duplicate_registrations: self.duplicate_registrations.load(Ordering::Relaxed),
            active_servers: self.active_servers.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            ambiguous: self.ambiguous.load(Ordering::Relaxed),
            permission_denied: self.permission_denied.load(Ordering::Relaxed),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            active_executions: self.active_executions.load(Ordering::Relaxed),
        }
    }

    pub fn tool_latency(&self, tool: &QualifiedName) -> Option<LatencySnapshot> {
        self.tool_latencies.get(tool).map(|stats| stats.snapshot())
    }

    pub fn all_tool_latencies(&self) -> Vec<(QualifiedName, LatencySnapshot)> {
        self.tool_latencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tool latency statistics.
pub struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);

        LatencySnapshot {
            count,
            avg_ms: if count > 0 { total / count } else { 0 },
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub registrations: u64,
    pub registration_failures: u64,
    pub registration_timeouts: u64,
    pub duplicate_registrations: u64,
    pub active_servers: u64,
    pub not_found: u64,
    pub ambiguous: u64,
    pub permission_denied: u64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub active_executions: u64,
}

impl MetricsSnapshot {
    /// Calculate success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_calls + self.failed_calls;
        if completed == 0 {
            100.0
        } else {
            (self.successful_calls as f64 / completed as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}
