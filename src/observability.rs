use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Remote operations counted by `GatewayMetrics`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOperation {
    Register,
    Login,
    SubmitSecondFactor,
    VerifyEmail,
    FetchFlowState,
    ReportFlowState,
}

impl GatewayOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayOperation::Register => "register",
            GatewayOperation::Login => "login",
            GatewayOperation::SubmitSecondFactor => "submit_second_factor",
            GatewayOperation::VerifyEmail => "verify_email",
            GatewayOperation::FetchFlowState => "fetch_flow_state",
            GatewayOperation::ReportFlowState => "report_flow_state",
        }
    }
}

/// Remote gateway usage metrics
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub total_requests: AtomicU64,
    pub failures: AtomicU64,
    pub register: AtomicU64,
    pub login: AtomicU64,
    pub submit_second_factor: AtomicU64,
    pub verify_email: AtomicU64,
    pub fetch_flow_state: AtomicU64,
    pub report_flow_state: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, operation: GatewayOperation) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.counter(operation).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls(&self, operation: GatewayOperation) -> u64 {
        self.counter(operation).load(Ordering::Relaxed)
    }

    fn counter(&self, operation: GatewayOperation) -> &AtomicU64 {
        match operation {
            GatewayOperation::Register => &self.register,
            GatewayOperation::Login => &self.login,
            GatewayOperation::SubmitSecondFactor => &self.submit_second_factor,
            GatewayOperation::VerifyEmail => &self.verify_email,
            GatewayOperation::FetchFlowState => &self.fetch_flow_state,
            GatewayOperation::ReportFlowState => &self.report_flow_state,
        }
    }

    pub fn get_stats(&self) -> GatewayStats {
        GatewayStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            fetches: self.fetch_flow_state.load(Ordering::Relaxed),
            reports: self.report_flow_state.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Gateway metrics: requests={}, failures={}, fetches={}, reports={}",
            stats.total_requests, stats.failures, stats.fetches, stats.reports
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub failures: u64,
    pub fetches: u64,
    pub reports: u64,
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
