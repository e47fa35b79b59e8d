// Metrics and logging decorator for any FlowGateway

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use super::{FlowGateway, FlowIdentity, GatewayError, LoginResponse, RemoteFlowState};
use crate::observability::{GatewayMetrics, GatewayOperation, OperationTimer};

/// Counts, times and logs every call to the wrapped gateway.
///
/// Calls pass through exactly once; failures are recorded, never retried.
#[derive(Debug)]
pub struct InstrumentedGateway<G> {
    inner: G,
    metrics: Arc<GatewayMetrics>,
}

impl<G: FlowGateway> InstrumentedGateway<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            metrics: Arc::new(GatewayMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        self.metrics.clone()
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    async fn observe<T, F>(&self, operation: GatewayOperation, call: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        self.metrics.record_request(operation);
        let timer = OperationTimer::new(operation.as_str());
        let result = call.await;
        timer.finish();

        if let Err(error) = &result {
            self.metrics.record_failure();
            warn!(operation = operation.as_str(), error = %error, "Gateway call failed");
        }
        result
    }
}

#[async_trait]
impl<G: FlowGateway> FlowGateway for InstrumentedGateway<G> {
    async fn register(&self, email: &str, password: &str, username: &str) -> Result<(), GatewayError> {
        self.observe(GatewayOperation::Register, self.inner.register(email, password, username))
            .await
    }

    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, GatewayError> {
        self.observe(GatewayOperation::Login, self.inner.login(email, password))
            .await
    }

    async fn submit_second_factor(&self, code: &str) -> Result<(), GatewayError> {
        self.observe(
            GatewayOperation::SubmitSecondFactor,
            self.inner.submit_second_factor(code),
        )
        .await
    }

    async fn verify_email(&self, token: &str) -> Result<(), GatewayError> {
        self.observe(GatewayOperation::VerifyEmail, self.inner.verify_email(token))
            .await
    }

    async fn fetch_flow_state(&self, identity: &FlowIdentity) -> Result<RemoteFlowState, GatewayError> {
        self.observe(
            GatewayOperation::FetchFlowState,
            self.inner.fetch_flow_state(identity),
        )
        .await
    }

    async fn report_flow_state(
        &self,
        identity: &FlowIdentity,
        state_name: &str,
        data: serde_json::Value,
    ) -> Result<RemoteFlowState, GatewayError> {
        self.observe(
            GatewayOperation::ReportFlowState,
            self.inner.report_flow_state(identity, state_name, data),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InMemoryGateway, MockFlowGateway};

    #[tokio::test]
    async fn test_counts_successes_and_failures() {
        let gateway = InstrumentedGateway::new(InMemoryGateway::new().with_user("ada@example.com", "pw"));
        let metrics = gateway.metrics();

        gateway.login("ada@example.com", "pw").await.unwrap();
        gateway.login("ada@example.com", "nope").await.unwrap_err();

        assert_eq!(metrics.calls(GatewayOperation::Login), 2);
        assert_eq!(metrics.get_stats().failures, 1);
    }

    #[tokio::test]
    async fn test_single_attempt_per_call() {
        let mut mock = MockFlowGateway::new();
        mock.expect_fetch_flow_state()
            .times(1)
            .returning(|_| Err(GatewayError::unavailable("timeout")));

        let gateway = InstrumentedGateway::new(mock);
        let err = gateway
            .fetch_flow_state(&FlowIdentity::from("ada@example.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Unavailable { .. }));
        assert_eq!(gateway.metrics().get_stats().fetches, 1);
    }
}
