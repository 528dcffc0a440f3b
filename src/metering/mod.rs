//! Call metering.
//!
//! Records start time, call name and outcome for every call and publishes a
//! response report asynchronously. Publishing never alters control flow:
//! failures are logged, the block-number lookup may be absent or failing, and
//! the caller's result passes through unchanged.

pub mod block;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::stream::{CallHandler, ServerCall};
use crate::types::metadata::{
    CLIENT_TYPE_HEADER, FREE_CALL_USER_ID_HEADER, PAYMENT_CHANNEL_ID_HEADER, PAYMENT_TYPE_HEADER,
    USER_AGENT_HEADER, USER_INFO_HEADER,
};
use crate::types::{GatewayError, Metadata, Status};

pub use block::{BlockProvider, HttpBlockProvider};

/// Identity of this gateway instance, stamped on every report.
#[derive(Debug, Clone, Default)]
pub struct ServiceIdentity {
    pub organization_id: String,
    pub service_id: String,
    pub group_id: String,
    pub endpoint: String,
    pub version: String,
}

/// Stats captured when a call arrives.
#[derive(Debug, Clone, Serialize)]
pub struct CallStats {
    pub request_id: String,
    pub service_method: String,
    pub request_received_time: DateTime<Utc>,
    pub organization_id: String,
    pub service_id: String,
    pub group_id: String,
    pub daemon_endpoint: String,
    pub version: String,
    pub client_type: String,
    pub user_details: String,
    pub user_agent: String,
    pub channel_id: String,
    pub user_name: String,
    pub payment_mode: String,
}

impl CallStats {
    pub fn new(identity: &ServiceIdentity, method: &str, received: DateTime<Utc>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            service_method: method.to_string(),
            request_received_time: received,
            organization_id: identity.organization_id.clone(),
            service_id: identity.service_id.clone(),
            group_id: identity.group_id.clone(),
            daemon_endpoint: identity.endpoint.clone(),
            version: identity.version.clone(),
            client_type: String::new(),
            user_details: String::new(),
            user_agent: String::new(),
            channel_id: String::new(),
            user_name: String::new(),
            payment_mode: String::new(),
        }
    }

    /// Record per-channel details from call metadata, where present.
    pub fn set_details(&mut self, metadata: &Metadata) {
        if let Ok(value) = metadata.get_single(CLIENT_TYPE_HEADER) {
            self.client_type = value.to_string();
        }
        if let Ok(value) = metadata.get_single(USER_INFO_HEADER) {
            self.user_details = value.to_string();
        }
        if let Ok(value) = metadata.get_single(USER_AGENT_HEADER) {
            self.user_agent = value.to_string();
        }
        if let Ok(value) = metadata.get_single(PAYMENT_CHANNEL_ID_HEADER) {
            self.channel_id = value.to_string();
        }
        if let Ok(value) = metadata.get_single(FREE_CALL_USER_ID_HEADER) {
            self.user_name = value.to_string();
        }
        if let Ok(value) = metadata.get_single(PAYMENT_TYPE_HEADER) {
            self.payment_mode = value.to_string();
        }
    }
}

/// Report published after a call finishes.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseReport {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub stats: CallStats,
    pub response_sent_time: DateTime<Utc>,
    pub response_time_secs: f64,
    pub response_code: String,
    pub error_message: String,
    pub current_block_number: Option<u64>,
}

/// Destination for response reports.
#[async_trait]
pub trait StatsPublisher: Send + Sync {
    async fn publish(&self, report: ResponseReport) -> Result<(), GatewayError>;
}

/// Publisher that POSTs reports as JSON to a monitoring endpoint.
pub struct HttpStatsPublisher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpStatsPublisher {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl StatsPublisher for HttpStatsPublisher {
    async fn publish(&self, report: ResponseReport) -> Result<(), GatewayError> {
        self.client
            .post(&self.endpoint)
            .json(&report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Publisher used when no monitoring endpoint is configured.
pub struct NullStatsPublisher;

#[async_trait]
impl StatsPublisher for NullStatsPublisher {
    async fn publish(&self, report: ResponseReport) -> Result<(), GatewayError> {
        debug!(request_id = %report.stats.request_id, code = %report.response_code, "call finished");
        Ok(())
    }
}

/// Wraps the handler chain with stats recording. Does not alter control flow.
pub struct MeteringInterceptor {
    identity: ServiceIdentity,
    publisher: Arc<dyn StatsPublisher>,
    block_provider: Option<Arc<dyn BlockProvider>>,
    inner: Arc<dyn CallHandler>,
}

impl MeteringInterceptor {
    pub fn new(
        identity: ServiceIdentity,
        publisher: Arc<dyn StatsPublisher>,
        block_provider: Option<Arc<dyn BlockProvider>>,
        inner: Arc<dyn CallHandler>,
    ) -> Self {
        Self {
            identity,
            publisher,
            block_provider,
            inner,
        }
    }

    fn spawn_publish(&self, stats: CallStats, elapsed: Duration, error: Option<Status>) {
        let publisher = Arc::clone(&self.publisher);
        let block_provider = self.block_provider.clone();
        tokio::spawn(async move {
            // A failing block lookup must not block or fail the report.
            let current_block_number = match &block_provider {
                Some(provider) => match provider.current_block().await {
                    Ok(number) => Some(number),
                    Err(e) => {
                        debug!(error = %e, "could not determine current block number");
                        None
                    }
                },
                None => None,
            };

            let report = ResponseReport {
                kind: "response",
                stats,
                response_sent_time: Utc::now(),
                response_time_secs: elapsed.as_secs_f64(),
                response_code: error
                    .as_ref()
                    .map(|s| s.code.to_string())
                    .unwrap_or_else(|| "ok".to_string()),
                error_message: error.map(|s| s.message).unwrap_or_default(),
                current_block_number,
            };

            if let Err(e) = publisher.publish(report).await {
                warn!(error = %e, "failed to publish response stats");
            }
        });
    }
}

#[async_trait]
impl CallHandler for MeteringInterceptor {
    async fn handle(&self, call: ServerCall) -> Result<(), Status> {
        let start = Instant::now();
        let mut stats = CallStats::new(&self.identity, &call.info.method, Utc::now());
        if let Some(metadata) = &call.metadata {
            stats.set_details(metadata);
        }

        let outcome = AssertUnwindSafe(self.inner.handle(call)).catch_unwind().await;

        let reported_error = match &outcome {
            Ok(Ok(())) => None,
            Ok(Err(status)) => Some(status.clone()),
            Err(_) => Some(Status::internal("service handler panicked")),
        };
        self.spawn_publish(stats, start.elapsed(), reported_error);

        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    error!(error = %e, "call handler returned error");
                }
                result
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::stream::support::{call_with, ScriptedSource};
    use crate::types::StatusCode;

    struct CapturingPublisher {
        reports: Arc<Mutex<Vec<ResponseReport>>>,
    }

    #[async_trait]
    impl StatsPublisher for CapturingPublisher {
        async fn publish(&self, report: ResponseReport) -> Result<(), GatewayError> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    struct FixedBlockProvider {
        result: Result<u64, String>,
    }

    #[async_trait]
    impl BlockProvider for FixedBlockProvider {
        async fn current_block(&self) -> Result<u64, GatewayError> {
            self.result
                .clone()
                .map_err(GatewayError::Transport)
        }
    }

    struct FixedHandler {
        result: Result<(), Status>,
    }

    #[async_trait]
    impl CallHandler for FixedHandler {
        async fn handle(&self, _call: ServerCall) -> Result<(), Status> {
            self.result.clone()
        }
    }

    fn identity() -> ServiceIdentity {
        ServiceIdentity {
            organization_id: "example-org".to_string(),
            service_id: "example-service".to_string(),
            group_id: "default-group".to_string(),
            endpoint: "0.0.0.0:7000".to_string(),
            version: "0.1.0".to_string(),
        }
    }

    fn interceptor(
        handler_result: Result<(), Status>,
        block: Option<Result<u64, String>>,
    ) -> (MeteringInterceptor, Arc<Mutex<Vec<ResponseReport>>>) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let publisher = Arc::new(CapturingPublisher {
            reports: Arc::clone(&reports),
        });
        let block_provider: Option<Arc<dyn BlockProvider>> =
            block.map(|result| Arc::new(FixedBlockProvider { result }) as Arc<dyn BlockProvider>);
        let interceptor = MeteringInterceptor::new(
            identity(),
            publisher,
            block_provider,
            Arc::new(FixedHandler {
                result: handler_result,
            }),
        );
        (interceptor, reports)
    }

    async fn wait_for_report(reports: &Arc<Mutex<Vec<ResponseReport>>>) -> ResponseReport {
        for _ in 0..200 {
            if let Some(report) = reports.lock().unwrap().first() {
                return report.clone();
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no report published in time");
    }

    fn some_call() -> ServerCall {
        let mut md = Metadata::new();
        md.set(CLIENT_TYPE_HEADER, "snet-cli");
        md.set(PAYMENT_TYPE_HEADER, "escrow");
        md.set(PAYMENT_CHANNEL_ID_HEADER, "42");
        let (call, _) = call_with(Some(md), ScriptedSource::frames(vec![]));
        call
    }

    #[tokio::test]
    async fn test_success_publishes_ok_report_with_block() {
        let (interceptor, reports) = interceptor(Ok(()), Some(Ok(1234)));

        interceptor.handle(some_call()).await.unwrap();

        let report = wait_for_report(&reports).await;
        assert_eq!(report.kind, "response");
        assert_eq!(report.response_code, "ok");
        assert_eq!(report.current_block_number, Some(1234));
        assert_eq!(report.stats.client_type, "snet-cli");
        assert_eq!(report.stats.payment_mode, "escrow");
        assert_eq!(report.stats.channel_id, "42");
        assert_eq!(report.stats.organization_id, "example-org");
    }

    #[tokio::test]
    async fn test_error_passes_through_and_is_reported() {
        let (interceptor, reports) = interceptor(
            Err(Status::resource_exhausted("rate limit reached")),
            None,
        );

        let err = interceptor.handle(some_call()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::ResourceExhausted);

        let report = wait_for_report(&reports).await;
        assert_eq!(report.response_code, "resource-exhausted");
        assert_eq!(report.error_message, "rate limit reached");
        assert_eq!(report.current_block_number, None);
    }

    #[tokio::test]
    async fn test_block_lookup_failure_does_not_fail_the_call() {
        let (interceptor, reports) =
            interceptor(Ok(()), Some(Err("rpc endpoint down".to_string())));

        interceptor.handle(some_call()).await.unwrap();

        let report = wait_for_report(&reports).await;
        assert_eq!(report.response_code, "ok");
        assert_eq!(report.current_block_number, None);
    }

    #[tokio::test]
    async fn test_panic_is_reported_then_reraised() {
        struct PanickingHandler;

        #[async_trait]
        impl CallHandler for PanickingHandler {
            async fn handle(&self, _call: ServerCall) -> Result<(), Status> {
                panic!("kaboom");
            }
        }

        let reports = Arc::new(Mutex::new(Vec::new()));
        let publisher = Arc::new(CapturingPublisher {
            reports: Arc::clone(&reports),
        });
        let interceptor =
            MeteringInterceptor::new(identity(), publisher, None, Arc::new(PanickingHandler));

        let task = tokio::spawn(async move { interceptor.handle(some_call()).await });
        assert!(task.await.unwrap_err().is_panic());

        let report = wait_for_report(&reports).await;
        assert_eq!(report.response_code, "internal");
        assert!(report.error_message.contains("panicked"));
    }
}
