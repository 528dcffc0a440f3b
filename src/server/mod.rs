//! Front door: hyper server, WebSocket upgrades, interceptor chain wiring.

pub mod http;
pub mod websocket;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::admission::{AdmissionInterceptor, TokenBucket};
use crate::backend::{LoopbackHandler, PassthroughHandler, ServiceHandler, ServiceMetadata};
use crate::config::Args;
use crate::control::ControlBroadcaster;
use crate::metering::{
    HttpBlockProvider, HttpStatsPublisher, MeteringInterceptor, NullStatsPublisher,
    ServiceIdentity, StatsPublisher,
};
use crate::payment::{NoOpPaymentHandler, PaymentHandlerRegistry, PaymentValidationInterceptor};
use crate::stream::CallHandler;
use crate::types::Result;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub chain: Arc<dyn CallHandler>,
    pub control: ControlBroadcaster,
}

impl AppState {
    /// State with the default no-op payment registry (payment gating off).
    pub fn new(args: Args) -> Self {
        let registry = PaymentHandlerRegistry::new(Arc::new(NoOpPaymentHandler), vec![]);
        Self::with_registry(args, registry)
    }

    /// State with caller-provided payment strategies.
    pub fn with_registry(args: Args, registry: PaymentHandlerRegistry) -> Self {
        let control = ControlBroadcaster::new();
        let chain = build_chain(&args, &control, registry);
        Self {
            args,
            chain,
            control,
        }
    }
}

/// Assemble the interceptor chain, outermost to innermost:
/// admission -> metering -> payment validation -> service handler.
pub fn build_chain(
    args: &Args,
    control: &ControlBroadcaster,
    registry: PaymentHandlerRegistry,
) -> Arc<dyn CallHandler> {
    let service: Arc<dyn ServiceHandler> = if args.passthrough_enabled {
        Arc::new(PassthroughHandler::new(
            args.service_endpoint.clone(),
            args.training_endpoint.clone(),
            Arc::new(ServiceMetadata::new(args.special_methods.iter().cloned())),
        ))
    } else {
        Arc::new(LoopbackHandler)
    };

    let payment = Arc::new(PaymentValidationInterceptor::new(
        registry,
        service,
        args.suppress_first_header,
    ));

    let identity = ServiceIdentity {
        organization_id: args.organization_id.clone(),
        service_id: args.service_id.clone(),
        group_id: args.group_id.clone(),
        endpoint: args.listen.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let publisher: Arc<dyn StatsPublisher> = match &args.monitoring_endpoint {
        Some(endpoint) => Arc::new(HttpStatsPublisher::new(endpoint.clone())),
        None => Arc::new(NullStatsPublisher),
    };
    let block_provider = args
        .ethereum_rpc_endpoint
        .as_ref()
        .map(|endpoint| {
            Arc::new(HttpBlockProvider::new(endpoint.clone()))
                as Arc<dyn crate::metering::BlockProvider>
        });
    let metering = Arc::new(MeteringInterceptor::new(
        identity,
        publisher,
        block_provider,
        payment,
    ));

    let limiter = Arc::new(TokenBucket::from_config(
        &args.rate_limit_per_minute,
        args.burst_size,
    ));
    Arc::new(AdmissionInterceptor::new(limiter, control, metering))
}

/// Bind the configured listen address and serve forever.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    run_with_listener(state, listener).await
}

/// Serve on an already-bound listener (tests bind to an ephemeral port).
pub async fn run_with_listener(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    info!(
        "tollgate listening on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = hyper_util::rt::TokioIo::new(stream);
                    let service = hyper::service::service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { http::handle_request(state, req).await }
                    });

                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        tracing::debug!("error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                tracing::error!("error accepting connection: {:?}", e);
            }
        }
    }
}
