mod api;
mod call;
mod config;
mod context;
mod livekit;
mod registry;
mod resolve;
mod session;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use opentelemetry::trace::TracerProvider as _;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use call::report::ReportClient;
use call::CallRuntime;
use config::Config;
use livekit::client::LiveKitClient;
use livekit::LiveKitApi;
use registry::CallRegistry;
use session::remote::RemoteConnector;
use telemetry::LangfuseExport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long shutdown waits for active calls to finish their reports.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub api: Arc<dyn LiveKitApi>,
    /// Present when dispatched jobs also run in this process.
    pub jobs: Option<CallRuntime>,
    pub registry: CallRegistry,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("outbound-agent {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("outbound-agent {VERSION}");
    println!("Outbound SIP voice agent and dispatch bridge");
    println!();
    println!("Usage: outbound-agent [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the dispatch server.");
}

/// `RUST_LOG` wins; otherwise `LOG_LEVEL` sets the crate's level.
fn log_filter(rust_log: Option<String>, log_level: Option<String>) -> String {
    if let Some(filter) = rust_log.filter(|f| !f.trim().is_empty()) {
        return filter;
    }
    let level = log_level
        .map(|l| l.trim().to_ascii_lowercase())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| "info".to_string());
    format!("outbound_agent={level},tower_http=info")
}

async fn server() {
    let filter = log_filter(std::env::var("RUST_LOG").ok(), std::env::var("LOG_LEVEL").ok());
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_new(&filter)
            .unwrap_or_else(|_| "outbound_agent=info,tower_http=info".into())
    };

    // Config decides whether traces are exported, so it loads under a
    // plain stderr subscriber before the global one exists.
    let loading = tracing_subscriber::fmt().with_env_filter(env_filter()).finish();
    let config = match tracing::subscriber::with_default(loading, Config::load) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let export = LangfuseExport::from_config(&config.telemetry);
    let (provider, telemetry_error) = match export.as_ref().map(|e| e.tracer_provider()) {
        Some(Ok(provider)) => (Some(provider), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer(telemetry::SERVICE_NAME))
    });
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    match (&export, telemetry_error) {
        (Some(export), None) => {
            tracing::info!(endpoint = %export.endpoint, "Exporting traces to Langfuse")
        }
        (_, Some(e)) => tracing::warn!("Langfuse tracing disabled: {e}"),
        (None, None) => tracing::debug!("Langfuse credentials not set; trace export disabled"),
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        agent = %config.agent.name,
        "Starting outbound-agent"
    );

    let livekit_api: Arc<dyn LiveKitApi> = Arc::new(LiveKitClient::new(&config.livekit));
    let registry = CallRegistry::new();

    let jobs = match (&config.agent.pipeline_url, config.agent.run_jobs_locally) {
        (Some(url), true) => {
            tracing::info!(url = %url, "Running dispatched calls in-process");
            Some(CallRuntime {
                config: Arc::clone(&config),
                api: Arc::clone(&livekit_api),
                connector: Arc::new(RemoteConnector::new(url)),
                reporter: ReportClient::new(&config.report),
                registry: registry.clone(),
            })
        }
        (None, true) => {
            tracing::warn!("No speech pipeline configured, dispatches go to external workers");
            None
        }
        (_, false) => None,
    };

    let state = AppState {
        config: Arc::clone(&config),
        api: livekit_api,
        jobs,
        registry: registry.clone(),
    };

    let app = Router::new()
        .route("/dispatch", post(api::dispatch::dispatch_call))
        .route("/healthz", get(api::dispatch::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid server address");

    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    let active = registry.shutdown_all("server shutting down").await;
    if active > 0 {
        tracing::info!(active, "Waiting for active calls to finish");
        if !registry.wait_until_empty(DRAIN_TIMEOUT).await {
            let remaining = registry.len().await;
            tracing::warn!(remaining, "Calls still active after drain timeout");
        }
    }
    if let Some(provider) = provider {
        telemetry::shutdown(provider);
    }
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
