//! CSI middleware proxy
//!
//! Serves the CSI Identity, Controller and Node services on a unix socket
//! or TCP address, runs every call through the middleware pipeline and
//! forwards it to an upstream plugin.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use csi_middleware::client::{self, TlsConfig};
use csi_middleware::lock::EtcdConfig;
use csi_middleware::metrics;
use csi_middleware::validator::SecretRequirements;
use csi_middleware::{
    ChannelHandler, CsiMiddleware, LockBackend, MiddlewareConfig, PipelineBuilder, ValidatorConfig,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Etcd,
}

/// RPCs that may be required to carry secrets
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SecretsFor {
    CreateVolume,
    DeleteVolume,
    ControllerPublishVolume,
    ControllerUnpublishVolume,
    NodeStageVolume,
    NodePublishVolume,
}

#[derive(Parser, Debug)]
#[command(name = "csi-proxy")]
#[command(about = "CSI middleware proxy: serialization, idempotency and validation for CSI plugins")]
struct Args {
    /// Listen endpoint (unix:///path/to/csi.sock or host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// Upstream plugin endpoint (unix:///path or http(s)://host:port)
    #[arg(long, env = "CSI_UPSTREAM")]
    upstream: String,

    /// Volume lock backend
    #[arg(long, env = "CSI_LOCK_BACKEND", value_enum, default_value = "memory")]
    lock_backend: Backend,

    /// How long a call waits for a busy volume lock, in milliseconds (0 never waits on a held lock)
    #[arg(long, env = "CSI_LOCK_TIMEOUT_MS", default_value = "0")]
    lock_timeout_ms: u64,

    /// Disable volume serialization entirely
    #[arg(long, env = "CSI_NO_SERIALIZE")]
    no_serialize: bool,

    /// Report NotFound for delete/unpublish of unknown volumes
    #[arg(long, env = "CSI_REQUIRE_VOLUME_EXISTS")]
    require_volume_exists: bool,

    /// etcd endpoints for the etcd lock backend
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    etcd_endpoints: Vec<String>,

    /// Prefix scoping lock keys in etcd
    #[arg(long, env = "ETCD_DOMAIN", default_value = "csi")]
    etcd_domain: String,

    /// etcd lease TTL in seconds
    #[arg(long, env = "ETCD_TTL_SECS", default_value = "60")]
    etcd_ttl_secs: u64,

    /// Validate requests
    #[arg(long, env = "CSI_VALIDATE_REQUESTS")]
    validate_requests: bool,

    /// Validate responses
    #[arg(long, env = "CSI_VALIDATE_RESPONSES")]
    validate_responses: bool,

    /// Skip CSI field size limits during request validation
    #[arg(long, env = "CSI_DISABLE_FIELD_LEN_CHECK")]
    disable_field_len_check: bool,

    #[arg(long, env = "CSI_REQUIRE_NODE_ID")]
    require_node_id: bool,

    #[arg(long, env = "CSI_REQUIRE_STAGING_TARGET_PATH")]
    require_staging_target_path: bool,

    #[arg(long, env = "CSI_REQUIRE_VOLUME_CONTEXT")]
    require_volume_context: bool,

    #[arg(long, env = "CSI_REQUIRE_PUBLISH_CONTEXT")]
    require_publish_context: bool,

    /// RPCs that must carry secrets (comma separated)
    #[arg(long, env = "CSI_REQUIRE_SECRETS", value_enum, value_delimiter = ',')]
    require_secrets: Vec<SecretsFor>,

    /// Treat AlreadyExists from CreateVolume as success
    #[arg(long, env = "CSI_SUCCESS_CREATE_ALREADY_EXISTS")]
    success_create_already_exists: bool,

    /// Treat NotFound from DeleteVolume as success
    #[arg(long, env = "CSI_SUCCESS_DELETE_NOT_FOUND")]
    success_delete_not_found: bool,

    /// Accepted values of the csi.version metadata (comma separated, empty accepts any)
    #[arg(long, env = "CSI_SUPPORTED_VERSIONS", value_delimiter = ',')]
    supported_versions: Vec<String>,

    /// TLS certificate file (PEM format), TCP listen only
    #[arg(long, env = "TLS_CERT_PATH")]
    tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM format)
    #[arg(long, env = "TLS_KEY_PATH")]
    tls_key: Option<PathBuf>,

    /// CA certificate for client verification (enables mTLS)
    #[arg(long, env = "TLS_CLIENT_CA_PATH")]
    tls_client_ca: Option<PathBuf>,

    /// Client certificate for mTLS to the upstream plugin (PEM format)
    #[arg(long, env = "UPSTREAM_TLS_CERT_PATH")]
    upstream_tls_cert: Option<PathBuf>,

    /// Client private key for mTLS to the upstream plugin (PEM format)
    #[arg(long, env = "UPSTREAM_TLS_KEY_PATH")]
    upstream_tls_key: Option<PathBuf>,

    /// CA certificate for verifying the upstream plugin (PEM format)
    #[arg(long, env = "UPSTREAM_TLS_CA_PATH")]
    upstream_tls_ca: Option<PathBuf>,

    /// Expected server name in the upstream certificate
    #[arg(long, env = "UPSTREAM_TLS_DOMAIN", default_value = "localhost")]
    upstream_tls_domain: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

impl Args {
    fn validator_config(&self) -> ValidatorConfig {
        let wants = |rpc| self.require_secrets.contains(&rpc);
        ValidatorConfig {
            request_validation: self.validate_requests,
            response_validation: self.validate_responses,
            requires_node_id: self.require_node_id,
            requires_staging_target_path: self.require_staging_target_path,
            requires_volume_context: self.require_volume_context,
            requires_publish_context: self.require_publish_context,
            requires_secrets: SecretRequirements {
                create_volume: wants(SecretsFor::CreateVolume),
                delete_volume: wants(SecretsFor::DeleteVolume),
                controller_publish_volume: wants(SecretsFor::ControllerPublishVolume),
                controller_unpublish_volume: wants(SecretsFor::ControllerUnpublishVolume),
                node_stage_volume: wants(SecretsFor::NodeStageVolume),
                node_publish_volume: wants(SecretsFor::NodePublishVolume),
            },
            success_create_already_exists: self.success_create_already_exists,
            success_delete_not_found: self.success_delete_not_found,
            supported_versions: self.supported_versions.clone(),
            disable_field_len_check: self.disable_field_len_check,
        }
    }

    fn middleware_config(&self) -> MiddlewareConfig {
        let lock_backend = match self.lock_backend {
            Backend::Memory => LockBackend::Memory,
            Backend::Etcd => LockBackend::Etcd(EtcdConfig {
                endpoints: self.etcd_endpoints.clone(),
                domain: self.etcd_domain.clone(),
                session_ttl: Duration::from_secs(self.etcd_ttl_secs),
            }),
        };
        MiddlewareConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            lock_backend,
            serialize_volumes: !self.no_serialize,
            require_volume_exists: self.require_volume_exists,
            validator: self.validator_config(),
            logging: true,
            metrics: self.metrics_addr.is_some(),
        }
    }

    fn upstream_tls(&self) -> Option<TlsConfig> {
        match (
            &self.upstream_tls_cert,
            &self.upstream_tls_key,
            &self.upstream_tls_ca,
        ) {
            (Some(cert), Some(key), Some(ca)) => Some(TlsConfig {
                cert_path: cert.clone(),
                key_path: key.clone(),
                ca_path: ca.clone(),
                domain: self.upstream_tls_domain.clone(),
            }),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let config = args.middleware_config();
    info!(
        endpoint = %args.endpoint,
        upstream = %args.upstream,
        lock_backend = ?args.lock_backend,
        lock_timeout_ms = args.lock_timeout_ms,
        serialize = config.serialize_volumes,
        validator = config.validator.is_enabled(),
        "Starting csi-proxy"
    );

    let channel = client::connect_with_tls(&args.upstream, args.upstream_tls())
        .await
        .map_err(|e| format!("Failed to connect to upstream '{}': {}", args.upstream, e))?;
    info!(upstream = %args.upstream, "Connected to upstream plugin");

    let pipeline = PipelineBuilder::new(config)
        .build(Arc::new(ChannelHandler::new(channel)))
        .await
        .map_err(|e| format!("Failed to initialize lock backend: {}", e))?;
    let middleware = CsiMiddleware::new(pipeline);

    // Build the gRPC server with optional TLS
    let mut builder = Server::builder();

    if let (Some(cert_path), Some(key_path)) = (&args.tls_cert, &args.tls_key) {
        let cert = tokio::fs::read(cert_path).await?;
        let key = tokio::fs::read(key_path).await?;
        let identity = Identity::from_pem(cert, key);

        let mut tls = ServerTlsConfig::new().identity(identity);

        // If client CA provided, require client certificates (mTLS)
        if let Some(ca_path) = &args.tls_client_ca {
            let ca = tokio::fs::read(ca_path).await?;
            tls = tls.client_ca_root(Certificate::from_pem(ca));
            info!("mTLS enabled - client certificates required");
        } else {
            info!("TLS enabled (server-only, no client verification)");
        }

        builder = builder.tls_config(tls)?;
    }

    let router = builder
        .add_service(middleware.identity_server())
        .add_service(middleware.controller_server())
        .add_service(middleware.node_server());

    if let Some(path) = args.endpoint.strip_prefix("unix://") {
        let path = PathBuf::from(path);

        // A socket left behind by a previous run blocks bind
        if path.exists() {
            warn!(path = %path.display(), "Removing stale socket");
            tokio::fs::remove_file(&path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "gRPC server listening on unix socket");

        router
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
                shutdown_signal().await;
                info!("Shutdown signal received, draining connections...");
            })
            .await?;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove socket");
        }
    } else {
        let addr = args
            .endpoint
            .strip_prefix("tcp://")
            .unwrap_or(&args.endpoint)
            .parse()?;
        info!("gRPC server listening on {}", addr);

        router
            .serve_with_shutdown(addr, async {
                shutdown_signal().await;
                info!("Shutdown signal received, draining connections...");
            })
            .await?;
    }

    info!("csi-proxy shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    // Wait for any signal - branches whose handler failed to install are disabled
    tokio::select! {
        Some(_) = async { sigterm.as_mut()?.recv().await }, if sigterm.is_some() => {
            info!("Received SIGTERM");
        }
        Some(_) = async { sigint.as_mut()?.recv().await }, if sigint.is_some() => {
            info!("Received SIGINT");
        }
        else => {
            warn!("No signal handlers available, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
