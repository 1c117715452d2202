//! certwarden - webhook serving-certificate rotation and CA bundle injection

mod health;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;

use certwarden_common::telemetry::{init_telemetry, TelemetryConfig};
use certwarden_common::RotationMetrics;
use certwarden_rotator::{
    run_controller, CertRotator, ClusterStore, KubeStore, RotatorConfig, SecretKey, WebhookInfo,
};

/// certwarden - keeps a webhook's serving certificate valid and trusted
#[derive(Parser, Debug)]
#[command(name = "certwarden", version, about, long_about = None)]
struct Cli {
    /// Namespace of the certificate Secret
    #[arg(long, env = "CERTWARDEN_SECRET_NAMESPACE")]
    secret_namespace: String,

    /// Name of the certificate Secret
    #[arg(long, env = "CERTWARDEN_SECRET_NAME")]
    secret_name: String,

    /// Directory the Secret is mounted into
    #[arg(long, env = "CERTWARDEN_CERT_DIR", default_value = "/certs")]
    cert_dir: PathBuf,

    /// CA common name
    #[arg(long, env = "CERTWARDEN_CA_NAME")]
    ca_name: String,

    /// CA organization
    #[arg(long, env = "CERTWARDEN_CA_ORGANIZATION")]
    ca_organization: String,

    /// DNS name of the webhook Service (e.g. webhook.ns.svc)
    #[arg(long, env = "CERTWARDEN_DNS_NAME")]
    dns_name: String,

    /// Consumer to inject the CA into, as <kind>:<name> where kind is
    /// validating, mutating or crd. Repeatable.
    #[arg(long = "webhook", env = "CERTWARDEN_WEBHOOKS", value_delimiter = ',')]
    webhooks: Vec<WebhookInfo>,

    /// Exit after every Secret write so the pod restarts with fresh mounts
    #[arg(long, env = "CERTWARDEN_RESTART_ON_REFRESH")]
    restart_on_refresh: bool,

    /// Address for /healthz and /readyz
    #[arg(long, env = "CERTWARDEN_HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,
}

impl Cli {
    fn rotator_config(&self) -> RotatorConfig {
        let mut config = RotatorConfig::new(
            SecretKey::new(&self.secret_namespace, &self.secret_name),
            &self.cert_dir,
            &self.ca_name,
            &self.ca_organization,
            &self.dns_name,
        )
        .with_webhooks(self.webhooks.iter().cloned());
        config.restart_on_refresh = self.restart_on_refresh;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let telemetry = init_telemetry(TelemetryConfig::default())?;

    let config = cli.rotator_config();
    config.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client.clone()));
    let rotator = CertRotator::new(config, store, RotationMetrics::from_global());
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let controller = tokio::spawn(run_controller(
        client,
        Arc::new(rotator.reconciler()),
        shutdown.clone(),
    ));
    let health = tokio::spawn(health::serve(
        cli.health_addr,
        rotator.ready_signal(),
        shutdown.clone(),
    ));

    tracing::info!(
        secret = %rotator.config().secret_key,
        dns_name = %rotator.config().dns_name,
        webhooks = rotator.config().webhooks.len(),
        "Starting certwarden"
    );

    let result = rotator.start(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = controller.await {
        tracing::error!(error = %e, "Reconciler task failed");
    }
    match health.await {
        Ok(Err(e)) => tracing::error!(error = %e, "Health server failed"),
        Err(e) => tracing::error!(error = %e, "Health server task failed"),
        Ok(Ok(())) => {}
    }

    telemetry.shutdown();
    result.map_err(|e| anyhow::anyhow!("Cert rotator stopped: {}", e))
}
