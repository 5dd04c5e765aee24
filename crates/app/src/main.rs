use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bfe_controller::dataplane::{DEFAULT_BINARY, DEFAULT_CONF_DIR};
use bfe_controller::{Controller, ControllerConfig, ControllerError};
use bfe_core::{ClassConfig, PodInfo, DEFAULT_CLASS_NAME};
use bfe_kubehub::{discover_class_config, get_pod_details, KubeRecorder};
use bfe_store::certs::{CertConfig, DEFAULT_SSL_DIR};
use bfe_store::StoreConfig;
use clap::Parser;
use kube::Client;
use tokio::task::JoinError;
use tracing::{error, info, warn};

const API_PROBE_ATTEMPTS: u32 = 10;

#[derive(Parser, Debug, Clone)]
#[command(name = "bfe-ingress-controller", version, about = "Kubernetes ingress controller for the BFE proxy")]
struct Args {
    /// Namespace to watch; all namespaces when empty
    #[arg(long, env = "BFE_NAMESPACE", default_value = "")]
    namespace: String,

    /// Full relist period in seconds (0 disables)
    #[arg(long = "resync-period", env = "BFE_RESYNC_PERIOD_SECS", default_value_t = 600)]
    resync_period: u64,

    /// Ingress class served by this controller
    #[arg(long = "ingress-class", env = "BFE_INGRESS_CLASS", default_value = DEFAULT_CLASS_NAME)]
    ingress_class: String,

    /// Directory certificate files are written to
    #[arg(long = "ssl-dir", env = "BFE_SSL_DIR", default_value = DEFAULT_SSL_DIR)]
    ssl_dir: PathBuf,

    /// Data-plane executable
    #[arg(long = "bfe-binary", env = "BFE_BINARY", default_value = DEFAULT_BINARY)]
    bfe_binary: PathBuf,

    /// Data-plane configuration directory, passed as `-c`
    #[arg(long = "bfe-conf", env = "BFE_CONF_DIR", default_value = DEFAULT_CONF_DIR)]
    bfe_conf: PathBuf,

    /// Fetch missing intermediate certificates from the issuer URL
    #[arg(long = "enable-ssl-chain-completion", env = "BFE_SSL_CHAIN_COMPLETION")]
    enable_ssl_chain_completion: bool,

    /// Seconds to wait for each initial cache sync
    #[arg(long = "cache-sync-timeout", env = "BFE_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    cache_sync_timeout: u64,

    /// Capacity of the store-to-controller event ring
    #[arg(long = "event-capacity", env = "BFE_EVENT_CAPACITY", default_value_t = 1024)]
    event_capacity: usize,
}

impl Args {
    fn store_config(&self, class: ClassConfig, pod: Option<PodInfo>) -> StoreConfig {
        StoreConfig {
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            resync_period: (self.resync_period > 0).then(|| Duration::from_secs(self.resync_period)),
            class,
            certs: CertConfig {
                ssl_dir: self.ssl_dir.clone(),
                chain_completion: self.enable_ssl_chain_completion,
                ..CertConfig::default()
            },
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout),
            pod,
            ..StoreConfig::default()
        }
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            binary: self.bfe_binary.clone(),
            conf_dir: self.bfe_conf.clone(),
            event_capacity: self.event_capacity,
            ..ControllerConfig::default()
        }
    }
}

fn init_tracing() {
    let env = std::env::var("BFE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BFE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid BFE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Connect and wait for the API server to answer, backing off 1s, 1.5s, 2.25s, ...
async fn connect() -> Result<Client> {
    let client = Client::try_default().await.context("could not establish a connection to the Kubernetes API server")?;
    let mut delay = Duration::from_secs(1);
    let mut last = None;
    for attempt in 0..API_PROBE_ATTEMPTS {
        match client.apiserver_version().await {
            Ok(_) => {
                if attempt > 0 {
                    warn!(retries = attempt, "initial connection to the Kubernetes API server was retried");
                }
                return Ok(client);
            }
            Err(e) => {
                info!(error = %e, attempt, "API server not reachable yet");
                last = Some(e);
            }
        }
        tokio::time::sleep(delay).await;
        delay = delay.mul_f64(1.5);
    }
    Err(last.map(anyhow::Error::from).unwrap_or_else(|| anyhow!("no attempts made")))
        .context("Kubernetes API server did not answer")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("captured ctrl_c signal"),
        _ = terminate => info!("captured SIGTERM"),
    }
}

fn exit(task: &str, out: Result<Result<(), ControllerError>, JoinError>) -> Result<()> {
    match out {
        Ok(Ok(())) => {
            info!("{task} exited");
            Ok(())
        }
        Ok(Err(e)) => Err(anyhow::Error::from(e).context(format!("{task} failed"))),
        Err(e) => Err(anyhow!("{task} task panicked or was cancelled: {e}")),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();
    init_metrics();

    let client = connect().await?;
    let class = discover_class_config(client.clone(), &args.ingress_class).await;
    let pod = match get_pod_details(client.clone()).await {
        Ok(pod) => Some(pod),
        Err(e) => {
            warn!(error = %e, "controller pod unknown; pod watch disabled");
            None
        }
    };
    let recorder = Arc::new(KubeRecorder::new(client.clone(), pod.as_ref().map(|p| p.name.clone())));
    let controller = Arc::new(Controller::new(args.controller_config(), args.store_config(class, pod), recorder, None));

    let mut run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.start(client).await }
    });
    let mut shutdown = tokio::spawn(shutdown_signal());
    let res = tokio::select! {
        h = &mut run => {
            shutdown.abort();
            exit("controller", h)
        }
        _ = &mut shutdown => {
            if let Err(e) = controller.stop().await {
                error!(error = %e, "controller shutdown failed");
            }
            exit("controller", run.await)
        }
    };
    info!("exiting");
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["bfe-ingress-controller"]).unwrap();
        let store = args.store_config(ClassConfig::default(), None);
        assert_eq!(store.namespace, None);
        assert_eq!(store.resync_period, Some(Duration::from_secs(600)));
        assert_eq!(store.certs.ssl_dir, PathBuf::from(DEFAULT_SSL_DIR));
        assert!(!store.certs.chain_completion);
        let ctl = args.controller_config();
        assert_eq!(ctl.binary, PathBuf::from("/usr/local/bin/bfe/bfe"));
        assert_eq!(ctl.conf_dir, PathBuf::from("/etc/bfe/bfe/conf"));
        assert_eq!(ctl.event_capacity, 1024);
        assert_eq!(args.ingress_class, DEFAULT_CLASS_NAME);
    }

    #[test]
    fn flags_override() {
        let args = Args::try_parse_from([
            "bfe-ingress-controller",
            "--namespace",
            "ingress",
            "--resync-period",
            "0",
            "--enable-ssl-chain-completion",
            "--cache-sync-timeout",
            "5",
        ])
        .unwrap();
        let store = args.store_config(ClassConfig::default(), None);
        assert_eq!(store.namespace.as_deref(), Some("ingress"));
        assert_eq!(store.resync_period, None);
        assert!(store.certs.chain_completion);
        assert_eq!(store.cache_sync_timeout, Duration::from_secs(5));
    }
}
