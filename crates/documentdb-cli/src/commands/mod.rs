pub mod events;
pub mod promote;
pub mod status;
pub mod version;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};

use documentdb_cluster::kubernetes::KubeClusterStore;
use documentdb_cluster::probe::HttpProber;
use documentdb_cluster::ClusterReader;
use documentdb_core::config::DocumentDbConfig;
use documentdb_core::types::ClusterRef;

/// Flags shared by every cluster command.
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub namespace: Option<String>,
    pub cluster: Option<String>,
    pub context: Option<String>,
}

/// Everything a command needs to talk to one cluster.
pub struct Session {
    pub cluster: ClusterRef,
    pub config: DocumentDbConfig,
    pub client: Client,
}

impl Session {
    pub async fn connect(args: &GlobalArgs) -> Result<Self> {
        let config = DocumentDbConfig::load_or_default(args.config.as_deref())?;

        let kubeconfig = match &args.context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&options)
                    .await
                    .with_context(|| format!("loading kubeconfig context {context}"))?
            }
            None => Config::infer().await.context("loading kubeconfig")?,
        };
        let cluster = resolve_cluster(args, &config, &kubeconfig.default_namespace)?;
        let client = Client::try_from(kubeconfig)?;
        tracing::debug!(cluster = %cluster, "Connected to Kubernetes API");

        Ok(Self {
            cluster,
            config,
            client,
        })
    }

    pub fn reader(&self) -> Result<ClusterReader> {
        let store = KubeClusterStore::new(self.client.clone(), self.config.probe.status_port);
        let prober = HttpProber::new(&self.config.probe)?;
        Ok(ClusterReader::new(
            Arc::new(store),
            Arc::new(prober),
            self.config.probe.clone(),
            self.config.retry.clone(),
        ))
    }
}

/// Flags win over the config file, which wins over the kubeconfig namespace.
fn resolve_cluster(
    args: &GlobalArgs,
    config: &DocumentDbConfig,
    default_namespace: &str,
) -> Result<ClusterRef> {
    let name = args
        .cluster
        .clone()
        .or_else(|| config.cluster.name.clone())
        .context("no cluster given; pass --cluster or set [cluster] name in the config file")?;
    let namespace = args
        .namespace
        .clone()
        .or_else(|| config.cluster.namespace.clone())
        .unwrap_or_else(|| default_namespace.to_string());
    Ok(ClusterRef::new(namespace, name))
}
