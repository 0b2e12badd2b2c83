use crate::cli::{Commands, NetworkDisruptionArgs};
use crate::error::{ChaosnetError, Result};
use crate::injector::{InjectorConfig, NetworkDisruptionInjector};
use crate::k8s::{ClusterClient, KubeClusterClient};
use crate::network::{
    FsCgroup, HostNetns, IpCommandAdapter, NetworkNamespace, ProcNetns, SystemDnsClient,
    TcCommandDriver,
};
use crate::spec::{DisruptionLevel, DisruptionSpec, HostSpec, ServiceRef};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::NetworkDisruption(args) => handle_network_disruption(args).await,
    }
}

async fn handle_network_disruption(args: NetworkDisruptionArgs) -> Result<()> {
    let spec = DisruptionSpec {
        hosts: HostSpec::parse_args(&args.hosts)?,
        allowed_hosts: HostSpec::parse_args(&args.allowed_hosts)?,
        services: ServiceRef::parse_args(&args.services)?,
        drop: args.drop,
        duplicate: args.duplicate,
        corrupt: args.corrupt,
        delay: args.delay,
        delay_jitter: args.delay_jitter,
        bandwidth_limit: args.bandwidth_limit,
        ..DisruptionSpec::default()
    };

    let level = match args.level.as_str() {
        "pod" => DisruptionLevel::Pod,
        "node" => DisruptionLevel::Node,
        other => {
            return Err(ChaosnetError::Config(format!(
                "unknown disruption level: {other}"
            )))
        }
    };

    let cluster: Option<Arc<dyn ClusterClient>> = match KubeClusterClient::try_default().await {
        Ok(client) => Some(Arc::new(client)),
        Err(err) => {
            warn!("kubernetes API not available, service targets are disabled: {err}");
            None
        }
    };

    spec.validate(cluster.as_deref()).await?;

    let netns: Arc<dyn NetworkNamespace> = if args.target_pid > 0 {
        Arc::new(ProcNetns::open(args.target_pid)?)
    } else {
        Arc::new(HostNetns)
    };

    let config = InjectorConfig {
        level,
        on_init: args.on_init,
        traffic: Arc::new(TcCommandDriver::new(args.dry_run)),
        netlink: Arc::new(IpCommandAdapter::new()),
        dns: Arc::new(SystemDnsClient),
        cluster,
        cgroup: Arc::new(FsCgroup::new(args.cgroup_path)),
        netns,
    };

    let mut injector = NetworkDisruptionInjector::new(spec, config);
    injector.inject().await?;

    info!("disruption injected, waiting for SIGINT to clean up");
    signal::ctrl_c().await?;

    injector.clean().await
}
