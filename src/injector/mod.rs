//! Network disruption injector: lifecycle façade and the tc tree builder.

pub mod priority;
pub mod service;

pub use priority::PriorityAllocator;
pub use service::{ResolvedService, TcServiceFilter};

use crate::error::{ChaosnetError, Result};
use crate::k8s::ClusterClient;
use crate::network::{
    CgroupManager, DnsClient, NetlinkAdapter, NetworkNamespace, TrafficController,
};
use crate::spec::{DisruptionLevel, DisruptionSpec, HostSpec, FLOW_INGRESS};
use ipnet::IpNet;
use service::{ServiceWatcher, WatcherContext};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// classid written to the target's net_cls cgroup; the cgroup filter steers
/// packets tagged with it into band 2:2.
pub const INJECTOR_CLASSID: &str = "0x00020002";

/// Environment variable carrying the node IP of the target pod.
pub const TARGET_POD_HOST_IP: &str = "TARGET_POD_HOST_IP";

/// Link-local address of the cloud provider metadata service.
const METADATA_SERVICE_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// Priomap of the outer prio qdisc: the default traffic classes land in
/// bands 1 to 3, band 4 stays reserved for disrupted traffic.
const PRIOMAP: [u32; 16] = [1, 2, 2, 2, 1, 2, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectorState {
    Created,
    Injected,
    Cleaned,
}

/// A deferred tc action, applied against a parent with a handle of its own
/// once the qdisc tree skeleton exists.
#[derive(Debug, Clone)]
enum LinkOperation {
    Netem {
        delay: Duration,
        jitter: Duration,
        drop: u8,
        corrupt: u8,
        duplicate: u8,
    },
    OutputLimit {
        bytes_per_sec: u64,
    },
}

impl LinkOperation {
    async fn apply(
        &self,
        traffic: &dyn TrafficController,
        interfaces: &[String],
        parent: &str,
        handle: u32,
    ) -> Result<()> {
        match self {
            LinkOperation::Netem {
                delay,
                jitter,
                drop,
                corrupt,
                duplicate,
            } => {
                traffic
                    .add_netem(
                        interfaces, parent, handle, *delay, *jitter, *drop, *corrupt, *duplicate,
                    )
                    .await
            }
            LinkOperation::OutputLimit { bytes_per_sec } => {
                traffic
                    .add_output_limit(interfaces, parent, handle, *bytes_per_sec)
                    .await
            }
        }
    }
}

pub struct InjectorConfig {
    pub level: DisruptionLevel,
    pub on_init: bool,
    pub traffic: Arc<dyn TrafficController>,
    pub netlink: Arc<dyn NetlinkAdapter>,
    pub dns: Arc<dyn DnsClient>,
    pub cluster: Option<Arc<dyn ClusterClient>>,
    pub cgroup: Arc<dyn CgroupManager>,
    pub netns: Arc<dyn NetworkNamespace>,
}

pub struct NetworkDisruptionInjector {
    spec: DisruptionSpec,
    config: InjectorConfig,
    operations: Vec<LinkOperation>,
    priorities: Arc<PriorityAllocator>,
    state: watch::Sender<InjectorState>,
}

impl NetworkDisruptionInjector {
    pub fn new(spec: DisruptionSpec, config: InjectorConfig) -> Self {
        let (state, _) = watch::channel(InjectorState::Created);

        Self {
            spec,
            config,
            operations: Vec::new(),
            priorities: Arc::new(PriorityAllocator::new()),
            state,
        }
    }

    /// Observers see the last state transition; the Cleaned broadcast
    /// terminates the reconcilers.
    pub fn state(&self) -> watch::Receiver<InjectorState> {
        self.state.subscribe()
    }

    /// Replaces the driver wiring without touching running reconcilers, they
    /// keep the handles they were spawned with.
    pub fn update_config(&mut self, config: InjectorConfig) {
        self.config = config;
    }

    pub async fn inject(&mut self) -> Result<()> {
        self.config.netns.enter()?;
        let result = self.inject_in_namespace().await;
        let exited = self.config.netns.exit();

        result?;
        exited?;

        self.state.send_replace(InjectorState::Injected);

        Ok(())
    }

    async fn inject_in_namespace(&mut self) -> Result<()> {
        info!(
            drop = self.spec.drop,
            duplicate = self.spec.duplicate,
            corrupt = self.spec.corrupt,
            delay = self.spec.delay,
            delay_jitter = self.spec.delay_jitter,
            bandwidth_limit = self.spec.bandwidth_limit,
            "adding network disruptions"
        );

        if self.spec.delay > 0
            || self.spec.drop > 0
            || self.spec.corrupt > 0
            || self.spec.duplicate > 0
        {
            let delay = Duration::from_millis(u64::from(self.spec.delay));
            let jitter = delay_jitter(self.spec.delay, self.spec.delay_jitter);

            self.operations.push(LinkOperation::Netem {
                delay,
                jitter,
                drop: self.spec.drop,
                corrupt: self.spec.corrupt,
                duplicate: self.spec.duplicate,
            });
        }

        if self.spec.bandwidth_limit > 0 {
            self.operations.push(LinkOperation::OutputLimit {
                bytes_per_sec: self.spec.bandwidth_limit,
            });
        }

        if !self.operations.is_empty() {
            let mut raised_qlen = Vec::new();
            let applied = self.apply_operations(&mut raised_qlen).await;

            for interface in &raised_qlen {
                debug!(interface = %interface, "clearing tx queue length");

                if let Err(err) = self.config.netlink.set_tx_queue_len(interface, 0).await {
                    warn!(interface = %interface, "cannot clear tx queue length: {err}");
                }
            }

            applied?;
            debug!("operations applied successfully");
        }

        info!("writing classid to the target net_cls cgroup");
        self.config
            .cgroup
            .write("net_cls", "net_cls.classid", INJECTOR_CLASSID)?;

        Ok(())
    }

    /// Builds the qdisc tree on every interface and installs the filters:
    ///
    /// ```text
    /// root (1:) prio, 4 bands; filters classify matching packets to 1:4
    ///   |- 1:4
    ///      |- (2:) prio, 2 bands + cgroup filter      (pod level only)
    ///         |- 2:2
    ///            |- (3:) first operation
    ///               |- (4:) second operation
    ///                  ...
    /// ```
    async fn apply_operations(&self, raised_qlen: &mut Vec<String>) -> Result<()> {
        let links = self.config.netlink.link_list().await?;
        let interfaces: Vec<String> = links.iter().map(|link| link.name.clone()).collect();

        let default_routes = self.config.netlink.default_routes().await?;
        for route in &default_routes {
            info!(route = %route, "detected default route");
        }

        // a zero tx queue length would make the prio qdisc drop all outgoing
        // traffic; raise it for the duration of the injection
        for link in &links {
            if link.tx_queue_len == 0 {
                info!(interface = %link.name, "setting tx queue length");
                self.config.netlink.set_tx_queue_len(&link.name, 1000).await?;
                raised_qlen.push(link.name.clone());
            }
        }

        self.config
            .traffic
            .add_prio(&interfaces, "root", 1, 4, PRIOMAP)
            .await?;

        // handle 1 belongs to the root prio qdisc
        let mut parent = String::from("1:4");
        let mut handle = 2u32;

        // scope the disruption to this pod's processes, unless it was applied
        // on init, when more containers may still be created in the pod
        if self.config.level == DisruptionLevel::Pod && !self.config.on_init {
            self.config
                .traffic
                .add_prio(&interfaces, "1:4", 2, 2, [0; 16])
                .await?;
            self.config
                .traffic
                .add_cgroup_filter(&interfaces, "2:0", 2)
                .await?;

            parent = String::from("2:2");
            handle = 3;
        }

        for operation in &self.operations {
            operation
                .apply(self.config.traffic.as_ref(), &interfaces, &parent, handle)
                .await?;

            // the next operation chains below the current one
            parent = format!("{handle}:");
            handle += 1;
        }

        if self.spec.hosts.is_empty() && self.spec.services.is_empty() {
            let catch_all = IpNet::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
                .map_err(|err| ChaosnetError::Driver(format!("invalid catch-all prefix: {err}")))?;

            self.config
                .traffic
                .add_filter(
                    &interfaces,
                    "1:0",
                    self.priorities.next(),
                    0,
                    None,
                    Some(catch_all),
                    0,
                    0,
                    "",
                    "1:4",
                )
                .await?;
        } else {
            self.add_filters_for_hosts(&interfaces, &self.spec.hosts, "1:4", false)
                .await?;
            self.spawn_service_reconcilers(&interfaces).await?;
        }

        // safeguards: divert critical traffic to the undisturbed band, at
        // priorities that beat every disruption filter
        match self.config.level {
            DisruptionLevel::Pod => {
                for route in &default_routes {
                    let gateway = IpNet::from(route.gateway);

                    self.config
                        .traffic
                        .add_filter(
                            &[route.link.clone()],
                            "1:0",
                            self.priorities.next_safeguard(),
                            0,
                            None,
                            Some(gateway),
                            0,
                            0,
                            "",
                            "1:1",
                        )
                        .await?;
                }

                let node_ip = std::env::var(TARGET_POD_HOST_IP).map_err(|_| {
                    ChaosnetError::Config(format!(
                        "{TARGET_POD_HOST_IP} environment variable must be set with the target pod node IP"
                    ))
                })?;
                let node_net = node_ip
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .map_err(|err| {
                        ChaosnetError::Config(format!("invalid node IP {node_ip}: {err}"))
                    })?;

                info!(node_ip = %node_ip, "target pod node IP");

                self.config
                    .traffic
                    .add_filter(
                        &interfaces,
                        "1:0",
                        self.priorities.next_safeguard(),
                        0,
                        None,
                        Some(node_net),
                        0,
                        0,
                        "",
                        "1:1",
                    )
                    .await?;
            }
            DisruptionLevel::Node => {
                // ssh first, then cloud provider health checks and the
                // metadata service
                self.config
                    .traffic
                    .add_filter(
                        &interfaces,
                        "1:0",
                        self.priorities.next_safeguard(),
                        0,
                        None,
                        None,
                        22,
                        0,
                        "tcp",
                        "1:1",
                    )
                    .await?;

                self.config
                    .traffic
                    .add_filter(
                        &interfaces,
                        "1:0",
                        self.priorities.next_safeguard(),
                        0,
                        None,
                        None,
                        0,
                        0,
                        "arp",
                        "1:1",
                    )
                    .await?;

                let metadata = IpNet::from(IpAddr::V4(METADATA_SERVICE_IP));
                self.config
                    .traffic
                    .add_filter(
                        &interfaces,
                        "1:0",
                        self.priorities.next_safeguard(),
                        0,
                        None,
                        Some(metadata),
                        0,
                        0,
                        "",
                        "1:1",
                    )
                    .await?;
            }
        }

        self.add_filters_for_hosts(&interfaces, &self.spec.allowed_hosts, "1:1", true)
            .await?;

        Ok(())
    }

    /// Resolves each host spec and installs one filter per resolved network.
    /// Ingress flows match on the source side, everything else on the
    /// destination side.
    async fn add_filters_for_hosts(
        &self,
        interfaces: &[String],
        hosts: &[HostSpec],
        flowid: &str,
        safeguarded: bool,
    ) -> Result<()> {
        for host in hosts {
            let ips: Vec<Option<IpNet>> = if host.host.is_empty() {
                vec![None]
            } else {
                let resolved = self.config.dns.resolve(&host.host).await?;
                info!(host = %host.host, ips = ?resolved, "resolved host");
                resolved.into_iter().map(Some).collect()
            };

            for ip in ips {
                let (src_ip, dst_ip, src_port, dst_port) = if host.flow == FLOW_INGRESS {
                    (ip, None, host.port, 0)
                } else {
                    (None, ip, 0, host.port)
                };

                let priority = if safeguarded {
                    self.priorities.next_safeguard()
                } else {
                    self.priorities.next()
                };

                self.config
                    .traffic
                    .add_filter(
                        interfaces, "1:0", priority, 0, src_ip, dst_ip, src_port, dst_port,
                        &host.protocol, flowid,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Spawns one reconciler per target service; each keeps its filters in
    /// sync with the live service and endpoint state until Clean.
    async fn spawn_service_reconcilers(&self, interfaces: &[String]) -> Result<()> {
        if self.spec.services.is_empty() {
            return Ok(());
        }

        let cluster = self.config.cluster.clone().ok_or_else(|| {
            ChaosnetError::Config("a cluster client is required to disrupt services".to_string())
        })?;

        for target in &self.spec.services {
            let ctx = WatcherContext {
                traffic: Arc::clone(&self.config.traffic),
                cluster: Arc::clone(&cluster),
                netns: Arc::clone(&self.config.netns),
                priorities: Arc::clone(&self.priorities),
                interfaces: interfaces.to_vec(),
                flowid: String::from("1:4"),
            };

            let watcher = ServiceWatcher::new(ctx, target.clone(), self.state.subscribe()).await?;
            tokio::spawn(watcher.run());
        }

        Ok(())
    }

    /// Removes every disruption: wipes the custom root qdiscs (installed
    /// filters disappear with them) and resets the cgroup classid. Both are
    /// attempted regardless of the other failing, and Cleaned is broadcast
    /// in every case so the reconcilers stop.
    pub async fn clean(&self) -> Result<()> {
        let result = self.clean_in_namespace().await;
        self.state.send_replace(InjectorState::Cleaned);
        result
    }

    async fn clean_in_namespace(&self) -> Result<()> {
        self.config.netns.enter()?;

        let cleared = self.clear_operations().await;
        let cgroup_reset = self.reset_cgroup();
        let exited = self.config.netns.exit();

        cleared?;
        cgroup_reset?;
        exited
    }

    async fn clear_operations(&self) -> Result<()> {
        info!("clearing root qdiscs");

        let links = self.config.netlink.link_list().await?;
        let interfaces: Vec<String> = links.iter().map(|link| link.name.clone()).collect();

        self.config.traffic.clear_qdisc(&interfaces).await
    }

    fn reset_cgroup(&self) -> Result<()> {
        if self.config.cgroup.exists("net_cls")? {
            self.config.cgroup.write("net_cls", "net_cls.classid", "0x0")?;
        }

        Ok(())
    }
}

/// Jitter defaults to 10% of the delay; an explicit percentage overrides it.
/// The result is clamped to 1ms.
fn delay_jitter(delay_ms: u32, jitter_pct: u8) -> Duration {
    let jitter_ms = if jitter_pct == 0 {
        f64::from(delay_ms) * 0.1
    } else {
        f64::from(jitter_pct) / 100.0 * f64::from(delay_ms)
    };

    Duration::from_millis(jitter_ms.max(1.0) as u64)
}
