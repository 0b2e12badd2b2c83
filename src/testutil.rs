//! In-memory driver fakes recording the calls they receive.

use crate::error::{ChaosnetError, Result};
use crate::k8s::{ClusterClient, ClusterEvent, EventStream};
use crate::network::{
    CgroupManager, DefaultRoute, DnsClient, NetlinkAdapter, NetlinkLink, NetworkNamespace,
    TrafficController,
};
use async_trait::async_trait;
use futures::StreamExt;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Pod, PodStatus, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, PartialEq)]
pub enum TcCall {
    AddPrio {
        interfaces: Vec<String>,
        parent: String,
        handle: u32,
        bands: u32,
        priomap: [u32; 16],
    },
    AddCgroupFilter {
        interfaces: Vec<String>,
        parent: String,
        handle: u32,
    },
    AddFilter {
        interfaces: Vec<String>,
        parent: String,
        priority: u32,
        src_ip: Option<IpNet>,
        dst_ip: Option<IpNet>,
        src_port: u16,
        dst_port: u16,
        protocol: String,
        flowid: String,
    },
    AddNetem {
        interfaces: Vec<String>,
        parent: String,
        handle: u32,
        delay: Duration,
        jitter: Duration,
        drop: u8,
        corrupt: u8,
        duplicate: u8,
    },
    AddOutputLimit {
        interfaces: Vec<String>,
        parent: String,
        handle: u32,
        bytes_per_sec: u64,
    },
    DeleteFilter {
        interface: String,
        priority: u32,
    },
    ClearQdisc {
        interfaces: Vec<String>,
    },
}

#[derive(Default)]
pub struct RecordingTc {
    calls: Mutex<Vec<TcCall>>,
}

impl RecordingTc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TcCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: TcCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TrafficController for RecordingTc {
    async fn add_prio(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
        bands: u32,
        priomap: [u32; 16],
    ) -> Result<()> {
        self.record(TcCall::AddPrio {
            interfaces: interfaces.to_vec(),
            parent: parent.to_string(),
            handle,
            bands,
            priomap,
        });
        Ok(())
    }

    async fn add_cgroup_filter(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
    ) -> Result<()> {
        self.record(TcCall::AddCgroupFilter {
            interfaces: interfaces.to_vec(),
            parent: parent.to_string(),
            handle,
        });
        Ok(())
    }

    async fn add_filter(
        &self,
        interfaces: &[String],
        parent: &str,
        priority: u32,
        _handle: u32,
        src_ip: Option<IpNet>,
        dst_ip: Option<IpNet>,
        src_port: u16,
        dst_port: u16,
        protocol: &str,
        flowid: &str,
    ) -> Result<()> {
        self.record(TcCall::AddFilter {
            interfaces: interfaces.to_vec(),
            parent: parent.to_string(),
            priority,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol: protocol.to_string(),
            flowid: flowid.to_string(),
        });
        Ok(())
    }

    async fn add_netem(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
        delay: Duration,
        jitter: Duration,
        drop: u8,
        corrupt: u8,
        duplicate: u8,
    ) -> Result<()> {
        self.record(TcCall::AddNetem {
            interfaces: interfaces.to_vec(),
            parent: parent.to_string(),
            handle,
            delay,
            jitter,
            drop,
            corrupt,
            duplicate,
        });
        Ok(())
    }

    async fn add_output_limit(
        &self,
        interfaces: &[String],
        parent: &str,
        handle: u32,
        bytes_per_sec: u64,
    ) -> Result<()> {
        self.record(TcCall::AddOutputLimit {
            interfaces: interfaces.to_vec(),
            parent: parent.to_string(),
            handle,
            bytes_per_sec,
        });
        Ok(())
    }

    async fn delete_filter(&self, interface: &str, priority: u32) -> Result<()> {
        self.record(TcCall::DeleteFilter {
            interface: interface.to_string(),
            priority,
        });
        Ok(())
    }

    async fn clear_qdisc(&self, interfaces: &[String]) -> Result<()> {
        self.record(TcCall::ClearQdisc {
            interfaces: interfaces.to_vec(),
        });
        Ok(())
    }
}

pub struct FakeNetlink {
    links: Vec<NetlinkLink>,
    routes: Vec<DefaultRoute>,
    qlen_calls: Mutex<Vec<(String, u32)>>,
}

impl FakeNetlink {
    pub fn with_links(links: &[(&str, u32)]) -> Self {
        Self {
            links: links
                .iter()
                .map(|(name, qlen)| NetlinkLink {
                    name: name.to_string(),
                    tx_queue_len: *qlen,
                })
                .collect(),
            routes: Vec::new(),
            qlen_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn route(mut self, gateway: &str, link: &str) -> Self {
        self.routes.push(DefaultRoute {
            gateway: gateway.parse().unwrap(),
            link: link.to_string(),
        });
        self
    }

    pub fn qlen_calls(&self) -> Vec<(String, u32)> {
        self.qlen_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetlinkAdapter for FakeNetlink {
    async fn link_list(&self) -> Result<Vec<NetlinkLink>> {
        Ok(self.links.clone())
    }

    async fn default_routes(&self) -> Result<Vec<DefaultRoute>> {
        Ok(self.routes.clone())
    }

    async fn set_tx_queue_len(&self, interface: &str, qlen: u32) -> Result<()> {
        self.qlen_calls
            .lock()
            .unwrap()
            .push((interface.to_string(), qlen));
        Ok(())
    }
}

/// Resolves CIDRs and literals like the real client and everything else from
/// a canned table.
#[derive(Default)]
pub struct FakeDns {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl FakeDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, host: &str, ips: &[&str]) -> Self {
        self.entries.insert(
            host.to_string(),
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        );
        self
    }
}

#[async_trait]
impl DnsClient for FakeDns {
    async fn resolve(&self, host: &str) -> Result<Vec<IpNet>> {
        if let Ok(net) = host.parse::<IpNet>() {
            return Ok(vec![net]);
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![IpNet::from(ip)]);
        }

        self.entries
            .get(host)
            .map(|ips| ips.iter().map(|ip| IpNet::from(*ip)).collect())
            .ok_or_else(|| ChaosnetError::Lookup(format!("no fake entry for {host}")))
    }
}

#[derive(Default)]
pub struct FakeNetns {
    entered: AtomicUsize,
    exited: AtomicUsize,
}

impl FakeNetns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn exited(&self) -> usize {
        self.exited.load(Ordering::SeqCst)
    }
}

impl NetworkNamespace for FakeNetns {
    fn enter(&self) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        self.exited.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeCgroup {
    present: bool,
    writes: Mutex<Vec<(String, String, String)>>,
}

impl FakeCgroup {
    pub fn new(present: bool) -> Self {
        Self {
            present,
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn writes(&self) -> Vec<(String, String, String)> {
        self.writes.lock().unwrap().clone()
    }
}

impl CgroupManager for FakeCgroup {
    fn write(&self, controller: &str, file: &str, value: &str) -> Result<()> {
        self.writes.lock().unwrap().push((
            controller.to_string(),
            file.to_string(),
            value.to_string(),
        ));
        Ok(())
    }

    fn exists(&self, _controller: &str) -> Result<bool> {
        Ok(self.present)
    }
}

/// Cluster fake with canned objects and scripted watch streams. A stream is
/// handed out once; script a new one to survive a watch rebuild.
#[derive(Default)]
pub struct FakeCluster {
    services: Mutex<HashMap<String, Service>>,
    pods: Mutex<Vec<Pod>>,
    service_events: Mutex<Option<mpsc::UnboundedReceiver<ClusterEvent<Service>>>>,
    pod_events: Mutex<Option<mpsc::UnboundedReceiver<ClusterEvent<Pod>>>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, namespace: &str, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.services
            .lock()
            .unwrap()
            .insert(format!("{namespace}/{name}"), service);
    }

    pub fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn service_stream(&self) -> mpsc::UnboundedSender<ClusterEvent<Service>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.service_events.lock().unwrap() = Some(rx);
        tx
    }

    pub fn pod_stream(&self) -> mpsc::UnboundedSender<ClusterEvent<Pod>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.pod_events.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.services
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or_else(|| {
                ChaosnetError::ClusterApi(format!("service {namespace}/{name} not found"))
            })
    }

    async fn list_pods(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn watch_services(
        &self,
        _namespace: &str,
        _resource_version: &str,
    ) -> Result<EventStream<Service>> {
        match self.service_events.lock().unwrap().take() {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(ChaosnetError::ClusterApi(
                "no scripted service stream".to_string(),
            )),
        }
    }

    async fn watch_pods(
        &self,
        _namespace: &str,
        _label_selector: &str,
        _resource_version: &str,
    ) -> Result<EventStream<Pod>> {
        match self.pod_events.lock().unwrap().take() {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(ChaosnetError::ClusterApi(
                "no scripted pod stream".to_string(),
            )),
        }
    }
}

pub fn test_service(
    name: &str,
    namespace: &str,
    cluster_ip: Option<&str>,
    selector: &[(&str, &str)],
    ports: Vec<ServicePort>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: cluster_ip.map(str::to_string),
            selector: Some(
                selector
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            ),
            ports: Some(ports),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub fn test_pod(name: &str, ip: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        status: Some(PodStatus {
            pod_ip: ip.map(str::to_string),
            ..PodStatus::default()
        }),
        ..Pod::default()
    }
}

pub fn service_port(port: i32, target_port: i32, protocol: &str) -> ServicePort {
    ServicePort {
        port,
        target_port: Some(IntOrString::Int(target_port)),
        protocol: Some(protocol.to_string()),
        ..ServicePort::default()
    }
}
