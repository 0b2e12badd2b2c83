//! Per-service reconciler keeping tc filters in sync with the live state of
//! a cluster service and its endpoint pods.

use crate::error::{ChaosnetError, Result};
use crate::injector::priority::PriorityAllocator;
use crate::injector::InjectorState;
use crate::k8s::{label_selector, ClusterClient, ClusterEvent, EventStream};
use crate::network::{NetworkNamespace, TrafficController};
use crate::spec::ServiceRef;
use futures::StreamExt;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// An (ip, port, protocol) tuple resolved from a cluster service or one of
/// its endpoint pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub ip: IpNet,
    pub port: u16,
    pub protocol: String,
}

impl fmt::Display for ResolvedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ip={}; port={}; protocol={}",
            self.ip, self.port, self.protocol
        )
    }
}

/// A resolved service together with the kernel filter priority it was
/// installed under; the priority is the deletion handle.
#[derive(Debug, Clone)]
pub struct TcServiceFilter {
    pub service: ResolvedService,
    pub priority: u32,
}

/// Shared handles a reconciler needs to apply filter changes.
pub(crate) struct WatcherContext {
    pub traffic: Arc<dyn TrafficController>,
    pub cluster: Arc<dyn ClusterClient>,
    pub netns: Arc<dyn NetworkNamespace>,
    pub priorities: Arc<PriorityAllocator>,
    pub interfaces: Vec<String>,
    pub flowid: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Added,
    Modified,
    Deleted,
}

enum Wakeup {
    State(bool),
    Service(Option<ClusterEvent<Service>>),
    Pod(Option<ClusterEvent<Pod>>),
}

pub(crate) struct ServiceWatcher {
    ctx: WatcherContext,
    target: ServiceRef,
    state: watch::Receiver<InjectorState>,

    service_ports: Vec<ServicePort>,
    pod_selector: String,
    services_resource_version: String,
    pods_resource_version: String,
    service_events: Option<EventStream<Service>>,
    pod_events: Option<EventStream<Pod>>,
    pods_without_ips: Vec<String>,
    filters_from_pod_endpoints: Vec<TcServiceFilter>,
    filters_from_cluster_service: Vec<TcServiceFilter>,
}

impl ServiceWatcher {
    /// Fetches the target service once to learn its ports and selector, and
    /// returns a watcher ready to run.
    pub(crate) async fn new(
        ctx: WatcherContext,
        target: ServiceRef,
        state: watch::Receiver<InjectorState>,
    ) -> Result<Self> {
        let service = ctx.cluster.get_service(&target.namespace, &target.name).await?;
        let spec = service.spec.unwrap_or_default();

        Ok(Self {
            ctx,
            target,
            state,
            service_ports: spec.ports.unwrap_or_default(),
            pod_selector: label_selector(&spec.selector.unwrap_or_default()),
            services_resource_version: String::new(),
            pods_resource_version: String::new(),
            service_events: None,
            pod_events: None,
            pods_without_ips: Vec::new(),
            filters_from_pod_endpoints: Vec::new(),
            filters_from_cluster_service: Vec::new(),
        })
    }

    /// Event loop: consumes the two watch streams one event at a time,
    /// recreating a stream from its cursor whenever it drops, until the
    /// injector broadcasts Cleaned.
    pub(crate) async fn run(mut self) {
        loop {
            if self.service_events.is_none() {
                match self
                    .ctx
                    .cluster
                    .watch_services(&self.target.namespace, &self.services_resource_version)
                    .await
                {
                    Ok(stream) => {
                        info!(service = %self.target, "starting cluster service watch");
                        self.service_events = Some(stream);
                    }
                    Err(err) => {
                        error!(service = %self.target, "cannot watch cluster services: {err}");
                        return;
                    }
                }
            }

            if self.pod_events.is_none() {
                match self
                    .ctx
                    .cluster
                    .watch_pods(
                        &self.target.namespace,
                        &self.pod_selector,
                        &self.pods_resource_version,
                    )
                    .await
                {
                    Ok(stream) => {
                        info!(service = %self.target, "starting endpoint pods watch");
                        self.pod_events = Some(stream);
                    }
                    Err(err) => {
                        error!(service = %self.target, "cannot watch endpoint pods: {err}");
                        return;
                    }
                }
            }

            let wakeup = {
                let state = &mut self.state;
                let service_events = &mut self.service_events;
                let pod_events = &mut self.pod_events;

                tokio::select! {
                    changed = state.changed() => Wakeup::State(changed.is_err()),
                    event = next_event(service_events) => Wakeup::Service(event),
                    event = next_event(pod_events) => Wakeup::Pod(event),
                }
            };

            match wakeup {
                Wakeup::State(sender_gone) => {
                    if sender_gone || *self.state.borrow() == InjectorState::Cleaned {
                        debug!(service = %self.target, "reconciler terminating");
                        return;
                    }
                }
                Wakeup::Service(None) => self.service_events = None,
                Wakeup::Service(Some(event)) => {
                    if let Err(err) = self.handle_service_event(event).await {
                        if err.is_transient_conflict() {
                            warn!(service = %self.target, "transient conflict, retrying: {err}");
                            continue;
                        }

                        error!(service = %self.target, "cannot apply service change, rebuilding watch: {err}");
                        self.purge_cluster_service_filters().await;
                        self.service_events = None;
                    }
                }
                Wakeup::Pod(None) => self.pod_events = None,
                Wakeup::Pod(Some(event)) => {
                    if let Err(err) = self.handle_pod_event(event).await {
                        if err.is_transient_conflict() {
                            warn!(service = %self.target, "transient conflict, retrying: {err}");
                            continue;
                        }

                        error!(service = %self.target, "cannot apply pod change, rebuilding watch: {err}");
                        self.purge_pod_endpoint_filters().await;
                        self.pod_events = None;
                    }
                }
            }
        }
    }

    async fn handle_service_event(&mut self, event: ClusterEvent<Service>) -> Result<()> {
        let (kind, service) = match event {
            ClusterEvent::Added(service) => (EventKind::Added, service),
            ClusterEvent::Modified(service) => (EventKind::Modified, service),
            ClusterEvent::Deleted(service) => (EventKind::Deleted, service),
            ClusterEvent::Bookmark(version) => {
                self.services_resource_version = version;
                return Ok(());
            }
            ClusterEvent::Error(message) => {
                return Err(watch_error("cluster service", &self.target, message))
            }
        };

        // the watch covers the whole namespace
        if service.metadata.name.as_deref() != Some(self.target.name.as_str()) {
            return Ok(());
        }

        self.ctx.netns.enter()?;
        let result = self.apply_service_change(kind, service).await;
        let exited = self.ctx.netns.exit();

        result?;
        exited
    }

    async fn apply_service_change(&mut self, kind: EventKind, service: Service) -> Result<()> {
        let spec = service.spec.clone().unwrap_or_default();
        let selector = label_selector(&spec.selector.clone().unwrap_or_default());
        let pods = self
            .ctx
            .cluster
            .list_pods(&self.target.namespace, &selector)
            .await?;

        if is_headless(&service) {
            // no virtual IP: block the endpoint IPs wholesale, whatever port
            // they serve on
            self.service_ports = vec![ServicePort {
                port: 0,
                ..ServicePort::default()
            }];
        } else {
            self.service_ports = spec.ports.clone().unwrap_or_default();
        }

        self.reconcile_pod_endpoints(&pods).await?;

        let desired = build_filters_from_service(&service, &self.service_ports);

        match kind {
            EventKind::Added => {
                let created = Self::add_service_filters(&self.ctx, &self.target, desired).await?;
                self.filters_from_cluster_service.extend(created);
            }
            EventKind::Modified => {
                for filter in std::mem::take(&mut self.filters_from_cluster_service) {
                    Self::remove_service_filter(&self.ctx, &self.target, &filter).await?;
                }

                self.filters_from_cluster_service = Self::add_service_filters(&self.ctx, &self.target, desired).await?;
            }
            EventKind::Deleted => {
                for tuple in &desired {
                    if let Some(idx) = self
                        .filters_from_cluster_service
                        .iter()
                        .position(|filter| filter.service == *tuple)
                    {
                        let filter = self.filters_from_cluster_service.remove(idx);
                        if let Err(err) = Self::remove_service_filter(&self.ctx, &self.target, &filter).await {
                            self.filters_from_cluster_service.push(filter);
                            return Err(err);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_pod_event(&mut self, event: ClusterEvent<Pod>) -> Result<()> {
        let (kind, pod) = match event {
            ClusterEvent::Added(pod) => (EventKind::Added, pod),
            ClusterEvent::Modified(pod) => (EventKind::Modified, pod),
            ClusterEvent::Deleted(pod) => (EventKind::Deleted, pod),
            ClusterEvent::Bookmark(version) => {
                self.pods_resource_version = version;
                return Ok(());
            }
            ClusterEvent::Error(message) => {
                return Err(watch_error("endpoint pods", &self.target, message))
            }
        };

        self.ctx.netns.enter()?;
        let result = self.apply_pod_change(kind, pod).await;
        let exited = self.ctx.netns.exit();

        result?;
        exited
    }

    async fn apply_pod_change(&mut self, kind: EventKind, pod: Pod) -> Result<()> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let resolved = build_filters_from_pod(&pod, &self.service_ports);

        match kind {
            EventKind::Added => {
                if pod_ip(&pod).is_some() {
                    let missing: Vec<ResolvedService> = resolved
                        .into_iter()
                        .filter(|service| !self.has_endpoint_filter(service))
                        .collect();

                    let created = Self::add_service_filters(&self.ctx, &self.target, missing).await?;
                    self.filters_from_pod_endpoints.extend(created);
                } else {
                    info!(pod = %name, service = %self.target, "pod has no IP yet, deferring filter installation");

                    if !self.pods_without_ips.contains(&name) {
                        self.pods_without_ips.push(name);
                    }
                }
            }
            EventKind::Modified => {
                if let Some(idx) = self
                    .pods_without_ips
                    .iter()
                    .position(|pending| *pending == name)
                {
                    if pod_ip(&pod).is_some() {
                        let created = Self::add_service_filters(&self.ctx, &self.target, resolved).await?;
                        self.filters_from_pod_endpoints.extend(created);
                        self.pods_without_ips.remove(idx);
                    }
                }
            }
            EventKind::Deleted => {
                for tuple in &resolved {
                    if let Some(idx) = self
                        .filters_from_pod_endpoints
                        .iter()
                        .position(|filter| filter.service == *tuple)
                    {
                        let filter = self.filters_from_pod_endpoints.remove(idx);
                        if let Err(err) = Self::remove_service_filter(&self.ctx, &self.target, &filter).await {
                            self.filters_from_pod_endpoints.push(filter);
                            return Err(err);
                        }
                    }
                }

                self.pods_without_ips.retain(|pending| *pending != name);
            }
        }

        Ok(())
    }

    /// Diffs the endpoint tuples derivable from the given pods against the
    /// installed endpoint filters: missing ones are installed, stale ones
    /// removed, surviving ones keep their priority.
    async fn reconcile_pod_endpoints(&mut self, pods: &[Pod]) -> Result<()> {
        let mut to_create = Vec::new();
        for pod in pods {
            // pods without an IP are picked up later by the pod watch
            for service in build_filters_from_pod(pod, &self.service_ports) {
                if !to_create.contains(&service) {
                    to_create.push(service);
                }
            }
        }

        let mut kept = Vec::new();
        let mut previous = std::mem::take(&mut self.filters_from_pod_endpoints).into_iter();

        while let Some(filter) = previous.next() {
            if let Some(idx) = to_create.iter().position(|service| *service == filter.service) {
                to_create.remove(idx);
                kept.push(filter);
            } else if let Err(err) = Self::remove_service_filter(&self.ctx, &self.target, &filter).await {
                kept.push(filter);
                kept.extend(previous);
                self.filters_from_pod_endpoints = kept;
                return Err(err);
            }
        }

        match Self::add_service_filters(&self.ctx, &self.target, to_create).await {
            Ok(created) => {
                kept.extend(created);
                self.filters_from_pod_endpoints = kept;
                Ok(())
            }
            Err(err) => {
                self.filters_from_pod_endpoints = kept;
                Err(err)
            }
        }
    }

    /// Installs one tc filter per resolved tuple, allocating a priority for
    /// each, and returns the installed set.
    async fn add_service_filters(
        ctx: &WatcherContext,
        target: &ServiceRef,
        services: Vec<ResolvedService>,
    ) -> Result<Vec<TcServiceFilter>> {
        let mut installed = Vec::with_capacity(services.len());

        for service in services {
            let priority = ctx.priorities.next();

            info!(endpoint = %service, service = %target, "installing service filter");

            ctx.traffic
                .add_filter(
                    &ctx.interfaces,
                    "1:0",
                    priority,
                    0,
                    None,
                    Some(service.ip),
                    0,
                    service.port,
                    &service.protocol,
                    &ctx.flowid,
                )
                .await?;

            installed.push(TcServiceFilter { service, priority });
        }

        Ok(installed)
    }

    async fn remove_service_filter(
        ctx: &WatcherContext,
        target: &ServiceRef,
        filter: &TcServiceFilter,
    ) -> Result<()> {
        for interface in &ctx.interfaces {
            ctx.traffic.delete_filter(interface, filter.priority).await?;
        }

        info!(endpoint = %filter.service, service = %target, "removed service filter");

        Ok(())
    }

    fn has_endpoint_filter(&self, service: &ResolvedService) -> bool {
        self.filters_from_pod_endpoints
            .iter()
            .any(|filter| filter.service == *service)
    }

    /// Best-effort removal of every filter owned by the cluster-service half,
    /// leaving the endpoint half untouched.
    async fn purge_cluster_service_filters(&mut self) {
        for filter in std::mem::take(&mut self.filters_from_cluster_service) {
            if let Err(err) = Self::remove_service_filter(&self.ctx, &self.target, &filter).await {
                warn!(endpoint = %filter.service, "cannot remove filter while rebuilding watch: {err}");
            }
        }
    }

    async fn purge_pod_endpoint_filters(&mut self) {
        for filter in std::mem::take(&mut self.filters_from_pod_endpoints) {
            if let Err(err) = Self::remove_service_filter(&self.ctx, &self.target, &filter).await {
                warn!(endpoint = %filter.service, "cannot remove filter while rebuilding watch: {err}");
            }
        }
    }
}

async fn next_event<K>(stream: &mut Option<EventStream<K>>) -> Option<ClusterEvent<K>> {
    match stream {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

fn watch_error(stream: &str, target: &ServiceRef, message: Option<String>) -> ChaosnetError {
    match message {
        Some(message) => {
            ChaosnetError::ClusterApi(format!("{stream} watch for {target} failed: {message}"))
        }
        None => ChaosnetError::ClusterApi(format!("{stream} watch for {target} failed")),
    }
}

fn pod_ip(pod: &Pod) -> Option<IpNet> {
    let ip = pod.status.as_ref()?.pod_ip.as_deref()?;
    ip.parse::<IpAddr>().ok().map(IpNet::from)
}

fn is_headless(service: &Service) -> bool {
    match service.spec.as_ref().and_then(|spec| spec.cluster_ip.as_deref()) {
        None => true,
        Some(ip) => ip.is_empty() || ip.eq_ignore_ascii_case("none"),
    }
}

fn cluster_ip(service: &Service) -> Option<IpNet> {
    let ip = service.spec.as_ref()?.cluster_ip.as_deref()?;
    ip.parse::<IpAddr>().ok().map(IpNet::from)
}

fn service_port(port: &ServicePort) -> u16 {
    u16::try_from(port.port).unwrap_or(0)
}

fn target_port(port: &ServicePort) -> u16 {
    match &port.target_port {
        Some(IntOrString::Int(value)) => u16::try_from(*value).unwrap_or(0),
        // named target ports cannot be resolved without the pod spec
        _ => 0,
    }
}

/// One tuple per port record, keyed by the pod IP and the port's target port.
fn build_filters_from_pod(pod: &Pod, ports: &[ServicePort]) -> Vec<ResolvedService> {
    let Some(ip) = pod_ip(pod) else {
        return Vec::new();
    };

    let mut resolved = Vec::new();
    for port in ports {
        let service = ResolvedService {
            ip,
            port: target_port(port),
            protocol: port.protocol.clone().unwrap_or_default(),
        };

        if !resolved.contains(&service) {
            resolved.push(service);
        }
    }

    resolved
}

/// One tuple per port record, keyed by the cluster IP and the service port.
/// Headless services have no cluster IP to filter on.
fn build_filters_from_service(service: &Service, ports: &[ServicePort]) -> Vec<ResolvedService> {
    if is_headless(service) {
        return Vec::new();
    }

    let Some(ip) = cluster_ip(service) else {
        return Vec::new();
    };

    let mut resolved = Vec::new();
    for port in ports {
        let tuple = ResolvedService {
            ip,
            port: service_port(port),
            protocol: port.protocol.clone().unwrap_or_default(),
        };

        if !resolved.contains(&tuple) {
            resolved.push(tuple);
        }
    }

    resolved
}
