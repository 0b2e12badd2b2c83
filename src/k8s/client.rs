use crate::error::{ChaosnetError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use tracing::debug;

/// Event from a cluster watch stream, decoded far enough for the reconciler.
#[derive(Debug)]
pub enum ClusterEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Carries only the updated resource version.
    Bookmark(String),
    /// Watch-level failure; the message is present when the status object
    /// could be decoded.
    Error(Option<String>),
}

pub type EventStream<K> = BoxStream<'static, ClusterEvent<K>>;

/// The cluster operations the injector consumes.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn watch_services(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<EventStream<Service>>;

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<Pod>>;
}

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub async fn try_default() -> Result<Self> {
        debug!("initializing kubernetes client");

        let client = Client::try_default().await.map_err(|err| {
            ChaosnetError::ClusterApi(format!("failed to create kubernetes client: {err}"))
        })?;

        Ok(Self { client })
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn decode<K>(event: kube::Result<WatchEvent<K>>) -> ClusterEvent<K> {
    match event {
        Ok(WatchEvent::Added(object)) => ClusterEvent::Added(object),
        Ok(WatchEvent::Modified(object)) => ClusterEvent::Modified(object),
        Ok(WatchEvent::Deleted(object)) => ClusterEvent::Deleted(object),
        Ok(WatchEvent::Bookmark(bookmark)) => {
            ClusterEvent::Bookmark(bookmark.metadata.resource_version)
        }
        Ok(WatchEvent::Error(status)) => ClusterEvent::Error(Some(status.message)),
        Err(_) => ClusterEvent::Error(None),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.services(namespace).get(name).await.map_err(|err| {
            ChaosnetError::ClusterApi(format!("failed to get service {namespace}/{name}: {err}"))
        })
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);

        let pods = self.pods(namespace).list(&params).await.map_err(|err| {
            ChaosnetError::ClusterApi(format!("failed to list pods in {namespace}: {err}"))
        })?;

        Ok(pods.items)
    }

    async fn watch_services(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<EventStream<Service>> {
        // bookmarks are requested by default and keep the resource version
        // cursor fresh across quiet periods
        let params = WatchParams::default();

        let stream = self
            .services(namespace)
            .watch(&params, resource_version)
            .await
            .map_err(|err| {
                ChaosnetError::ClusterApi(format!(
                    "failed to watch services in {namespace}: {err}"
                ))
            })?;

        Ok(stream.map(decode).boxed())
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<Pod>> {
        let params = WatchParams::default().labels(label_selector);

        let stream = self
            .pods(namespace)
            .watch(&params, resource_version)
            .await
            .map_err(|err| {
                ChaosnetError::ClusterApi(format!("failed to watch pods in {namespace}: {err}"))
            })?;

        Ok(stream.map(decode).boxed())
    }
}
