// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The cluster API seam.
//!
//! [`ClusterApi`] captures the capabilities the engine consumes from the
//! cluster: namespaced create and watch on Services and Pods. The production
//! implementation is [`KubeCluster`]; tests substitute in-memory fakes.

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, PostParams};
use kube::client::Client;
use kube::runtime::watcher;
use tracing::warn;

/// One event on a watch stream.
///
/// `Restarted` carries a full listing and is delivered when the watch is
/// (re)established: once at startup, and again whenever the underlying
/// client has to re-list after losing its position in the event history.
/// Consumers treat every `Restarted` like the initial listing.
#[derive(Clone, Debug)]
pub enum WatchEvent<T> {
    Applied(T),
    Deleted(T),
    Restarted(Vec<T>),
}

/// The cluster capabilities consumed by the deployment engine.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_service(&self, service: Service) -> Result<Service, anyhow::Error>;

    async fn create_pod(&self, pod: Pod) -> Result<Pod, anyhow::Error>;

    /// Watches services matching the label `selector`.
    fn watch_services(
        &self,
        selector: &str,
    ) -> BoxStream<'static, Result<WatchEvent<Service>, anyhow::Error>>;

    /// Watches pods matching the label `selector`.
    fn watch_pods(
        &self,
        selector: &str,
    ) -> BoxStream<'static, Result<WatchEvent<Pod>, anyhow::Error>>;
}

/// A [`ClusterApi`] backed by a Kubernetes cluster through `kube`.
pub struct KubeCluster {
    service_api: Api<Service>,
    pod_api: Api<Pod>,
}

impl KubeCluster {
    /// Connects using the inferred Kubernetes configuration (in-cluster
    /// environment or local kubeconfig) and targets `namespace`.
    pub async fn connect(namespace: &str) -> Result<KubeCluster, anyhow::Error> {
        let client = Client::try_default()
            .await
            .context("connecting to the cluster")?;
        Ok(KubeCluster {
            service_api: Api::namespaced(client.clone(), namespace),
            pod_api: Api::namespaced(client, namespace),
        })
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_service(&self, service: Service) -> Result<Service, anyhow::Error> {
        Ok(self
            .service_api
            .create(&PostParams::default(), &service)
            .await?)
    }

    async fn create_pod(&self, pod: Pod) -> Result<Pod, anyhow::Error> {
        Ok(self.pod_api.create(&PostParams::default(), &pod).await?)
    }

    fn watch_services(
        &self,
        selector: &str,
    ) -> BoxStream<'static, Result<WatchEvent<Service>, anyhow::Error>> {
        watch(self.service_api.clone(), selector)
    }

    fn watch_pods(
        &self,
        selector: &str,
    ) -> BoxStream<'static, Result<WatchEvent<Pod>, anyhow::Error>> {
        watch(self.pod_api.clone(), selector)
    }
}

fn watch<K>(api: Api<K>, selector: &str) -> BoxStream<'static, Result<WatchEvent<K>, anyhow::Error>>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
{
    let params = ListParams::default().labels(selector);
    let stream = watcher(api, params).filter_map(|event| async move {
        match event {
            Ok(watcher::Event::Applied(obj)) => Some(Ok(WatchEvent::Applied(obj))),
            Ok(watcher::Event::Deleted(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
            Ok(watcher::Event::Restarted(objs)) => Some(Ok(WatchEvent::Restarted(objs))),
            Err(error) => {
                // The watcher re-lists and resumes on its own; transient
                // errors are not actionable here.
                warn!("watch error: {}", error);
                None
            }
        }
    });
    Box::pin(stream)
}
