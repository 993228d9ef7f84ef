// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The convergence loop.
//!
//! Drives a deployment from an empty namespace to every service reporting
//! ready. Bootstrap kicks off image resolution for every app and service
//! materialization concurrently, then seeds pods for the apps with no
//! predecessors. From there the loop is a single consumer of the pod watch:
//! each event raises the owning app's observed status (monotonically),
//! re-evaluates the dependency gate, and creates whichever pods became
//! eligible. The loop exits when every app has reported ready, or on the
//! first error from any path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::HostAlias;
use kc_compose::Composition;
use kc_docker_util::{ImageDaemon, LocalImageIndex};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::info;

use crate::apps::{App, Apps, ObservedStatus};
use crate::cluster::{ClusterApi, WatchEvent};
use crate::error::{external, SharedError};
use crate::{deps, images, pods, services, UpConfig};

/// State shared between the convergence loop and its background tasks. The
/// cells are written once; the first writer's result, error or not, is what
/// every waiter sees.
pub(crate) struct RunContext {
    pub cfg: UpConfig,
    pub cluster: Arc<dyn ClusterApi>,
    pub daemon: Arc<dyn ImageDaemon>,
    pub apps: Apps,
    pub(crate) image_index: OnceCell<Result<LocalImageIndex, SharedError>>,
    pub(crate) host_aliases: OnceCell<Result<Vec<HostAlias>, SharedError>>,
}

/// A single deployment run.
pub struct Up {
    ctx: Arc<RunContext>,
    /// Highest status observed per app. Only this loop writes it.
    statuses: BTreeMap<String, ObservedStatus>,
    /// Apps whose pod has been submitted.
    created: BTreeSet<String>,
}

impl Up {
    /// Prepares a run: builds the app records and validates the composition
    /// (encoded-name collisions, undefined dependencies).
    pub fn new(
        cfg: UpConfig,
        composition: &Composition,
        cluster: Arc<dyn ClusterApi>,
        daemon: Arc<dyn ImageDaemon>,
    ) -> Result<Up, anyhow::Error> {
        let apps = Apps::new(composition)?;
        Ok(Up {
            ctx: Arc::new(RunContext {
                cfg,
                cluster,
                daemon,
                apps,
                image_index: OnceCell::new(),
                host_aliases: OnceCell::new(),
            }),
            statuses: BTreeMap::new(),
            created: BTreeSet::new(),
        })
    }

    /// Runs the deployment to convergence.
    pub async fn run(mut self) -> Result<(), anyhow::Error> {
        let _background = self.spawn_background();

        let seeds: Vec<_> = self
            .ctx
            .apps
            .iter()
            .filter(|app| app.config.depends_on.is_empty())
            .cloned()
            .collect();
        for app in seeds {
            self.create_pod(&app).await?;
        }

        let mut stream = self.ctx.cluster.watch_pods(&self.ctx.cfg.selector());
        while !self.all_ready() {
            let event = stream
                .next()
                .await
                .ok_or_else(|| anyhow!("pod watch ended before every service became ready"))?
                .context("watching pods")?;
            match event {
                WatchEvent::Restarted(pods) => {
                    for pod in pods {
                        self.observe(pod)?;
                    }
                }
                WatchEvent::Applied(pod) => self.observe(pod)?,
                WatchEvent::Deleted(pod) => {
                    let app = self.ctx.apps.owner_of(&self.ctx.cfg, &pod.metadata)?;
                    return Err(external(format!(
                        "pod of service {} was deleted during deployment",
                        app.name
                    )));
                }
            }
            for app in deps::eligible(&self.ctx.apps, &self.created, &self.statuses) {
                self.create_pod(&app).await?;
            }
        }

        info!("all {} services are ready", self.ctx.apps.len());
        Ok(())
    }

    fn all_ready(&self) -> bool {
        self.ctx
            .apps
            .iter()
            .all(|app| self.statuses.get(&app.name) == Some(&ObservedStatus::Ready))
    }

    /// Classifies one observed pod and raises the owning app's status.
    /// Downgrades are ignored; statuses only move forward.
    fn observe(&mut self, pod: k8s_openapi::api::core::v1::Pod) -> Result<(), anyhow::Error> {
        let app = Arc::clone(self.ctx.apps.owner_of(&self.ctx.cfg, &pod.metadata)?);
        let status = pods::classify(&pod)
            .with_context(|| format!("service {} failed", app.name))?;
        let current = self
            .statuses
            .entry(app.name.clone())
            .or_insert(ObservedStatus::Other);
        if status > *current {
            *current = status;
            info!("service {} is now {}", app.name, status);
        }
        Ok(())
    }

    /// Creates the pod for `app`. Blocks on the app's image resolution and
    /// on the host-alias table; both must have succeeded.
    async fn create_pod(&mut self, app: &Arc<App>) -> Result<(), anyhow::Error> {
        if !self.created.insert(app.name.clone()) {
            return Ok(());
        }
        let resolved = images::resolve_image(&self.ctx, app)
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| format!("resolving image for service {}", app.name))?;
        let host_aliases = services::host_aliases(&self.ctx)
            .await
            .map_err(anyhow::Error::new)
            .context("materializing cluster services")?;
        let pod = pods::pod_manifest(&self.ctx.cfg, app, &resolved, &host_aliases);
        self.ctx
            .cluster
            .create_pod(pod)
            .await
            .with_context(|| format!("creating pod for service {}", app.name))?;
        let because = if app.config.depends_on.is_empty() {
            "it has no dependencies"
        } else {
            "all of its dependencies are satisfied"
        };
        info!(
            "created pod {} because {}",
            self.ctx.cfg.resource_name(&app.name_encoded),
            because
        );
        Ok(())
    }

    /// Starts image resolution for every app and service materialization,
    /// all concurrent with the loop. Results land in the once-cells; the
    /// guard aborts whatever is still running when the loop exits.
    fn spawn_background(&self) -> TaskGuard {
        let mut tasks = Vec::new();
        for app in self.ctx.apps.iter() {
            let ctx = Arc::clone(&self.ctx);
            let app = Arc::clone(app);
            tasks.push(tokio::spawn(async move {
                let _ = images::resolve_image(&ctx, &app).await;
            }));
        }
        let ctx = Arc::clone(&self.ctx);
        tasks.push(tokio::spawn(async move {
            let _ = services::host_aliases(&ctx).await;
        }));
        TaskGuard(tasks)
    }
}

struct TaskGuard(Vec<JoinHandle<()>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}
