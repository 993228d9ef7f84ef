// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster service materialization.
//!
//! Creates one cluster service per port-exposing app, watches until every
//! one has been assigned a cluster IP, and distills the result into the
//! host-alias table installed into every pod. Runs once per deployment;
//! every caller shares the memoized table, errors included.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{HostAlias, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use maplit::btreemap;
use tracing::info;

use crate::apps::{object_meta, App};
use crate::cluster::WatchEvent;
use crate::engine::RunContext;
use crate::error::{external, SharedError};
use crate::UpConfig;

/// Returns the host-alias table for this run, materializing the cluster
/// services on first call.
pub(crate) async fn host_aliases(ctx: &RunContext) -> Result<Vec<HostAlias>, SharedError> {
    ctx.host_aliases
        .get_or_init(|| async { materialize(ctx).await.map_err(SharedError::new) })
        .await
        .clone()
}

async fn materialize(ctx: &RunContext) -> Result<Vec<HostAlias>, anyhow::Error> {
    let expected: Vec<_> = ctx.apps.iter().filter(|app| app.has_service()).collect();
    if expected.is_empty() {
        return Ok(Vec::new());
    }

    for app in &expected {
        ctx.cluster
            .create_service(service_manifest(&ctx.cfg, app))
            .await
            .with_context(|| format!("creating cluster service for {}", app.name))?;
        info!(
            "created service {} for {}",
            ctx.cfg.resource_name(&app.name_encoded),
            app.name
        );
    }

    let mut remaining: BTreeSet<&str> =
        expected.iter().map(|app| app.name.as_str()).collect();
    let mut stream = ctx.cluster.watch_services(&ctx.cfg.selector());
    while !remaining.is_empty() {
        let event = stream
            .next()
            .await
            .ok_or_else(|| anyhow!("service watch ended before every cluster IP was assigned"))?
            .context("watching cluster services")?;
        match event {
            WatchEvent::Restarted(services) => {
                if services.len() < expected.len() {
                    return Err(external(format!(
                        "expected {} cluster services, found {}",
                        expected.len(),
                        services.len()
                    )));
                }
                for service in services {
                    observe(ctx, &mut remaining, service)?;
                }
            }
            WatchEvent::Applied(service) => observe(ctx, &mut remaining, service)?,
            WatchEvent::Deleted(service) => {
                let app = ctx.apps.owner_of(&ctx.cfg, &service.metadata)?;
                return Err(external(format!(
                    "cluster service of {} was deleted during deployment",
                    app.name
                )));
            }
        }
    }

    Ok(expected
        .iter()
        .map(|app| HostAlias {
            ip: Some(
                app.cluster_ip
                    .get()
                    .cloned()
                    .expect("cluster IP recorded for every expected service"),
            ),
            // The original service name, which may contain characters the
            // cluster's DNS never could.
            hostnames: Some(vec![app.name.clone()]),
        })
        .collect())
}

fn observe(
    ctx: &RunContext,
    remaining: &mut BTreeSet<&str>,
    service: Service,
) -> Result<(), anyhow::Error> {
    let app = ctx.apps.owner_of(&ctx.cfg, &service.metadata)?;
    let spec = service.spec.unwrap_or_default();
    match spec.type_.as_deref() {
        None | Some("ClusterIP") => {}
        Some(other) => {
            return Err(external(format!(
                "cluster service of {} has unexpected type {}",
                app.name, other
            )));
        }
    }
    if let Some(ip) = spec
        .cluster_ip
        .filter(|ip| !ip.is_empty() && ip.as_str() != "None")
    {
        if remaining.remove(app.name.as_str()) {
            let _ = app.cluster_ip.set(ip.clone());
            let total = ctx.apps.iter().filter(|a| a.has_service()).count();
            info!(
                "service {} assigned cluster IP {} ({} of {} assigned)",
                app.name,
                ip,
                total - remaining.len(),
                total
            );
        }
    }
    Ok(())
}

/// Builds the cluster service manifest for a port-exposing app: one named
/// port per composition port, selecting the app's pod by label.
fn service_manifest(cfg: &UpConfig, app: &App) -> Service {
    Service {
        metadata: object_meta(cfg, app),
        spec: Some(ServiceSpec {
            ports: Some(
                app.config
                    .ports
                    .iter()
                    .map(|port| ServicePort {
                        name: Some(port.name()),
                        port: i32::from(port.container_port),
                        target_port: Some(IntOrString::Int(i32::from(port.container_port))),
                        protocol: Some(port.protocol.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            selector: Some(btreemap! {
                "app".into() => app.name_encoded.clone(),
                cfg.environment_label.clone() => cfg.environment_id.clone(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kc_compose::Composition;

    #[test]
    fn service_manifest_names_ports() {
        let cfg = UpConfig {
            namespace: "default".into(),
            environment_id: "e2e".into(),
            environment_label: crate::DEFAULT_ENVIRONMENT_LABEL.into(),
            push_images: None,
            registry_auth: None,
        };
        let composition = Composition::parse(
            r#"
services:
  db:
    image: postgres:15
    ports: [5432, "53/udp"]
"#,
        )
        .unwrap();
        let apps = crate::apps::Apps::new(&composition).unwrap();
        let app = apps.iter().next().unwrap();

        let service = service_manifest(&cfg, app);
        assert_eq!(service.metadata.name.as_deref(), Some("db-e2e"));
        let spec = service.spec.unwrap();
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].name.as_deref(), Some("tcp-5432"));
        assert_eq!(ports[0].port, 5432);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(5432)));
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
        assert_eq!(ports[1].name.as_deref(), Some("udp-53"));
        assert_eq!(ports[1].protocol.as_deref(), Some("UDP"));
        assert_eq!(
            spec.selector.unwrap()["kube-compose/environment"],
            "e2e"
        );
    }
}
