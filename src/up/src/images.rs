// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Image resolution.
//!
//! Produces, for each app, the image reference its pod will run and the
//! healthcheck embedded in the image, pulling, tagging, and pushing as the
//! configuration requires. Resolution runs once per app; every caller
//! observes the memoized result, errors included. The local image index is
//! likewise acquired once per run and shared by every resolution.

use anyhow::{anyhow, bail};
use tracing::info;

use kc_compose::HealthCheck;
use kc_docker_util::{ImageRef, LocalImageIndex};

use crate::apps::App;
use crate::engine::RunContext;
use crate::error::SharedError;

/// The memoized outcome of resolving one app's image.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedImage {
    /// The pod-visible image reference. Stable for the duration of the run:
    /// either digest-pinned or an explicitly named reference.
    pub pod_image: String,
    /// The healthcheck embedded in the image metadata, if any.
    pub healthcheck: Option<HealthCheck>,
}

/// Resolves `app`'s image, memoized. The first caller performs the work;
/// concurrent and later callers share its result.
pub(crate) async fn resolve_image(
    ctx: &RunContext,
    app: &App,
) -> Result<ResolvedImage, SharedError> {
    app.resolution
        .get_or_init(|| async { resolve(ctx, app).await.map_err(SharedError::new) })
        .await
        .clone()
}

async fn local_index(ctx: &RunContext) -> Result<LocalImageIndex, SharedError> {
    ctx.image_index
        .get_or_init(|| async {
            ctx.daemon
                .list_images()
                .await
                .map(LocalImageIndex::new)
                .map_err(SharedError::new)
        })
        .await
        .clone()
}

async fn resolve(ctx: &RunContext, app: &App) -> Result<ResolvedImage, anyhow::Error> {
    if app.config.image.is_empty() {
        bail!(
            "service {:?} has no image; building images is not supported",
            app.name
        );
    }
    let index = local_index(ctx).await.map_err(anyhow::Error::new)?;
    let reference = ImageRef::parse(&app.config.image, &index);

    // A digest-pinned named reference established during pull, usable as the
    // pod image without a push.
    let mut canonical = None;

    let inspected = match index.find(&reference) {
        Some(id) => ctx
            .daemon
            .inspect_image(&id)
            .await?
            .ok_or_else(|| anyhow!("image {} disappeared while resolving", id))?,
        None => match &reference {
            ImageRef::Id(id) => bail!(
                "image {} for service {:?} not found locally; building images is not \
                 supported",
                id,
                app.name
            ),
            ImageRef::Named(named) => {
                info!("pulling image {} for service {}", named.pullable(), app.name);
                ctx.daemon
                    .pull_image(&named.pullable(), ctx.cfg.registry_auth.as_ref())
                    .await?;
                let inspected = ctx.daemon.inspect_image(&named.pullable()).await?;
                let prefix = format!("{}@", named.repo);
                if let Some(inspected) = &inspected {
                    canonical = inspected
                        .repo_digests
                        .iter()
                        .find(|digest| digest.starts_with(&prefix))
                        .cloned();
                }
                match inspected {
                    Some(inspected) if !inspected.id.is_empty() && canonical.is_some() => {
                        inspected
                    }
                    // The pull succeeded but the image is already gone or
                    // unnamed: another process is mutating the daemon.
                    _ => bail!(
                        "image {} disappeared after pull; another process is modifying \
                         the image daemon",
                        named.pullable()
                    ),
                }
            }
        },
    };

    let pod_image = if let Some(push) = &ctx.cfg.push_images {
        let repo = format!(
            "{}/{}/{}",
            push.docker_registry, ctx.cfg.namespace, app.name_encoded
        );
        ctx.daemon.tag_image(&inspected.id, &repo, "latest").await?;
        info!("pushing image {}:latest for service {}", repo, app.name);
        let digest = ctx
            .daemon
            .push_image(&repo, "latest", ctx.cfg.registry_auth.as_ref())
            .await?;
        // Pin the pod to the digest the push returned, never to the tag:
        // concurrent deployments move the tag.
        format!("{}@{}", repo, digest)
    } else if let Some(canonical) = canonical {
        canonical
    } else if matches!(reference, ImageRef::Named(_)) {
        app.config.image.clone()
    } else {
        bail!(
            "image {} for service {:?} is a local ID, which is not a stable reference; \
             enable image push or deploy a named image",
            app.config.image,
            app.name
        );
    };

    Ok(ResolvedImage {
        pod_image,
        healthcheck: inspected.healthcheck,
    })
}
