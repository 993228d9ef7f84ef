// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Image daemon plumbing.
//!
//! [`ImageDaemon`] captures exactly the capabilities the deployment engine
//! consumes from a container image daemon: list, inspect, pull, tag, push.
//! [`DockerDaemon`] implements it over a local Docker daemon via `bollard`;
//! tests substitute in-memory fakes.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::image::{CreateImageOptions, ListImagesOptions, PushImageOptions, TagImageOptions};
use bollard::Docker;
use futures::stream::StreamExt;
use tracing::debug;

use kc_compose::HealthCheck;

mod reference;

pub use reference::{ImageRef, NamedRef};

/// A summary of one locally present image.
#[derive(Clone, Debug)]
pub struct LocalImage {
    /// The daemon-assigned ID, `sha256:<hex>`.
    pub id: String,
    /// Familiar `repo:tag` names pointing at this image.
    pub repo_tags: Vec<String>,
    /// `repo@digest` names pointing at this image.
    pub repo_digests: Vec<String>,
}

/// The result of inspecting a single image.
#[derive(Clone, Debug, Default)]
pub struct InspectedImage {
    pub id: String,
    pub repo_digests: Vec<String>,
    /// The healthcheck embedded in the image metadata, if any.
    pub healthcheck: Option<HealthCheck>,
}

/// Registry credentials for pull and push operations.
///
/// The credential source is deliberately decoupled from any particular
/// config system; callers construct whichever fields their registry needs.
#[derive(Clone, Debug, Default)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub identity_token: Option<String>,
    pub server_address: Option<String>,
}

impl RegistryAuth {
    fn to_bollard(&self) -> DockerCredentials {
        DockerCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
            identitytoken: self.identity_token.clone(),
            serveraddress: self.server_address.clone(),
            ..Default::default()
        }
    }
}

/// A snapshot of the images present on the local daemon, acquired once per
/// run and shared by every resolution.
#[derive(Clone, Debug, Default)]
pub struct LocalImageIndex {
    images: Vec<LocalImage>,
}

impl LocalImageIndex {
    pub fn new(images: Vec<LocalImage>) -> LocalImageIndex {
        LocalImageIndex { images }
    }

    /// Expands an abbreviated hex ID to the full `sha256:<hex>` ID of a
    /// local image, if one matches.
    pub fn expand_id(&self, abbrev: &str) -> Option<String> {
        self.images
            .iter()
            .find(|image| {
                image
                    .id
                    .strip_prefix("sha256:")
                    .map_or(false, |hex| hex.starts_with(abbrev))
            })
            .map(|image| image.id.clone())
    }

    /// Resolves a parsed reference to the ID of a local image: by exact ID
    /// for [`ImageRef::Id`], by digest and then by tag for
    /// [`ImageRef::Named`].
    pub fn find(&self, reference: &ImageRef) -> Option<String> {
        match reference {
            ImageRef::Id(id) => self
                .images
                .iter()
                .find(|image| image.id == *id)
                .map(|image| image.id.clone()),
            ImageRef::Named(named) => {
                if let Some(digest) = &named.digest {
                    let want = named.digested(digest);
                    if let Some(image) = self
                        .images
                        .iter()
                        .find(|image| image.repo_digests.iter().any(|d| *d == want))
                    {
                        return Some(image.id.clone());
                    }
                }
                let want = named.tagged();
                self.images
                    .iter()
                    .find(|image| image.repo_tags.iter().any(|t| *t == want))
                    .map(|image| image.id.clone())
            }
        }
    }
}

/// The image daemon capabilities consumed by the deployment engine.
#[async_trait]
pub trait ImageDaemon: Send + Sync {
    /// Lists all local images.
    async fn list_images(&self) -> Result<Vec<LocalImage>, anyhow::Error>;

    /// Inspects an image by ID or reference. Returns `None` when the image
    /// does not exist.
    async fn inspect_image(&self, reference: &str)
        -> Result<Option<InspectedImage>, anyhow::Error>;

    /// Pulls a named reference.
    async fn pull_image(
        &self,
        reference: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), anyhow::Error>;

    /// Tags the image with ID `id` as `repo:tag`.
    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<(), anyhow::Error>;

    /// Pushes `repo:tag` and returns the content digest reported by the
    /// registry.
    async fn push_image(
        &self,
        repo: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<String, anyhow::Error>;
}

/// An [`ImageDaemon`] backed by a local Docker daemon.
pub struct DockerDaemon {
    docker: Docker,
}

impl DockerDaemon {
    /// Connects using the daemon's local defaults (the `DOCKER_HOST`
    /// environment variable or the platform socket).
    pub fn connect() -> Result<DockerDaemon, anyhow::Error> {
        let docker =
            Docker::connect_with_local_defaults().context("connecting to the image daemon")?;
        Ok(DockerDaemon { docker })
    }
}

#[async_trait]
impl ImageDaemon for DockerDaemon {
    async fn list_images(&self) -> Result<Vec<LocalImage>, anyhow::Error> {
        let summaries = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context("listing local images")?;
        Ok(summaries
            .into_iter()
            .map(|s| LocalImage {
                id: s.id,
                repo_tags: s.repo_tags,
                repo_digests: s.repo_digests,
            })
            .collect())
    }

    async fn inspect_image(
        &self,
        reference: &str,
    ) -> Result<Option<InspectedImage>, anyhow::Error> {
        match self.docker.inspect_image(reference).await {
            Ok(inspect) => {
                let healthcheck = inspect
                    .config
                    .as_ref()
                    .and_then(|config| config.healthcheck.as_ref())
                    .and_then(healthcheck_from_config);
                Ok(Some(InspectedImage {
                    id: inspect.id.unwrap_or_default(),
                    repo_digests: inspect.repo_digests.unwrap_or_default(),
                    healthcheck,
                }))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("inspecting image {}", reference)),
        }
    }

    async fn pull_image(
        &self,
        reference: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), anyhow::Error> {
        let options = CreateImageOptions::<String> {
            from_image: reference.into(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(
            Some(options),
            None,
            auth.map(RegistryAuth::to_bollard),
        );
        while let Some(info) = stream.next().await {
            let info = info.with_context(|| format!("pulling image {}", reference))?;
            if let Some(error) = info.error {
                bail!("pulling image {}: {}", reference, error);
            }
            if let Some(status) = info.status {
                debug!(%reference, "pull: {}", status);
            }
        }
        Ok(())
    }

    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<(), anyhow::Error> {
        self.docker
            .tag_image(
                id,
                Some(TagImageOptions::<&str> {
                    repo: repo.into(),
                    tag: tag.into(),
                }),
            )
            .await
            .with_context(|| format!("tagging {} as {}:{}", id, repo, tag))
    }

    async fn push_image(
        &self,
        repo: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<String, anyhow::Error> {
        let mut stream = self.docker.push_image(
            repo,
            Some(PushImageOptions { tag }),
            auth.map(RegistryAuth::to_bollard),
        );
        let mut digest = None;
        while let Some(info) = stream.next().await {
            let info = info.with_context(|| format!("pushing {}:{}", repo, tag))?;
            if let Some(error) = info.error {
                bail!("pushing {}:{}: {}", repo, tag, error);
            }
            if let Some(status) = info.status {
                debug!(%repo, %tag, "push: {}", status);
                if let Some(d) = parse_push_digest(&status) {
                    digest = Some(d);
                }
            }
        }
        match digest {
            Some(digest) => Ok(digest),
            // Older daemons omit the digest line; fall back to the repo
            // digest recorded by the push.
            None => {
                let inspect = self
                    .inspect_image(&format!("{}:{}", repo, tag))
                    .await?
                    .ok_or_else(|| anyhow!("pushed image {}:{} no longer exists", repo, tag))?;
                let prefix = format!("{}@", repo);
                inspect
                    .repo_digests
                    .iter()
                    .find_map(|d| d.strip_prefix(&prefix).map(|d| d.to_string()))
                    .ok_or_else(|| {
                        anyhow!("push of {}:{} reported no content digest", repo, tag)
                    })
            }
        }
    }
}

/// Extracts the healthcheck descriptor from image metadata, normalizing the
/// daemon's nanosecond durations. Returns `None` when the image declares no
/// healthcheck or explicitly disables it (`["NONE"]`).
fn healthcheck_from_config(config: &bollard::models::HealthConfig) -> Option<HealthCheck> {
    let test = config.test.clone()?;
    if test.is_empty() || test[0] == "NONE" {
        return None;
    }
    Some(HealthCheck {
        test,
        interval: config.interval.and_then(nanos_to_duration),
        timeout: config.timeout.and_then(nanos_to_duration),
        retries: config.retries.and_then(|r| u32::try_from(r).ok()),
        disable: false,
    })
}

fn nanos_to_duration(nanos: i64) -> Option<Duration> {
    u64::try_from(nanos).ok().filter(|&n| n > 0).map(Duration::from_nanos)
}

/// Parses the content digest out of a push status line of the form
/// `latest: digest: sha256:<hex> size: <n>`.
fn parse_push_digest(status: &str) -> Option<String> {
    let idx = status.find("digest: ")?;
    let digest = &status[idx + "digest: ".len()..];
    let digest = digest.split_whitespace().next()?;
    if digest.starts_with("sha256:") {
        Some(digest.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_image_healthcheck() {
        let config = bollard::models::HealthConfig {
            test: Some(vec!["CMD-SHELL".into(), "pg_isready".into()]),
            interval: Some(10_000_000_000),
            timeout: Some(3_000_000_000),
            retries: Some(5),
            start_period: None,
        };
        let hc = healthcheck_from_config(&config).unwrap();
        assert_eq!(hc.test, vec!["CMD-SHELL", "pg_isready"]);
        assert_eq!(hc.interval, Some(Duration::from_secs(10)));
        assert_eq!(hc.timeout, Some(Duration::from_secs(3)));
        assert_eq!(hc.retries, Some(5));

        let none = bollard::models::HealthConfig {
            test: Some(vec!["NONE".into()]),
            ..Default::default()
        };
        assert!(healthcheck_from_config(&none).is_none());
    }

    #[test]
    fn parses_push_digest_lines() {
        assert_eq!(
            parse_push_digest("latest: digest: sha256:abc123 size: 1573"),
            Some("sha256:abc123".into())
        );
        assert_eq!(parse_push_digest("Pushing [====>]"), None);
    }

    #[test]
    fn index_resolves_by_digest_then_tag() {
        let index = LocalImageIndex::new(vec![
            LocalImage {
                id: "sha256:aaaa".into(),
                repo_tags: vec!["api:latest".into()],
                repo_digests: vec!["api@sha256:d1".into()],
            },
            LocalImage {
                id: "sha256:bbbb".into(),
                repo_tags: vec!["db:9".into()],
                repo_digests: vec![],
            },
        ]);
        let by_digest = ImageRef::parse("api@sha256:d1", &index);
        assert_eq!(index.find(&by_digest), Some("sha256:aaaa".into()));
        let by_tag = ImageRef::parse("db:9", &index);
        assert_eq!(index.find(&by_tag), Some("sha256:bbbb".into()));
        let missing = ImageRef::parse("db:10", &index);
        assert_eq!(index.find(&missing), None);
    }
}
