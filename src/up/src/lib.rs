// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The compose-up deployment engine.
//!
//! Projects a multi-service composition onto a Kubernetes cluster: one pod
//! per service, one ClusterIP service per port-exposing service, dependency
//! ordering and health gating between them, and a watch-driven loop that
//! runs until every service reports ready.
//!
//! The engine talks to the cluster through [`cluster::ClusterApi`] and to
//! the image daemon through [`ImageDaemon`]; both are trait seams with
//! production implementations ([`cluster::KubeCluster`], [`DockerDaemon`])
//! and in-memory fakes in the tests.

pub mod cluster;
pub mod error;

mod apps;
mod deps;
mod engine;
mod images;
mod pods;
mod services;

pub use engine::Up;
pub use kc_docker_util::{
    DockerDaemon, ImageDaemon, InspectedImage, LocalImage, RegistryAuth,
};

/// The annotation carrying the composition service name on every resource
/// the engine creates.
pub const SERVICE_ANNOTATION: &str = "kube-compose/service";

/// The default label key carrying the environment identifier.
pub const DEFAULT_ENVIRONMENT_LABEL: &str = "kube-compose/environment";

/// Configures a deployment run.
#[derive(Clone, Debug)]
pub struct UpConfig {
    /// The cluster namespace to deploy into. In push mode this is also the
    /// registry namespace images are pushed under.
    pub namespace: String,
    /// The identifier distinguishing this deployment's resources from every
    /// other deployment in the namespace. Appended to every resource name.
    pub environment_id: String,
    /// The label key under which `environment_id` is installed on every
    /// resource.
    pub environment_label: String,
    /// When set, every resolved image is re-tagged, pushed to this registry,
    /// and pods run the digest-pinned pushed reference.
    pub push_images: Option<PushConfig>,
    /// Credentials forwarded to registry pulls and pushes.
    pub registry_auth: Option<RegistryAuth>,
}

impl UpConfig {
    /// The cluster resource name for an encoded service name.
    pub fn resource_name(&self, name_encoded: &str) -> String {
        format!("{}-{}", name_encoded, self.environment_id)
    }

    /// The label selector scoping every list and watch to this deployment.
    pub(crate) fn selector(&self) -> String {
        format!("{}={}", self.environment_label, self.environment_id)
    }
}

/// Configures push mode.
#[derive(Clone, Debug)]
pub struct PushConfig {
    /// The registry images are pushed to, e.g. `registry.example.com:5000`.
    pub docker_registry: String,
}
