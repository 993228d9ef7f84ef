// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deploys a multi-service composition onto a Kubernetes cluster.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

use kc_compose::Composition;
use kc_up::cluster::KubeCluster;
use kc_up::{DockerDaemon, PushConfig, RegistryAuth, Up, UpConfig};

/// Deploys a multi-service composition onto a Kubernetes cluster, one pod
/// and one ClusterIP service per composition service, and waits until every
/// service reports ready.
#[derive(Parser)]
#[clap(name = "kc-up")]
struct Args {
    /// The composition file to deploy.
    #[clap(short = 'f', long, default_value = "docker-compose.yml")]
    file: PathBuf,
    /// The cluster namespace to deploy into.
    #[clap(long, default_value = "default")]
    namespace: String,
    /// The identifier distinguishing this deployment from every other one
    /// in the namespace.
    #[clap(long = "env-id")]
    environment_id: String,
    /// The label key under which the environment identifier is installed on
    /// every created resource.
    #[clap(long = "env-label", default_value = "kube-compose/environment")]
    environment_label: String,
    /// Push every image to this registry and deploy the digest-pinned
    /// pushed references instead of the local ones.
    #[clap(long)]
    push_registry: Option<String>,
    /// The username for registry authentication.
    #[clap(long, env = "KC_REGISTRY_USERNAME")]
    registry_username: Option<String>,
    /// The password for registry authentication.
    #[clap(long, env = "KC_REGISTRY_PASSWORD", hide_env_values = true)]
    registry_password: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stdout)
        .init();

    if let Err(err) = run(Args::parse()).await {
        eprintln!("kc-up: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let composition = Composition::load(&args.file)?;

    let registry_auth = match (&args.registry_username, &args.registry_password) {
        (None, None) => None,
        _ => Some(RegistryAuth {
            username: args.registry_username.clone(),
            password: args.registry_password.clone(),
            identity_token: None,
            server_address: args.push_registry.clone(),
        }),
    };
    let cfg = UpConfig {
        namespace: args.namespace.clone(),
        environment_id: args.environment_id,
        environment_label: args.environment_label,
        push_images: args
            .push_registry
            .map(|docker_registry| PushConfig { docker_registry }),
        registry_auth,
    };

    let cluster = Arc::new(KubeCluster::connect(&args.namespace).await?);
    let daemon = Arc::new(DockerDaemon::connect()?);

    Up::new(cfg, &composition, cluster, daemon)?.run().await
}
