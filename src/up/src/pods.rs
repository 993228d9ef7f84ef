// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Pod manifests and pod status classification.

use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, HostAlias, Pod, PodSpec, Probe,
};

use kc_compose::HealthCheck;

use crate::apps::{object_meta, App, ObservedStatus};
use crate::error::{PodFailed, PodImagePullFailed};
use crate::images::ResolvedImage;
use crate::UpConfig;

// The image-healthcheck defaults, applied when a descriptor omits a field.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRIES: u32 = 3;

/// Builds the pod manifest for `app`: a single container running the
/// resolved image, with the composition's entrypoint, environment, and
/// ports, a readiness probe derived from the effective healthcheck, and the
/// full host-alias table.
pub(crate) fn pod_manifest(
    cfg: &UpConfig,
    app: &App,
    resolved: &ResolvedImage,
    host_aliases: &[HostAlias],
) -> Pod {
    // The composition's healthcheck wins over the image's; disabling wins
    // over both.
    let healthcheck = if app.config.healthcheck_disabled() {
        None
    } else {
        app.config
            .healthcheck
            .as_ref()
            .filter(|hc| !hc.test.is_empty())
            .or(resolved.healthcheck.as_ref())
    };

    let env: Vec<EnvVar> = app
        .config
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.to_string()),
            value_from: None,
        })
        .collect();

    Pod {
        metadata: object_meta(cfg, app),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: app.name_encoded.clone(),
                image: Some(resolved.pod_image.clone()),
                image_pull_policy: Some("Always".into()),
                command: app.config.entrypoint.clone(),
                working_dir: app.config.working_dir.clone(),
                env: if env.is_empty() { None } else { Some(env) },
                ports: if app.config.ports.is_empty() {
                    None
                } else {
                    Some(
                        app.config
                            .ports
                            .iter()
                            .map(|port| ContainerPort {
                                container_port: i32::from(port.container_port),
                                protocol: Some(port.protocol.to_string()),
                                ..Default::default()
                            })
                            .collect(),
                    )
                },
                readiness_probe: healthcheck.and_then(readiness_probe),
                ..Default::default()
            }],
            host_aliases: if host_aliases.is_empty() {
                None
            } else {
                Some(host_aliases.to_vec())
            },
            restart_policy: Some("Never".into()),
            automount_service_account_token: Some(false),
            ..Default::default()
        }),
        status: None,
    }
}

/// Converts a healthcheck descriptor into a readiness probe. The probe
/// command follows the image-healthcheck convention: exit status zero means
/// healthy.
fn readiness_probe(healthcheck: &HealthCheck) -> Option<Probe> {
    let command = match healthcheck.test.split_first() {
        Some((kind, args)) if kind == "CMD" => args.to_vec(),
        Some((kind, args)) if kind == "CMD-SHELL" => {
            vec!["/bin/sh".into(), "-c".into(), args.join(" ")]
        }
        _ => return None,
    };
    if command.is_empty() {
        return None;
    }
    Some(Probe {
        exec: Some(ExecAction {
            command: Some(command),
        }),
        period_seconds: Some(seconds(healthcheck.interval.unwrap_or(DEFAULT_INTERVAL))),
        timeout_seconds: Some(seconds(healthcheck.timeout.unwrap_or(DEFAULT_TIMEOUT))),
        failure_threshold: Some(
            i32::try_from(healthcheck.retries.unwrap_or(DEFAULT_RETRIES)).unwrap_or(i32::MAX),
        ),
        ..Default::default()
    })
}

fn seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX).max(1)
}

/// Reduces a pod's status to the highest applicable [`ObservedStatus`].
///
/// A pure function of the pod. Terminal container states (termination, an
/// unpullable image) are fatal and abort the run.
pub(crate) fn classify(pod: &Pod) -> Result<ObservedStatus, anyhow::Error> {
    let pod_name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
    let status = match &pod.status {
        Some(status) => status,
        None => return Ok(ObservedStatus::Other),
    };

    if status
        .conditions
        .iter()
        .flatten()
        .any(|condition| condition.type_ == "Ready" && condition.status == "True")
    {
        return Ok(ObservedStatus::Ready);
    }

    let container_statuses = status.container_statuses.as_deref().unwrap_or_default();
    let mut running = 0;
    for cs in container_statuses {
        let state = match &cs.state {
            Some(state) => state,
            None => continue,
        };
        if let Some(terminated) = &state.terminated {
            return Err(PodFailed {
                pod: pod_name.into(),
                container: cs.name.clone(),
                exit_code: terminated.exit_code,
                signal: terminated.signal.unwrap_or(0),
                reason: terminated.reason.clone().unwrap_or_default(),
                message: terminated.message.clone().unwrap_or_default(),
            }
            .into());
        }
        if let Some(waiting) = &state.waiting {
            if waiting.reason.as_deref() == Some("ErrImagePull") {
                return Err(PodImagePullFailed {
                    pod: pod_name.into(),
                    container: cs.name.clone(),
                    message: waiting.message.clone().unwrap_or_default(),
                }
                .into());
            }
        }
        if state.running.is_some() {
            running += 1;
        }
    }

    if !container_statuses.is_empty() && running == container_statuses.len() {
        Ok(ObservedStatus::Started)
    } else {
        Ok(ObservedStatus::Other)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, PodCondition, PodStatus,
    };

    use kc_compose::Composition;

    use super::*;
    use crate::apps::Apps;

    fn cfg() -> UpConfig {
        UpConfig {
            namespace: "default".into(),
            environment_id: "e2e".into(),
            environment_label: crate::DEFAULT_ENVIRONMENT_LABEL.into(),
            push_images: None,
            registry_auth: None,
        }
    }

    fn pod_with(status: PodStatus) -> Pod {
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("db-e2e".into()),
                ..Default::default()
            },
            spec: None,
            status: Some(status),
        }
    }

    fn container_state(state: ContainerState) -> PodStatus {
        PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "db".into(),
                state: Some(state),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn classify_levels() {
        let ready = pod_with(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(classify(&ready).unwrap(), ObservedStatus::Ready);

        let running = pod_with(container_state(ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        }));
        assert_eq!(classify(&running).unwrap(), ObservedStatus::Started);

        let pending = pod_with(PodStatus::default());
        assert_eq!(classify(&pending).unwrap(), ObservedStatus::Other);

        let no_status = Pod::default();
        assert_eq!(classify(&no_status).unwrap(), ObservedStatus::Other);
    }

    #[test]
    fn classify_terminal_states() {
        let terminated = pod_with(container_state(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 1,
                reason: Some("Error".into()),
                ..Default::default()
            }),
            ..Default::default()
        }));
        let err = classify(&terminated).unwrap_err();
        let rendered = format!("{:#}", err);
        assert!(rendered.contains("db-e2e"));
        assert!(rendered.contains("exit code 1"));
        assert!(rendered.contains("Error"));

        let unpullable = pod_with(container_state(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ErrImagePull".into()),
                message: Some("manifest unknown".into()),
                ..Default::default()
            }),
            ..Default::default()
        }));
        let err = classify(&unpullable).unwrap_err();
        assert!(format!("{:#}", err).contains("manifest unknown"));
    }

    #[test]
    fn manifest_prefers_composition_healthcheck() {
        let composition = Composition::parse(
            r#"
services:
  db:
    image: postgres:15
    ports: [5432]
    entrypoint: ["docker-entrypoint.sh", "postgres"]
    working_dir: /var/lib/postgresql
    environment:
      POSTGRES_PASSWORD: hunter2
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 10s
      timeout: 3s
      retries: 5
"#,
        )
        .unwrap();
        let apps = Apps::new(&composition).unwrap();
        let app = apps.iter().next().unwrap();
        let resolved = ResolvedImage {
            pod_image: "postgres@sha256:abc".into(),
            healthcheck: Some(HealthCheck {
                test: vec!["CMD-SHELL".into(), "true".into()],
                ..Default::default()
            }),
        };
        let aliases = vec![HostAlias {
            ip: Some("10.96.0.1".into()),
            hostnames: Some(vec!["db".into()]),
        }];

        let pod = pod_manifest(&cfg(), app, &resolved, &aliases);
        assert_eq!(pod.metadata.name.as_deref(), Some("db-e2e"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.automount_service_account_token, Some(false));
        assert_eq!(spec.host_aliases.unwrap(), aliases);

        let container = &spec.containers[0];
        assert_eq!(container.name, "db");
        assert_eq!(container.image.as_deref(), Some("postgres@sha256:abc"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(container.working_dir.as_deref(), Some("/var/lib/postgresql"));
        assert_eq!(
            container.command,
            Some(vec!["docker-entrypoint.sh".into(), "postgres".into()])
        );

        let probe = container.readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.exec.as_ref().unwrap().command,
            Some(vec!["pg_isready".into()])
        );
        assert_eq!(probe.period_seconds, Some(10));
        assert_eq!(probe.timeout_seconds, Some(3));
        assert_eq!(probe.failure_threshold, Some(5));
    }

    #[test]
    fn manifest_falls_back_to_image_healthcheck() {
        let composition = Composition::parse(
            r#"
services:
  db:
    image: postgres:15
"#,
        )
        .unwrap();
        let apps = Apps::new(&composition).unwrap();
        let app = apps.iter().next().unwrap();
        let resolved = ResolvedImage {
            pod_image: "postgres@sha256:abc".into(),
            healthcheck: Some(HealthCheck {
                test: vec!["CMD-SHELL".into(), "pg_isready".into()],
                ..Default::default()
            }),
        };

        let pod = pod_manifest(&cfg(), app, &resolved, &[]);
        let spec = pod.spec.unwrap();
        assert_eq!(spec.host_aliases, None);
        let probe = spec.containers[0].readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.exec.as_ref().unwrap().command,
            Some(vec!["/bin/sh".into(), "-c".into(), "pg_isready".into()])
        );
        assert_eq!(probe.period_seconds, Some(30));
        assert_eq!(probe.failure_threshold, Some(3));
    }

    #[test]
    fn manifest_honors_disabled_healthcheck() {
        let composition = Composition::parse(
            r#"
services:
  db:
    image: postgres:15
    healthcheck:
      disable: true
"#,
        )
        .unwrap();
        let apps = Apps::new(&composition).unwrap();
        let app = apps.iter().next().unwrap();
        let resolved = ResolvedImage {
            pod_image: "postgres@sha256:abc".into(),
            healthcheck: Some(HealthCheck {
                test: vec!["CMD".into(), "true".into()],
                ..Default::default()
            }),
        };

        let pod = pod_manifest(&cfg(), app, &resolved, &[]);
        assert_eq!(pod.spec.unwrap().containers[0].readiness_probe, None);
    }
}
