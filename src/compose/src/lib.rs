// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The canonical composition model.
//!
//! A [`Composition`] is the declarative input to the deployment engine: a
//! mapping from service name to [`ServiceConfig`]. The model is deliberately
//! small. It captures only the fields the engine consumes (image, entrypoint,
//! working directory, environment, ports, healthcheck, dependencies) and
//! tolerates the common spellings found in compose files, but it does not
//! attempt to cover the full compose format.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::de::{self, Deserializer};
use serde::Deserialize;

/// A parsed composition: the `services:` mapping of a compose file.
///
/// Iteration order over services is the lexicographic order of their names,
/// which keeps every downstream traversal deterministic.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Composition {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl Composition {
    /// Loads a composition from a YAML file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Composition, anyhow::Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Composition::parse(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses a composition from YAML text.
    pub fn parse(contents: &str) -> Result<Composition, anyhow::Error> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

/// The definition of a single service within a composition.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServiceConfig {
    /// The image reference to run. Required; emptiness is diagnosed by the
    /// image resolver rather than at parse time so that unrelated services
    /// can still deploy.
    #[serde(default)]
    pub image: String,
    /// Entrypoint override, passed to the container verbatim. A bare string
    /// becomes a single-element vector; no shell splitting is performed.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub entrypoint: Option<Vec<String>>,
    /// Working directory override.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Environment variables. Null values materialize as the empty string.
    #[serde(default)]
    pub environment: BTreeMap<String, EnvValue>,
    /// Container ports to expose through a cluster service.
    #[serde(default)]
    pub ports: Vec<Port>,
    /// Healthcheck override. When absent, the healthcheck embedded in the
    /// image metadata (if any) applies instead.
    #[serde(default)]
    pub healthcheck: Option<HealthCheck>,
    /// Services this one depends on, with the condition gating its start.
    #[serde(default, deserialize_with = "depends_on")]
    pub depends_on: BTreeMap<String, DependencyCondition>,
}

impl ServiceConfig {
    /// Whether healthchecks are disabled for this service, either by the
    /// composition or because no healthcheck source exists.
    pub fn healthcheck_disabled(&self) -> bool {
        self.healthcheck.as_ref().map_or(false, |h| h.disable)
    }
}

/// An environment variable value: string, number, boolean, or null.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Default for EnvValue {
    fn default() -> Self {
        EnvValue::Null
    }
}

impl fmt::Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EnvValue::Null => Ok(()),
            EnvValue::Bool(b) => write!(f, "{}", b),
            EnvValue::Int(i) => write!(f, "{}", i),
            EnvValue::Float(x) => write!(f, "{}", x),
            EnvValue::String(s) => f.write_str(s),
        }
    }
}

/// A container port exposed by a service.
///
/// Deserializes from any of the compose spellings: a bare number, the
/// `"[host:]container[/protocol]"` shorthand, or the long map form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub container_port: u16,
    pub protocol: PortProtocol,
}

impl Port {
    /// The canonical port name used for both the cluster service port and
    /// the container port, e.g. `tcp-5432`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.protocol.lowercase(), self.container_port)
    }
}

impl<'de> Deserialize<'de> for Port {
    fn deserialize<D>(deserializer: D) -> Result<Port, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u16),
            Shorthand(String),
            Long {
                #[serde(alias = "container_port")]
                target: u16,
                #[serde(default)]
                protocol: PortProtocol,
            },
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(container_port) => Ok(Port {
                container_port,
                protocol: PortProtocol::default(),
            }),
            Raw::Long { target, protocol } => Ok(Port {
                container_port: target,
                protocol,
            }),
            Raw::Shorthand(s) => {
                let (ports, protocol) = match s.split_once('/') {
                    None => (s.as_str(), PortProtocol::default()),
                    Some((ports, proto)) => {
                        let protocol = match proto.to_ascii_lowercase().as_str() {
                            "tcp" => PortProtocol::Tcp,
                            "udp" => PortProtocol::Udp,
                            other => {
                                return Err(de::Error::custom(format!(
                                    "unsupported port protocol {:?}",
                                    other
                                )))
                            }
                        };
                        (ports, protocol)
                    }
                };
                // In "host:container" shorthand the container port is the
                // last segment.
                let container = ports.rsplit(':').next().unwrap_or(ports);
                let container_port = container.parse::<u16>().map_err(|_| {
                    de::Error::custom(format!("invalid port specification {:?}", s))
                })?;
                Ok(Port {
                    container_port,
                    protocol,
                })
            }
        }
    }
}

/// The transport protocol of a [`Port`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    #[serde(alias = "TCP")]
    Tcp,
    #[serde(alias = "UDP")]
    Udp,
}

impl Default for PortProtocol {
    fn default() -> Self {
        PortProtocol::Tcp
    }
}

impl PortProtocol {
    /// The lowercase form used in generated port names.
    pub fn lowercase(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

impl fmt::Display for PortProtocol {
    /// The uppercase form expected by the cluster API.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PortProtocol::Tcp => f.write_str("TCP"),
            PortProtocol::Udp => f.write_str("UDP"),
        }
    }
}

/// A healthcheck descriptor: the `{test, interval, timeout, retries}` tuple
/// shared by composition files and image metadata, mapped onto a readiness
/// probe by the pod factory.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HealthCheck {
    /// The probe command in the documented image-healthcheck convention:
    /// `["CMD", ...]`, `["CMD-SHELL", cmd]`, or `["NONE"]`. Exit status zero
    /// means healthy. A bare string is shorthand for the `CMD-SHELL` form.
    #[serde(default, deserialize_with = "healthcheck_test")]
    pub test: Vec<String>,
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retries: Option<u32>,
    /// Disables healthchecking for the service entirely, including any
    /// healthcheck embedded in the image.
    #[serde(default)]
    pub disable: bool,
}

/// The condition under which a dependent service may start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    ServiceStarted,
    ServiceHealthy,
}

impl Default for DependencyCondition {
    fn default() -> Self {
        DependencyCondition::ServiceStarted
    }
}

fn string_or_seq<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::One(s) => vec![s],
        Raw::Many(v) => v,
    }))
}

fn healthcheck_test<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Shell(String),
        Exec(Vec<String>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Shell(cmd) => vec!["CMD-SHELL".into(), cmd],
        Raw::Exec(v) => v,
    })
}

fn depends_on<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, DependencyCondition>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Detail {
        Bare(DependencyCondition),
        Long {
            #[serde(default)]
            condition: DependencyCondition,
        },
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Map(BTreeMap<String, Detail>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::List(names) => names
            .into_iter()
            .map(|name| (name, DependencyCondition::ServiceStarted))
            .collect(),
        Raw::Map(map) => map
            .into_iter()
            .map(|(name, detail)| {
                let condition = match detail {
                    Detail::Bare(c) => c,
                    Detail::Long { condition } => condition,
                };
                (name, condition)
            })
            .collect(),
    })
}

/// Sanitizes a service name into a form valid for cluster resource names and
/// label values.
///
/// The encoding is deterministic: ASCII lowercased, every character outside
/// `[a-z0-9-]` replaced with `-`, leading and trailing dashes trimmed, and
/// the result truncated to 54 characters so that an appended
/// `-<environment id>` suffix stays within the 63-character limit. Distinct
/// names can collide after encoding; callers must reject collisions.
pub fn encode_name(name: &str) -> String {
    const MAX_LEN: usize = 54;
    let mut encoded = String::with_capacity(name.len());
    for ch in name.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' {
            encoded.push(ch);
        } else {
            encoded.push('-');
        }
    }
    if encoded.len() > MAX_LEN {
        encoded.truncate(MAX_LEN);
    }
    let encoded = encoded.trim_matches('-');
    if encoded.is_empty() {
        // The scheme must never produce an empty name.
        "x".into()
    } else {
        encoded.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_name_sanitizes() {
        assert_eq!(encode_name("db"), "db");
        assert_eq!(encode_name("My_Service.v2"), "my-service-v2");
        assert_eq!(encode_name("--weird--"), "weird");
        assert_eq!(encode_name("日本"), "x");
        let long = "a".repeat(80);
        assert_eq!(encode_name(&long).len(), 54);
    }

    #[test]
    fn env_values_render() {
        assert_eq!(EnvValue::Null.to_string(), "");
        assert_eq!(EnvValue::Int(5432).to_string(), "5432");
        assert_eq!(EnvValue::Bool(true).to_string(), "true");
        assert_eq!(EnvValue::String("x".into()).to_string(), "x");
    }

    #[test]
    fn parses_port_spellings() {
        let composition = Composition::parse(
            r#"
services:
  db:
    image: postgres:15
    ports:
      - 5432
      - "8080:80"
      - "53/udp"
      - target: 9000
        protocol: udp
"#,
        )
        .unwrap();
        let db = &composition.services["db"];
        assert_eq!(
            db.ports,
            vec![
                Port {
                    container_port: 5432,
                    protocol: PortProtocol::Tcp
                },
                Port {
                    container_port: 80,
                    protocol: PortProtocol::Tcp
                },
                Port {
                    container_port: 53,
                    protocol: PortProtocol::Udp
                },
                Port {
                    container_port: 9000,
                    protocol: PortProtocol::Udp
                },
            ]
        );
        assert_eq!(db.ports[0].name(), "tcp-5432");
    }

    #[test]
    fn parses_depends_on_forms() {
        let composition = Composition::parse(
            r#"
services:
  api:
    image: api:1
    depends_on:
      db:
        condition: service_healthy
      cache:
        condition: service_started
  worker:
    image: worker:1
    depends_on: [api]
"#,
        )
        .unwrap();
        let api = &composition.services["api"];
        assert_eq!(
            api.depends_on["db"],
            DependencyCondition::ServiceHealthy
        );
        assert_eq!(
            api.depends_on["cache"],
            DependencyCondition::ServiceStarted
        );
        let worker = &composition.services["worker"];
        assert_eq!(
            worker.depends_on["api"],
            DependencyCondition::ServiceStarted
        );
    }

    #[test]
    fn parses_healthcheck_and_entrypoint() {
        let composition = Composition::parse(
            r#"
services:
  db:
    image: postgres:15
    entrypoint: docker-entrypoint.sh
    environment:
      POSTGRES_PASSWORD: hunter2
      POSTGRES_PORT: 5432
      EMPTY: null
    healthcheck:
      test: pg_isready -U postgres
      interval: 10s
      timeout: 3s
      retries: 5
  api:
    image: api:1
    entrypoint: ["/bin/api", "--serve"]
    healthcheck:
      test: ["CMD", "/bin/check"]
      disable: true
"#,
        )
        .unwrap();
        let db = &composition.services["db"];
        assert_eq!(db.entrypoint, Some(vec!["docker-entrypoint.sh".into()]));
        let hc = db.healthcheck.as_ref().unwrap();
        assert_eq!(hc.test, vec!["CMD-SHELL", "pg_isready -U postgres"]);
        assert_eq!(hc.interval, Some(Duration::from_secs(10)));
        assert_eq!(hc.retries, Some(5));
        assert!(!db.healthcheck_disabled());
        assert_eq!(db.environment["POSTGRES_PORT"].to_string(), "5432");
        assert_eq!(db.environment["EMPTY"].to_string(), "");

        let api = &composition.services["api"];
        assert_eq!(
            api.entrypoint,
            Some(vec!["/bin/api".into(), "--serve".into()])
        );
        assert!(api.healthcheck_disabled());
    }
}
