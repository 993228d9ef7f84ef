// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-service runtime records.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::bail;
use kube::api::ObjectMeta;
use maplit::btreemap;
use tokio::sync::OnceCell;

use kc_compose::{encode_name, Composition, ServiceConfig};

use crate::error::{external, SharedError};
use crate::images::ResolvedImage;
use crate::{UpConfig, SERVICE_ANNOTATION};

/// One service's runtime record, shared between the convergence loop and the
/// background resolution tasks.
///
/// The identity fields are immutable; the cells are write-once. The first
/// writer of a cell decides its value for every later reader, errors
/// included.
pub(crate) struct App {
    /// The service name as written in the composition.
    pub name: String,
    /// The sanitized form used in resource names and label values.
    pub name_encoded: String,
    pub config: ServiceConfig,
    /// Memoized image resolution.
    pub(crate) resolution: OnceCell<Result<ResolvedImage, SharedError>>,
    /// The cluster IP assigned to this service's cluster service.
    pub(crate) cluster_ip: OnceCell<String>,
}

impl App {
    /// Whether this app gets a cluster service, i.e. whether it exposes any
    /// ports.
    pub fn has_service(&self) -> bool {
        !self.config.ports.is_empty()
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("name_encoded", &self.name_encoded)
            .finish()
    }
}

/// The highest pod status observed for an app. Transitions are monotone;
/// the convergence loop ignores downgrades.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ObservedStatus {
    Other,
    Started,
    Ready,
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObservedStatus::Other => f.write_str("waiting"),
            ObservedStatus::Started => f.write_str("started"),
            ObservedStatus::Ready => f.write_str("ready"),
        }
    }
}

/// The full set of apps for a run. Built once at bootstrap; the set of keys
/// never changes afterwards.
#[derive(Debug)]
pub(crate) struct Apps {
    by_name: BTreeMap<String, Arc<App>>,
}

impl Apps {
    pub fn new(composition: &Composition) -> Result<Apps, anyhow::Error> {
        let mut by_name = BTreeMap::new();
        let mut by_encoded: BTreeMap<String, String> = BTreeMap::new();
        for (name, config) in &composition.services {
            let name_encoded = encode_name(name);
            if let Some(existing) = by_encoded.insert(name_encoded.clone(), name.clone()) {
                bail!(
                    "services {:?} and {:?} collide after name encoding ({:?})",
                    existing,
                    name,
                    name_encoded
                );
            }
            for dep in config.depends_on.keys() {
                if dep == name {
                    bail!("service {:?} depends on itself", name);
                }
                if !composition.services.contains_key(dep) {
                    bail!("service {:?} depends on undefined service {:?}", name, dep);
                }
            }
            by_name.insert(
                name.clone(),
                Arc::new(App {
                    name: name.clone(),
                    name_encoded,
                    config: config.clone(),
                    resolution: OnceCell::new(),
                    cluster_ip: OnceCell::new(),
                }),
            );
        }
        Ok(Apps { by_name })
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<App>> {
        self.by_name.values()
    }

    /// Resolves the app owning a cluster object observed under the
    /// deployment's label selector.
    ///
    /// Everything visible under the selector must carry the service
    /// annotation and follow the naming scheme; anything else is the work of
    /// another actor and yields the external-modification sentinel.
    pub fn owner_of(
        &self,
        cfg: &UpConfig,
        meta: &ObjectMeta,
    ) -> Result<&Arc<App>, anyhow::Error> {
        let resource = meta.name.as_deref().unwrap_or("<unnamed>");
        let annotation = meta
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(SERVICE_ANNOTATION));
        match annotation {
            Some(service) => match self.by_name.get(service) {
                Some(app)
                    if meta.name.as_deref()
                        == Some(cfg.resource_name(&app.name_encoded).as_str()) =>
                {
                    Ok(app)
                }
                Some(_) => Err(external(format!(
                    "resource {} is annotated for service {:?} but does not follow its \
                     naming scheme",
                    resource, service
                ))),
                None => Err(external(format!(
                    "resource {} is annotated for unknown service {:?}",
                    resource, service
                ))),
            },
            None => Err(external(format!(
                "resource {} carries the deployment's labels but no service annotation",
                resource
            ))),
        }
    }
}

/// The standard object metadata for a resource belonging to `app`: the
/// encoded name suffixed with the environment ID, the identity labels, and
/// the service annotation.
pub(crate) fn object_meta(cfg: &UpConfig, app: &App) -> ObjectMeta {
    ObjectMeta {
        name: Some(cfg.resource_name(&app.name_encoded)),
        labels: Some(btreemap! {
            "app".into() => app.name_encoded.clone(),
            cfg.environment_label.clone() => cfg.environment_id.clone(),
        }),
        annotations: Some(btreemap! {
            SERVICE_ANNOTATION.into() => app.name.clone(),
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_external_modification;

    fn config() -> UpConfig {
        UpConfig {
            namespace: "default".into(),
            environment_id: "e2e".into(),
            environment_label: crate::DEFAULT_ENVIRONMENT_LABEL.into(),
            push_images: None,
            registry_auth: None,
        }
    }

    fn apps() -> Apps {
        let composition = Composition::parse(
            r#"
services:
  db:
    image: postgres:15
"#,
        )
        .unwrap();
        Apps::new(&composition).unwrap()
    }

    #[test]
    fn rejects_encoded_name_collisions() {
        let composition = Composition::parse(
            r#"
services:
  my.db: { image: "a:1" }
  my_db: { image: "b:1" }
"#,
        )
        .unwrap();
        let err = Apps::new(&composition).unwrap_err();
        assert!(err.to_string().contains("collide"));
    }

    #[test]
    fn rejects_undefined_and_self_dependencies() {
        let undefined = Composition::parse(
            r#"
services:
  api: { image: "a:1", depends_on: [db] }
"#,
        )
        .unwrap();
        assert!(Apps::new(&undefined)
            .unwrap_err()
            .to_string()
            .contains("undefined service"));

        let cyclic = Composition::parse(
            r#"
services:
  api: { image: "a:1", depends_on: [api] }
"#,
        )
        .unwrap();
        assert!(Apps::new(&cyclic)
            .unwrap_err()
            .to_string()
            .contains("depends on itself"));
    }

    #[test]
    fn owner_resolution_guards_the_naming_scheme() {
        let cfg = config();
        let apps = apps();
        let app = apps.iter().next().unwrap();

        let owned = object_meta(&cfg, app);
        assert_eq!(apps.owner_of(&cfg, &owned).unwrap().name, "db");

        // Annotated for a service we do not know.
        let mut foreign = owned.clone();
        foreign
            .annotations
            .as_mut()
            .unwrap()
            .insert(SERVICE_ANNOTATION.into(), "ghost".into());
        assert!(is_external_modification(
            &apps.owner_of(&cfg, &foreign).unwrap_err()
        ));

        // Our naming scheme without our annotation.
        let unannotated = ObjectMeta {
            name: Some("db-e2e".into()),
            ..Default::default()
        };
        assert!(is_external_modification(
            &apps.owner_of(&cfg, &unannotated).unwrap_err()
        ));
    }
}
