// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The dependency gate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kc_compose::DependencyCondition;

use crate::apps::{App, Apps, ObservedStatus};

/// Whether an observed status satisfies a dependency condition.
///
/// The comparison is `>=`, not equality: observed statuses only ever move
/// forward, so a predecessor that reaches `ready` before its dependents are
/// considered must still satisfy a `service_started` gate.
pub(crate) fn satisfied(condition: DependencyCondition, status: ObservedStatus) -> bool {
    let required = match condition {
        DependencyCondition::ServiceStarted => ObservedStatus::Started,
        DependencyCondition::ServiceHealthy => ObservedStatus::Ready,
    };
    status >= required
}

/// Returns the apps whose pods have not been created and whose predecessors
/// all satisfy their required status, in name order.
pub(crate) fn eligible(
    apps: &Apps,
    created: &BTreeSet<String>,
    statuses: &BTreeMap<String, ObservedStatus>,
) -> Vec<Arc<App>> {
    apps.iter()
        .filter(|app| !created.contains(&app.name))
        .filter(|app| {
            app.config.depends_on.iter().all(|(dep, condition)| {
                statuses
                    .get(dep)
                    .map_or(false, |status| satisfied(*condition, *status))
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use kc_compose::Composition;

    use super::*;

    #[test]
    fn gate_is_monotone() {
        use DependencyCondition::*;
        use ObservedStatus::*;

        assert!(!satisfied(ServiceStarted, Other));
        assert!(satisfied(ServiceStarted, Started));
        // A predecessor that is already ready still opens started gates.
        assert!(satisfied(ServiceStarted, Ready));

        assert!(!satisfied(ServiceHealthy, Other));
        assert!(!satisfied(ServiceHealthy, Started));
        assert!(satisfied(ServiceHealthy, Ready));
    }

    #[test]
    fn eligibility_requires_every_predecessor() {
        let composition = Composition::parse(
            r#"
services:
  a: { image: "a:1" }
  b: { image: "b:1", depends_on: { a: { condition: service_started } } }
  c:
    image: "c:1"
    depends_on:
      a: { condition: service_started }
      b: { condition: service_healthy }
"#,
        )
        .unwrap();
        let apps = Apps::new(&composition).unwrap();

        let mut created = BTreeSet::from(["a".to_string()]);
        let mut statuses = BTreeMap::new();

        // Nothing observed yet: no gate opens.
        assert!(eligible(&apps, &created, &statuses).is_empty());

        statuses.insert("a".into(), ObservedStatus::Started);
        let open: Vec<_> = eligible(&apps, &created, &statuses)
            .iter()
            .map(|app| app.name.clone())
            .collect();
        assert_eq!(open, vec!["b"]);

        created.insert("b".into());
        statuses.insert("b".into(), ObservedStatus::Started);
        assert!(eligible(&apps, &created, &statuses).is_empty());

        statuses.insert("b".into(), ObservedStatus::Ready);
        let open: Vec<_> = eligible(&apps, &created, &statuses)
            .iter()
            .map(|app| app.name.clone())
            .collect();
        assert_eq!(open, vec!["c"]);
    }
}
