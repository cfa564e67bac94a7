//! Turn the manifest and a sensed [`Context`] into an install plan.

use kernel_env::Packages;
use log::{debug, warn};

use crate::context::Context;
use crate::manifest::{Manifest, SYNC_WITH_HOST};

/// Resolve `manifest` against `context`.
///
/// Conditional dependencies only apply inside a notebook host. Constraints
/// come from `critical_dependencies` when listed there; a `sync` constraint
/// that no host version replaced means "any version".
pub fn resolve(manifest: &Manifest, context: &Context) -> Packages {
    let mut packages = Packages::new();

    for dep in manifest.iter() {
        if dep.conditional && !context.running_inside_notebook_host {
            debug!("Skipping conditional dependency {} outside a notebook host", dep.name);
            continue;
        }

        let constraint = context
            .critical_dependencies
            .get(&dep.name)
            .unwrap_or(&dep.constraint);
        let constraint = if constraint == SYNC_WITH_HOST {
            ""
        } else {
            constraint.as_str()
        };

        if packages.insert(&dep.name, dep.registry, constraint).is_some() {
            warn!("Dependency {} declared more than once, keeping the last row", dep.name);
        }
    }

    debug!("Resolved {} packages", packages.len());
    packages
}
