//! Resolved install plans shared by both backends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A named source of installable packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Registry {
    Pypi,
    Conda,
}

impl Registry {
    pub fn as_str(&self) -> &'static str {
        match self {
            Registry::Pypi => "pypi",
            Registry::Conda => "conda",
        }
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown registry {0:?} (expected \"pypi\" or \"conda\")")]
pub struct UnknownRegistry(pub String);

impl FromStr for Registry {
    type Err = UnknownRegistry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pypi" => Ok(Registry::Pypi),
            "conda" => Ok(Registry::Conda),
            other => Err(UnknownRegistry(other.to_string())),
        }
    }
}

/// One entry of an install plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    pub registry: Registry,
    /// Version constraint, empty for "any version".
    pub constraint: String,
}

/// Install plan: package name to request, one entry per name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Packages(BTreeMap<String, PackageRequest>);

impl Packages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the request for `name`, returning the previous one.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        registry: Registry,
        constraint: impl Into<String>,
    ) -> Option<PackageRequest> {
        self.0.insert(
            name.into(),
            PackageRequest {
                registry,
                constraint: constraint.into(),
            },
        )
    }

    pub fn get(&self, name: &str) -> Option<&PackageRequest> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PackageRequest)> {
        self.0.iter().map(|(name, req)| (name.as_str(), req))
    }

    /// Packages from one registry, in name order.
    pub fn from_registry(&self, registry: Registry) -> impl Iterator<Item = (&str, &PackageRequest)> {
        self.iter().filter(move |(_, req)| req.registry == registry)
    }

    /// Name to effective constraint, without registries.
    pub fn constraints(&self) -> BTreeMap<&str, &str> {
        self.iter()
            .map(|(name, req)| (name, req.constraint.as_str()))
            .collect()
    }
}

impl<N: Into<String>, C: Into<String>> FromIterator<(N, Registry, C)> for Packages {
    fn from_iter<T: IntoIterator<Item = (N, Registry, C)>>(iter: T) -> Self {
        let mut packages = Packages::new();
        for (name, registry, constraint) in iter {
            packages.insert(name, registry, constraint);
        }
        packages
    }
}

/// Render `name` + `constraint` as an installer argument.
///
/// A bare version (`1.2`) is treated as an exact pin.
pub fn requirement(name: &str, constraint: &str) -> String {
    let constraint = constraint.trim();
    if constraint.is_empty() {
        name.to_string()
    } else if constraint.starts_with(|c: char| c.is_ascii_digit()) {
        format!("{name}=={constraint}")
    } else {
        format!("{name}{constraint}")
    }
}
