//! Dependency manifest parsing.
//!
//! A manifest is a table of rows `name [registry[*]] [constraint]`:
//!
//! ```text
//! numpy              conda
//! python             conda*   >=3.10
//! panel              pypi     sync
//! umap
//! ```
//!
//! A missing registry means PyPI. A trailing `*` on the registry marks the
//! dependency as conditional (installed only inside a notebook host). The
//! constraint `sync` pins the package to whatever version the host runs.

use kernel_env::Registry;
use serde::Serialize;
use std::path::Path;
use std::sync::OnceLock;

/// Marker suffix on the registry token for conditional dependencies.
pub const CONDITIONAL_MARKER: char = '*';

/// Constraint keyword: match the notebook host's installed version.
pub const SYNC_WITH_HOST: &str = "sync";

/// Manifest baked into the binary.
pub const DEFAULT_MANIFEST: &str = "\
bokeh              pypi     sync
hdbscan
ipywidgets         conda
jupyterlab         conda
jupyterlab-lsp     conda
matplotlib         conda
numba              conda
numpy              conda
pandas             conda
panel              pypi     sync
pip                conda*
python             conda*   >=3.10
python-lsp-server  conda
pyviz-comms        pypi     sync
scipy              conda
thisnotthat
umap
vectorizers
";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest line {line}: unknown registry {token:?} (expected \"pypi\" or \"conda\")")]
    UnknownRegistry { line: usize, token: String },

    #[error("manifest line {line}: expected `name [registry[*]] [constraint]`, got {row:?}")]
    TooManyTokens { line: usize, row: String },

    #[error("failed to read manifest {path}: {reason}")]
    Read { path: String, reason: String },
}

/// One declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub name: String,
    pub registry: Registry,
    /// Version constraint, empty for "any version".
    pub constraint: String,
    pub conditional: bool,
}

impl Dependency {
    /// Parse a single row. `line` is only used in error messages.
    ///
    /// Returns `Ok(None)` for blank rows and `#` comments.
    pub fn parse_row(row: &str, line: usize) -> Result<Option<Self>, ManifestError> {
        let row = row.trim();
        if row.is_empty() || row.starts_with('#') {
            return Ok(None);
        }

        let tokens: Vec<&str> = row.split_whitespace().collect();
        let (name, registry_token, constraint) = match tokens.as_slice() {
            [name] => (*name, None, ""),
            [name, registry] => (*name, Some(*registry), ""),
            [name, registry, constraint] => (*name, Some(*registry), *constraint),
            _ => {
                return Err(ManifestError::TooManyTokens {
                    line,
                    row: row.to_string(),
                })
            }
        };

        let (registry, conditional) = match registry_token {
            None => (Registry::Pypi, false),
            Some(token) => {
                let (bare, conditional) = match token.strip_suffix(CONDITIONAL_MARKER) {
                    Some(bare) => (bare, true),
                    None => (token, false),
                };
                let registry = bare
                    .parse::<Registry>()
                    .map_err(|_| ManifestError::UnknownRegistry {
                        line,
                        token: bare.to_string(),
                    })?;
                (registry, conditional)
            }
        };

        Ok(Some(Dependency {
            name: name.to_string(),
            registry,
            constraint: constraint.to_string(),
            conditional,
        }))
    }

    /// Whether the constraint asks to follow the notebook host's version.
    pub fn syncs_with_host(&self) -> bool {
        self.constraint == SYNC_WITH_HOST
    }
}

/// Ordered list of dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Manifest {
    dependencies: Vec<Dependency>,
}

impl Manifest {
    /// Parse newline-separated rows.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut dependencies = Vec::new();
        for (index, row) in text.lines().enumerate() {
            if let Some(dep) = Dependency::parse_row(row, index + 1)? {
                dependencies.push(dep);
            }
        }
        Ok(Self { dependencies })
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&text)
    }

    /// The built-in manifest, parsed once per process.
    pub fn builtin() -> Result<&'static Manifest, ManifestError> {
        static BUILTIN: OnceLock<Result<Manifest, ManifestError>> = OnceLock::new();
        BUILTIN
            .get_or_init(|| Manifest::parse(DEFAULT_MANIFEST))
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}
