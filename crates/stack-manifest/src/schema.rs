//! Manifest parsing and dependency normalization
//!
//! A stack's `pyproject.toml` comes in one of two shapes:
//!
//! - **Poetry** (`[tool.poetry]`): dependencies are a table keyed by package
//!   name, optional ones are flagged inline, and `[tool.poetry.extras]` maps
//!   each group to bare package names.
//! - **Project** (`[project]`, PEP 621): dependencies are a list of
//!   requirement strings and `[project.optional-dependencies]` maps each group
//!   to more requirement strings.
//!
//! The shape is detected once, structurally, when the manifest is parsed.

use crate::error::ManifestError;
use crate::Result;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// Name of the implicit group holding non-optional dependencies.
pub const BASE_GROUP: &str = "base";

/// Pseudo-dependency naming the interpreter itself.
const INTERPRETER_PACKAGE: &str = "python";

/// Characters that end the package name in a requirement string.
const SPECIFIER_TERMINATORS: &[char] = &['>', '<', '=', '!', '~', ';', '[', '@'];

/// A parsed manifest, tagged by the schema it was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// `[tool.poetry]` manifest
    Poetry(PoetryManifest),
    /// `[project]` manifest
    Project(ProjectManifest),
}

/// Dependencies declared under `[tool.poetry]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoetryManifest {
    /// Entries of `tool.poetry.dependencies`, in document order
    pub dependencies: Vec<PoetryDependency>,
    /// `tool.poetry.extras`
    pub extras: BTreeMap<String, Vec<String>>,
}

/// One entry of `tool.poetry.dependencies`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoetryDependency {
    pub name: String,
    /// Only a table spec with `optional = true` is optional
    pub optional: bool,
}

/// Dependencies declared under `[project]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectManifest {
    /// Raw requirement strings from `project.dependencies`
    pub dependencies: Vec<String>,
    /// Raw requirement strings from `project.optional-dependencies`
    pub optional_dependencies: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct RawDocument {
    tool: Option<RawTool>,
    project: Option<RawProject>,
}

#[derive(Deserialize)]
struct RawTool {
    poetry: Option<RawPoetry>,
}

#[derive(Deserialize)]
struct RawPoetry {
    dependencies: Option<toml::Table>,
    #[serde(default)]
    extras: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct RawProject {
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default, rename = "optional-dependencies")]
    optional_dependencies: BTreeMap<String, Vec<String>>,
}

impl Manifest {
    /// Read and parse the manifest at `path`.
    ///
    /// Every call re-reads the file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ManifestError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ManifestError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::parse(&text, path)
    }

    /// Parse manifest text. `path` is only used for error messages.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let raw: RawDocument = toml::from_str(text).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(poetry) = raw.tool.and_then(|tool| tool.poetry) {
            let table = poetry.dependencies.ok_or_else(|| ManifestError::MissingField {
                path: path.to_path_buf(),
                field: "tool.poetry.dependencies",
            })?;
            let dependencies = table
                .into_iter()
                .map(|(name, spec)| PoetryDependency {
                    optional: is_optional(&spec),
                    name,
                })
                .collect();
            debug!(path = %path.display(), "Detected [tool.poetry] manifest");
            return Ok(Manifest::Poetry(PoetryManifest {
                dependencies,
                extras: poetry.extras,
            }));
        }

        match raw.project {
            Some(project) => {
                debug!(path = %path.display(), "Detected [project] manifest");
                Ok(Manifest::Project(ProjectManifest {
                    dependencies: project.dependencies,
                    optional_dependencies: project.optional_dependencies,
                }))
            }
            None => Err(ManifestError::UnknownSchema {
                path: path.to_path_buf(),
            }),
        }
    }

    /// All group names, always including `base`.
    pub fn groups(&self) -> BTreeSet<String> {
        let declared = match self {
            Manifest::Poetry(poetry) => poetry.extras.keys(),
            Manifest::Project(project) => project.optional_dependencies.keys(),
        };
        let mut groups: BTreeSet<String> = declared.cloned().collect();
        groups.insert(BASE_GROUP.to_string());
        groups
    }

    /// Bare package names for `group`, or `None` if the group is not declared.
    pub fn dependencies(&self, group: &str) -> Option<Vec<String>> {
        match self {
            Manifest::Poetry(poetry) => poetry.dependencies(group),
            Manifest::Project(project) => project.dependencies(group),
        }
    }
}

impl PoetryManifest {
    fn dependencies(&self, group: &str) -> Option<Vec<String>> {
        // `base` is what `poetry install` without `-E` provides, so an extra
        // that happens to be named `base` does not contribute to it.
        if group == BASE_GROUP {
            let required = self
                .dependencies
                .iter()
                .filter(|dep| !dep.optional)
                .map(|dep| dep.name.as_str());
            return Some(unique_names(required));
        }

        self.extras
            .get(group)
            .map(|names| unique_names(names.iter().map(String::as_str)))
    }
}

impl ProjectManifest {
    fn dependencies(&self, group: &str) -> Option<Vec<String>> {
        let extra: &[String] = if group == BASE_GROUP {
            &[]
        } else {
            self.optional_dependencies.get(group)?.as_slice()
        };
        let specs = self.dependencies.iter().chain(extra);
        Some(unique_names(specs.map(String::as_str)))
    }
}

/// Strip the version constraint from a requirement string.
///
/// `"torch>=2.0.0"` becomes `"torch"`; a bare name is returned unchanged.
pub fn package_name(spec: &str) -> &str {
    let spec = spec.trim_start();
    let end = spec
        .find(|c: char| SPECIFIER_TERMINATORS.contains(&c) || c.is_whitespace())
        .unwrap_or(spec.len());
    &spec[..end]
}

fn is_optional(spec: &toml::Value) -> bool {
    spec.as_table()
        .and_then(|table| table.get("optional"))
        .and_then(toml::Value::as_bool)
        .unwrap_or(false)
}

fn is_interpreter(name: &str) -> bool {
    name.eq_ignore_ascii_case(INTERPRETER_PACKAGE)
}

/// Normalize, drop the interpreter and empties, keep first occurrence order.
fn unique_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for name in names.map(package_name) {
        if name.is_empty() || is_interpreter(name) {
            continue;
        }
        if seen.insert(name.to_string()) {
            out.push(name.to_string());
        }
    }
    out
}
