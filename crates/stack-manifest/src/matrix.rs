//! Stack discovery and case-matrix expansion
//!
//! Stacks are the immediate subdirectories of a root that contain a manifest.
//! Each stack contributes one case per group; cases are ordered by stack name
//! then group name so that ids are stable across runs.

use crate::error::{ManifestError, MatrixError};
use crate::schema::{Manifest, BASE_GROUP};
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default manifest file name looked up in each stack directory.
pub const DEFAULT_MANIFEST_FILE: &str = "pyproject.toml";

/// A directory holding one ML environment definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    /// Directory name
    pub name: String,
    /// Stack directory
    pub path: PathBuf,
    /// Manifest inside `path`
    pub manifest_path: PathBuf,
}

impl Stack {
    pub fn new(path: impl Into<PathBuf>, manifest_file: &str) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let manifest_path = path.join(manifest_file);
        Self {
            name,
            path,
            manifest_path,
        }
    }

    /// Parse this stack's manifest. Re-reads the file on every call.
    pub fn manifest(&self) -> Result<Manifest> {
        Manifest::load(&self.manifest_path)
    }

    /// Group names declared by the manifest, plus `base`.
    pub fn groups(&self) -> Result<BTreeSet<String>> {
        Ok(self.manifest()?.groups())
    }

    /// Package names that `group` should make importable.
    pub fn dependencies(&self, group: &str) -> Result<Vec<String>> {
        self.manifest()?
            .dependencies(group)
            .ok_or_else(|| ManifestError::UnknownGroup {
                path: self.manifest_path.clone(),
                group: group.to_string(),
            })
    }
}

/// `groups_for(stack)`: all groups of a stack, always including `base`.
pub fn groups_for(stack: &Stack) -> Result<BTreeSet<String>> {
    stack.groups()
}

/// `dependencies_for(stack, group)`: ordered, de-duplicated package names.
pub fn dependencies_for(stack: &Stack, group: &str) -> Result<Vec<String>> {
    stack.dependencies(group)
}

/// One (stack, group) cell of the test matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Case {
    pub stack: Stack,
    pub group: String,
}

impl Case {
    pub fn new(stack: Stack, group: impl Into<String>) -> Self {
        Self {
            stack,
            group: group.into(),
        }
    }

    /// `<stack>-<group>`
    pub fn id(&self) -> String {
        format!("{}-{}", self.stack.name, self.group)
    }

    pub fn is_base(&self) -> bool {
        self.group == BASE_GROUP
    }

    /// Dependencies of this case, read fresh from the manifest.
    pub fn dependencies(&self) -> Result<Vec<String>> {
        self.stack.dependencies(&self.group)
    }
}

impl fmt::Display for Case {
    /// `<stack>[<group>]`, the form used in reports
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.stack.name, self.group)
    }
}

/// The expanded, ordered list of cases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matrix {
    cases: Vec<Case>,
}

impl Matrix {
    pub fn cases(&self) -> &[Case] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.cases.iter().map(Case::id).collect()
    }

    /// Keep only cases whose id contains `pattern`.
    pub fn filter(self, pattern: &str) -> Self {
        Self {
            cases: self
                .cases
                .into_iter()
                .filter(|case| case.id().contains(pattern))
                .collect(),
        }
    }
}

impl IntoIterator for Matrix {
    type Item = Case;
    type IntoIter = std::vec::IntoIter<Case>;

    fn into_iter(self) -> Self::IntoIter {
        self.cases.into_iter()
    }
}

/// Find every stack directory under `root`, sorted by name.
///
/// Directories without `manifest_file` are skipped. A missing root yields no
/// stacks.
pub fn discover(root: &Path, manifest_file: &str) -> std::result::Result<Vec<Stack>, MatrixError> {
    if !root.exists() {
        warn!(root = %root.display(), "Stacks directory does not exist");
        return Ok(Vec::new());
    }

    let scan_err = |source: std::io::Error| MatrixError::Scan {
        path: root.to_path_buf(),
        source,
    };

    let mut stacks = Vec::new();
    for entry in std::fs::read_dir(root).map_err(scan_err)? {
        let path = entry.map_err(scan_err)?.path();
        if !path.is_dir() {
            continue;
        }
        let stack = Stack::new(path, manifest_file);
        if stack.manifest_path.is_file() {
            debug!(stack = %stack.name, "Discovered stack");
            stacks.push(stack);
        }
    }

    stacks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(stacks)
}

/// Expand stacks into the full (stack, group) case list.
///
/// Fails on the first unreadable manifest and on any id collision.
pub fn expand(stacks: &[Stack]) -> std::result::Result<Matrix, MatrixError> {
    let mut owners: BTreeMap<String, String> = BTreeMap::new();
    let mut cases = Vec::new();

    for stack in stacks {
        let groups = stack.groups().map_err(|source| MatrixError::Manifest {
            stack: stack.name.clone(),
            source,
        })?;

        for group in groups {
            let case = Case::new(stack.clone(), group);
            let id = case.id();
            if let Some(first) = owners.insert(id.clone(), stack.name.clone()) {
                return Err(MatrixError::DuplicateCaseId {
                    id,
                    first,
                    second: stack.name.clone(),
                });
            }
            cases.push(case);
        }
    }

    Ok(Matrix { cases })
}
