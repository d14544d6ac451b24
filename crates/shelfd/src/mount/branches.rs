//! Branch-link planning and staging.
//!
//! Every title group gets a directory under the branches root holding
//! symlinks to its override and source trees. The union filesystem mounts
//! those links as branches, so a retarget is one symlink swap instead of
//! a remount with new paths.
//!
//! Link names are deterministic: `00_override` for the preferred override,
//! `01_override_<label>_NNN` for additional overrides, and
//! `10_source_<label>_NNN` for source branches. The numeric prefixes give
//! mergerfs a stable first-found ordering.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::discovery::TitleGroup;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("group key is empty")]
    EmptyGroupKey,
    #[error("branch target '{0}' is not absolute")]
    RelativeTarget(PathBuf),
}

/// Branch access handed to the union filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Rw,
    Ro,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rw => "RW",
            Self::Ro => "RO",
        }
    }
}

/// One staged symlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchLink {
    pub name: String,
    pub link_path: PathBuf,
    pub target: PathBuf,
    pub access: AccessMode,
}

/// The full branch layout for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPlan {
    pub preferred_override_path: PathBuf,
    pub branch_dir: PathBuf,
    pub branch_spec: String,
    pub group_id: String,
    pub links: Vec<BranchLink>,
}

/// Squash a source or volume name into a filesystem-safe label.
fn link_label(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if label.is_empty() {
        "x".to_string()
    } else {
        label
    }
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Plans branch directories under one root.
#[derive(Debug, Clone)]
pub struct BranchPlanner {
    branches_root: PathBuf,
}

impl BranchPlanner {
    pub fn new(branches_root: PathBuf) -> Self {
        Self { branches_root }
    }

    pub fn branches_root(&self) -> &Path {
        &self.branches_root
    }

    pub fn branch_dir_for_key(&self, group_key: &str) -> PathBuf {
        self.branches_root.join(shelf_core::escape_segment(group_key))
    }

    /// Plan the branch layout for one group.
    ///
    /// `override_dirs` are the existing override directories for the title
    /// in volume-priority order; `fallback_override` is where the preferred
    /// override will be created when none exists yet.
    pub fn plan(
        &self,
        group: &TitleGroup,
        override_dirs: &[PathBuf],
        fallback_override: &Path,
    ) -> Result<BranchPlan, PlanError> {
        if group.group_key.is_empty() {
            return Err(PlanError::EmptyGroupKey);
        }
        let branch_dir = self.branch_dir_for_key(&group.group_key);
        let mut links = Vec::new();

        let preferred = override_dirs
            .first()
            .cloned()
            .unwrap_or_else(|| fallback_override.to_path_buf());
        links.push(BranchLink {
            name: "00_override".to_string(),
            link_path: branch_dir.join("00_override"),
            target: preferred.clone(),
            access: AccessMode::Rw,
        });

        for (index, extra) in override_dirs.iter().skip(1).enumerate() {
            let volume = extra
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let name = format!("01_override_{}_{index:03}", link_label(&volume));
            links.push(BranchLink {
                name: name.clone(),
                link_path: branch_dir.join(name),
                target: extra.clone(),
                access: AccessMode::Ro,
            });
        }

        for (index, branch) in group.source_branches.iter().enumerate() {
            let name = format!("10_source_{}_{index:03}", link_label(&branch.source_name));
            links.push(BranchLink {
                name: name.clone(),
                link_path: branch_dir.join(name),
                target: branch.source_path.clone(),
                access: AccessMode::Ro,
            });
        }

        for link in &links {
            if !link.target.is_absolute() {
                return Err(PlanError::RelativeTarget(link.target.clone()));
            }
        }

        let branch_spec = links
            .iter()
            .map(|link| format!("{}={}", link.link_path.display(), link.access.as_str()))
            .collect::<Vec<_>>()
            .join(":");

        Ok(BranchPlan {
            preferred_override_path: preferred,
            branch_dir,
            branch_spec,
            group_id: short_hash(&group.group_key),
            links,
        })
    }
}

/// Materialize a plan's links, pruning entries the plan no longer names.
/// Returns warnings for anything that could not be staged.
pub fn stage_branch_links(plan: &BranchPlan) -> std::io::Result<Vec<String>> {
    std::fs::create_dir_all(&plan.branch_dir)?;
    let mut warnings = Vec::new();
    let desired: HashMap<&str, &BranchLink> =
        plan.links.iter().map(|l| (l.name.as_str(), l)).collect();

    for entry in std::fs::read_dir(&plan.branch_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let keep = desired.get(name.as_str()).is_some_and(|link| {
            std::fs::read_link(entry.path())
                .map(|target| target == link.target)
                .unwrap_or(false)
        });
        if !keep {
            let result = if entry.path().is_dir() && std::fs::read_link(entry.path()).is_err() {
                std::fs::remove_dir_all(entry.path())
            } else {
                std::fs::remove_file(entry.path())
            };
            if let Err(err) = result {
                warnings.push(format!(
                    "could not remove stale branch entry '{}': {err}",
                    entry.path().display()
                ));
            }
        }
    }

    for link in &plan.links {
        if link.link_path.exists() || std::fs::read_link(&link.link_path).is_ok() {
            continue;
        }
        #[cfg(unix)]
        if let Err(err) = std::os::unix::fs::symlink(&link.target, &link.link_path) {
            warnings.push(format!(
                "could not stage branch link '{}': {err}",
                link.link_path.display()
            ));
        }
    }

    Ok(warnings)
}

/// Remove branch directories that are neither active nor preserved.
/// Returns the removed paths.
pub fn prune_branch_dirs(
    branches_root: &Path,
    keep: &HashSet<PathBuf>,
) -> std::io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !branches_root.exists() {
        return Ok(removed);
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(branches_root)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && !keep.contains(path))
        .collect();
    candidates.sort();
    for path in candidates {
        std::fs::remove_dir_all(&path)?;
        removed.push(path);
    }
    Ok(removed)
}
