//! Volume discovery and title-equivalence grouping.
//!
//! Source volumes hold `Source/Title/Chapter` trees; override volumes hold
//! `Title/...` trees. Grouping resolves each raw title to a canonical one
//! (equivalence catalog, then override directory names, then the trimmed
//! raw title) and collapses titles sharing a normalized group key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use shelf_core::config::{EquivalentsDoc, SourcePriorityDoc};
use shelf_core::normalize::{normalize_title_key, normalize_token_key, SceneTagMatcher};

/// One source's contribution to a title group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBranch {
    pub source_name: String,
    pub source_path: PathBuf,
}

/// A canonical title with its branches across volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleGroup {
    pub group_key: String,
    pub canonical_title: String,
    pub source_branches: Vec<SourceBranch>,
    /// Existing override directories for this title, in volume order.
    pub override_dirs: Vec<PathBuf>,
}

/// Warning tied to the root it occurred under.
#[derive(Debug, Clone)]
pub struct DiscoveryWarning {
    pub root: PathBuf,
    pub message: String,
}

/// The volumes a pass works over.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredVolumes {
    pub source_volumes: Vec<PathBuf>,
    pub override_volumes: Vec<PathBuf>,
    pub warnings: Vec<DiscoveryWarning>,
}

impl DiscoveredVolumes {
    /// Warnings targeted at the sources root mean the source view may be
    /// incomplete and stale unmounts must be suppressed downstream.
    pub fn source_discovery_degraded(&self, sources_root: &Path) -> bool {
        self.warnings.iter().any(|w| w.root == sources_root)
    }
}

/// Discovery seam.
pub trait VolumeDiscovery: Send + Sync {
    fn discover(&self) -> DiscoveredVolumes;
}

/// Enumerates direct subdirectories of the sources and overrides roots.
#[derive(Debug, Clone)]
pub struct FsVolumeDiscovery {
    sources_root: PathBuf,
    overrides_root: PathBuf,
}

impl FsVolumeDiscovery {
    pub fn new(sources_root: PathBuf, overrides_root: PathBuf) -> Self {
        Self {
            sources_root,
            overrides_root,
        }
    }
}

fn sorted_subdirs(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

impl VolumeDiscovery for FsVolumeDiscovery {
    fn discover(&self) -> DiscoveredVolumes {
        let mut volumes = DiscoveredVolumes::default();
        match sorted_subdirs(&self.sources_root) {
            Ok(dirs) => volumes.source_volumes = dirs,
            Err(err) => volumes.warnings.push(DiscoveryWarning {
                root: self.sources_root.clone(),
                message: format!("cannot enumerate sources root: {err}"),
            }),
        }
        match sorted_subdirs(&self.overrides_root) {
            Ok(dirs) => volumes.override_volumes = dirs,
            Err(err) => volumes.warnings.push(DiscoveryWarning {
                root: self.overrides_root.clone(),
                message: format!("cannot enumerate overrides root: {err}"),
            }),
        }
        volumes
    }
}

/// Catalog inputs for grouping.
#[derive(Debug)]
pub struct GroupingContext<'a> {
    pub equivalents: &'a EquivalentsDoc,
    pub matcher: &'a SceneTagMatcher,
    pub priority: &'a SourcePriorityDoc,
    /// Token keys of sources excluded from merging.
    pub excluded_sources: &'a HashSet<String>,
}

fn hash_derived_key(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("g{hex}")
}

struct GroupAccumulator {
    canonical_title: String,
    branches: Vec<(usize, usize, SourceBranch)>,
    seen_paths: HashSet<PathBuf>,
}

/// Group every non-excluded `source/title` plus every override-only title.
///
/// Returns the groups ordered by canonical title then group key, plus
/// human-readable warnings.
pub fn build_title_groups(
    volumes: &DiscoveredVolumes,
    ctx: &GroupingContext<'_>,
) -> (Vec<TitleGroup>, Vec<String>) {
    let mut warnings = Vec::new();
    let keyer = |raw: &str| normalize_title_key(raw, Some(ctx.matcher));

    // Override titles first: they both seed override-only groups and act
    // as a canonical-name resolver for source titles.
    let mut override_dirs_by_key: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut override_canonical: HashMap<String, String> = HashMap::new();
    for volume in &volumes.override_volumes {
        let dirs = match sorted_subdirs(volume) {
            Ok(dirs) => dirs,
            Err(err) => {
                warnings.push(format!(
                    "cannot enumerate override volume '{}': {err}",
                    volume.display()
                ));
                continue;
            }
        };
        for dir in dirs {
            let name = dir.file_name().map(|n| n.to_string_lossy().to_string());
            let Some(name) = name else { continue };
            let key = keyer(&name);
            if key.is_empty() {
                warnings.push(format!(
                    "override directory '{}' has no resolvable title key",
                    dir.display()
                ));
                continue;
            }
            override_dirs_by_key.entry(key.clone()).or_default().push(dir);
            override_canonical.entry(key).or_insert_with(|| name.trim().to_string());
        }
    }

    let mut groups: BTreeMap<String, GroupAccumulator> = BTreeMap::new();

    for volume in &volumes.source_volumes {
        let source_name = volume
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let source_token = normalize_token_key(&source_name);
        if ctx.excluded_sources.contains(&source_token) {
            debug!(source = %source_name, "source excluded from grouping");
            continue;
        }
        let rank = ctx.priority.rank(&source_token);

        let titles = match sorted_subdirs(volume) {
            Ok(dirs) => dirs,
            Err(err) => {
                warnings.push(format!(
                    "cannot enumerate source volume '{}': {err}",
                    volume.display()
                ));
                continue;
            }
        };
        for title_dir in titles {
            let raw_title = title_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let raw_key = keyer(&raw_title);

            let canonical = ctx
                .equivalents
                .canonical_for_key(&raw_key, keyer)
                .map(str::to_string)
                .or_else(|| override_canonical.get(&raw_key).cloned())
                .unwrap_or_else(|| raw_title.trim().to_string());

            let mut group_key = keyer(&canonical);
            if group_key.is_empty() {
                group_key = raw_key.clone();
            }
            if group_key.is_empty() {
                group_key = hash_derived_key(&raw_title);
            }

            let accumulator = groups.entry(group_key).or_insert_with(|| GroupAccumulator {
                canonical_title: canonical.clone(),
                branches: Vec::new(),
                seen_paths: HashSet::new(),
            });
            // Branches dedupe by path; insertion order is kept within a rank.
            if accumulator.seen_paths.insert(title_dir.clone()) {
                let order = accumulator.branches.len();
                accumulator.branches.push((
                    rank,
                    order,
                    SourceBranch {
                        source_name: source_name.clone(),
                        source_path: title_dir,
                    },
                ));
            }
        }
    }

    // Override-only titles still deserve a merged view.
    for (key, canonical) in &override_canonical {
        if !groups.contains_key(key) {
            groups.insert(
                key.clone(),
                GroupAccumulator {
                    canonical_title: canonical.clone(),
                    branches: Vec::new(),
                    seen_paths: HashSet::new(),
                },
            );
        }
    }

    let mut result: Vec<TitleGroup> = groups
        .into_iter()
        .map(|(group_key, mut accumulator)| {
            accumulator.branches.sort_by_key(|(rank, order, _)| (*rank, *order));
            let override_dirs = override_dirs_by_key
                .get(&group_key)
                .cloned()
                .unwrap_or_default();
            TitleGroup {
                group_key,
                canonical_title: accumulator.canonical_title,
                source_branches: accumulator
                    .branches
                    .into_iter()
                    .map(|(_, _, branch)| branch)
                    .collect(),
                override_dirs,
            }
        })
        .collect();
    result.sort_by(|a, b| {
        a.canonical_title
            .cmp(&b.canonical_title)
            .then_with(|| a.group_key.cmp(&b.group_key))
    });

    (result, warnings)
}
