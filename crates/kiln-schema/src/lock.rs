use crate::distribution::{is_arch_independent, Architecture, OsDistribution, PackageManager};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const LOCK_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock file parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("lock file serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unsupported lock_version: {0}, expected {LOCK_VERSION}")]
    UnsupportedVersion(u32),
    #[error(
        "conflicting pins for '{name}' ({architecture}) on {distribution}: '{existing}' and '{incoming}'"
    )]
    ConflictingPin {
        distribution: OsDistribution,
        name: String,
        architecture: String,
        existing: String,
        incoming: String,
    },
    #[error(
        "no pin for {} on {distribution}/{architecture}: {}. Regenerate the lockfile with 'kiln lock'.",
        noun(.packages),
        .packages.join(", ")
    )]
    UnresolvedPackages {
        distribution: OsDistribution,
        architecture: Architecture,
        packages: Vec<String>,
    },
}

fn noun(packages: &[String]) -> &'static str {
    if packages.len() == 1 {
        "package"
    } else {
        "packages"
    }
}

/// One resolved package for one architecture.
///
/// `architecture` is the package's own architecture as the package manager
/// reports it (`x86_64`, `amd64`, `noarch`, `all`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackagePin {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub release: String,
    pub architecture: String,
}

impl PackagePin {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        release: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            release: release.into(),
            architecture: architecture.into(),
        }
    }

    /// Package reference as the distribution's installer expects it.
    ///
    /// YUM: `name-version-release.arch`. APT and APK: `name=version[-release]`,
    /// with no hyphen when the release is empty.
    pub fn render(&self, distribution: OsDistribution) -> String {
        match distribution.package_manager() {
            PackageManager::Yum => format!(
                "{}-{}-{}.{}",
                self.name, self.version, self.release, self.architecture
            ),
            PackageManager::Apt | PackageManager::Apk => {
                if self.release.is_empty() {
                    format!("{}={}", self.name, self.version)
                } else {
                    format!("{}={}-{}", self.name, self.version, self.release)
                }
            }
        }
    }

    fn installable_on(&self, distribution: OsDistribution, arch: Architecture) -> bool {
        is_arch_independent(&self.architecture)
            || self.architecture == arch.package_arch(distribution.package_manager())
    }

    fn overlaps(&self, other: &PackagePin) -> bool {
        self.name == other.name
            && (self.architecture == other.architecture
                || is_arch_independent(&self.architecture)
                || is_arch_independent(&other.architecture))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockDocument {
    lock_version: u32,
    #[serde(default, rename = "package")]
    packages: Vec<LockEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    distribution: OsDistribution,
    architecture: String,
    name: String,
    version: String,
    #[serde(default)]
    release: String,
}

/// Architecture-partitioned pins per distribution.
///
/// Produced by lockfile generation (network dependent), then consumed
/// read-only by every build. At most one pin exists per package name and
/// architecture within a distribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockFile {
    packages: BTreeMap<OsDistribution, BTreeSet<PackagePin>>,
}

impl LockFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pin. Re-adding an identical pin is a no-op; a different pin for
    /// the same name and architecture is rejected.
    pub fn insert(&mut self, distribution: OsDistribution, pin: PackagePin) -> Result<(), LockError> {
        let set = self.packages.entry(distribution).or_default();
        if set.contains(&pin) {
            return Ok(());
        }
        if let Some(existing) = set.iter().find(|p| p.overlaps(&pin)) {
            return Err(LockError::ConflictingPin {
                distribution,
                name: pin.name.clone(),
                architecture: pin.architecture.clone(),
                existing: existing.render(distribution),
                incoming: pin.render(distribution),
            });
        }
        set.insert(pin);
        Ok(())
    }

    /// Replace every pin installable on `arch` with a freshly resolved set.
    pub fn replace_partition(
        &mut self,
        distribution: OsDistribution,
        arch: Architecture,
        pins: impl IntoIterator<Item = PackagePin>,
    ) -> Result<(), LockError> {
        if let Some(set) = self.packages.get_mut(&distribution) {
            set.retain(|p| !p.installable_on(distribution, arch));
        }
        for pin in pins {
            self.insert(distribution, pin)?;
        }
        Ok(())
    }

    /// Offline lookup of the pin for `name` installable on `arch`.
    pub fn lookup(
        &self,
        name: &str,
        distribution: OsDistribution,
        arch: Architecture,
    ) -> Option<&PackagePin> {
        self.packages
            .get(&distribution)?
            .iter()
            .find(|p| p.name == name && p.installable_on(distribution, arch))
    }

    /// Pins for every requested package, in request order. Fails naming every
    /// package without a pin.
    pub fn pins_for<'a>(
        &self,
        packages: impl IntoIterator<Item = &'a str>,
        distribution: OsDistribution,
        arch: Architecture,
    ) -> Result<Vec<&PackagePin>, LockError> {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for name in packages {
            match self.lookup(name, distribution, arch) {
                Some(pin) => found.push(pin),
                None => missing.push(name.to_owned()),
            }
        }
        if missing.is_empty() {
            Ok(found)
        } else {
            missing.sort();
            Err(LockError::UnresolvedPackages {
                distribution,
                architecture: arch,
                packages: missing,
            })
        }
    }

    pub fn pins(&self, distribution: OsDistribution) -> impl Iterator<Item = &PackagePin> {
        self.packages.get(&distribution).into_iter().flatten()
    }

    pub fn distributions(&self) -> impl Iterator<Item = OsDistribution> + '_ {
        self.packages
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(d, _)| *d)
    }

    pub fn len(&self) -> usize {
        self.packages.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blake3 over every pin in canonical order. Feeds the build cache key.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (dist, set) in &self.packages {
            for pin in set {
                hasher.update(
                    format!(
                        "pin:{dist}:{}:{}:{}:{}\n",
                        pin.name, pin.version, pin.release, pin.architecture
                    )
                    .as_bytes(),
                );
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn to_toml_string(&self) -> Result<String, LockError> {
        let doc = LockDocument {
            lock_version: LOCK_VERSION,
            packages: self
                .packages
                .iter()
                .flat_map(|(dist, set)| {
                    set.iter().map(|pin| LockEntry {
                        distribution: *dist,
                        architecture: pin.architecture.clone(),
                        name: pin.name.clone(),
                        version: pin.version.clone(),
                        release: pin.release.clone(),
                    })
                })
                .collect(),
        };
        Ok(toml::to_string_pretty(&doc)?)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, LockError> {
        let doc: LockDocument = toml::from_str(input)?;
        if doc.lock_version != LOCK_VERSION {
            return Err(LockError::UnsupportedVersion(doc.lock_version));
        }
        let mut lock = Self::new();
        for entry in doc.packages {
            lock.insert(
                entry.distribution,
                PackagePin::new(entry.name, entry.version, entry.release, entry.architecture),
            )?;
        }
        Ok(lock)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), LockError> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| LockError::Io(e.error))?;
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
