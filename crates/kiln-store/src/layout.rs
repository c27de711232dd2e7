use crate::{write_atomic, StoreError};
use kiln_schema::{ImageBuildResult, CONTEXT_DIR};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Shared store root: blobs, direct-backend image records, build cache.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("store").join("objects")
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("store").join("images")
    }

    #[inline]
    pub fn tags_dir(&self) -> PathBuf {
        self.root.join("store").join("tags")
    }

    #[inline]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("store").join("cache")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("store").join(".lock")
    }

    pub fn is_initialized(&self) -> bool {
        self.root.join("store").join(VERSION_FILE).exists()
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.objects_dir())?;
        fs::create_dir_all(self.images_dir())?;
        fs::create_dir_all(self.tags_dir())?;
        fs::create_dir_all(self.cache_dir())?;

        let version_path = self.root.join("store").join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            write_atomic(&version_path, serde_json::to_string_pretty(&ver)?.as_bytes())
        }
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join("store").join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;
        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

/// Work directory of a single build invocation.
///
/// ```text
/// <root>/
///   context/layer0, layer1, ...   copied into the image by `Copy`
///   ephemeral/docker              engine-only files, bind mounted into RUN
///   ephemeral/packages            local package mirror
///   ephemeral/repos               repository definitions for the mirror
///   Dockerfile, .dockerignore     generated
///   image-id, image-build.json    written by the backend
/// ```
#[derive(Debug, Clone)]
pub struct BuildLayout {
    root: PathBuf,
}

impl BuildLayout {
    pub const DOCKER_MOUNT: &'static str = "ephemeral/docker";
    pub const PACKAGES_MOUNT: &'static str = "ephemeral/packages";
    pub const REPOS_MOUNT: &'static str = "ephemeral/repos";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn context_dir(&self) -> PathBuf {
        self.root.join(CONTEXT_DIR)
    }

    #[inline]
    pub fn layer_dir(&self, ordinal: u32) -> PathBuf {
        self.context_dir().join(Self::layer_name(ordinal))
    }

    /// `context/layerN`, relative to the work directory.
    pub fn layer_relative(ordinal: u32) -> PathBuf {
        Path::new(CONTEXT_DIR).join(Self::layer_name(ordinal))
    }

    fn layer_name(ordinal: u32) -> String {
        format!("layer{ordinal}")
    }

    #[inline]
    pub fn docker_mount_dir(&self) -> PathBuf {
        self.root.join(Self::DOCKER_MOUNT)
    }

    #[inline]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join(Self::PACKAGES_MOUNT)
    }

    #[inline]
    pub fn repos_dir(&self) -> PathBuf {
        self.root.join(Self::REPOS_MOUNT)
    }

    #[inline]
    pub fn build_file(&self) -> PathBuf {
        self.root.join("Dockerfile")
    }

    #[inline]
    pub fn ignore_file(&self) -> PathBuf {
        self.root.join(".dockerignore")
    }

    #[inline]
    pub fn image_id_file(&self) -> PathBuf {
        self.root.join("image-id")
    }

    #[inline]
    pub fn build_info_file(&self) -> PathBuf {
        self.root.join("image-build.json")
    }

    /// Create the context and ephemeral directories. The repos directory is
    /// cleared so definitions from a previous invocation never leak in.
    pub fn prepare(&self) -> Result<(), StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::MissingWorkDir(self.root.clone()));
        }
        fs::create_dir_all(self.context_dir())?;
        fs::create_dir_all(self.docker_mount_dir())?;
        fs::create_dir_all(self.packages_dir())?;
        let repos = self.repos_dir();
        if repos.exists() {
            fs::remove_dir_all(&repos)?;
        }
        fs::create_dir_all(&repos)?;
        Ok(())
    }

    pub fn write_repo_config(&self, file_name: &str, contents: &str) -> Result<PathBuf, StoreError> {
        let path = self.repos_dir().join(file_name);
        write_atomic(&path, contents.as_bytes())?;
        Ok(path)
    }

    pub fn write_build_file(&self, text: &str) -> Result<(), StoreError> {
        write_atomic(&self.build_file(), text.as_bytes())
    }

    pub fn write_ignore_manifest(&self, text: &str) -> Result<(), StoreError> {
        write_atomic(&self.ignore_file(), text.as_bytes())
    }

    /// Image id written by the engine's `--iidfile`.
    pub fn read_image_id(&self) -> Result<String, StoreError> {
        Ok(fs::read_to_string(self.image_id_file())?.trim().to_owned())
    }

    pub fn write_build_info(&self, result: &ImageBuildResult) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(result)?;
        write_atomic(&self.build_info_file(), json.as_bytes())
    }

    pub fn read_build_info(&self) -> Result<ImageBuildResult, StoreError> {
        let content = fs::read_to_string(self.build_info_file())?;
        Ok(serde_json::from_str(&content)?)
    }
}
