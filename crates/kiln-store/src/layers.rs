use crate::StoreError;
use kiln_schema::PermissionPolicy;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Owner written into every entry of a packed layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Root,
    Numeric { uid: u64, gid: u64 },
    Named { user: String, group: String },
}

impl Ownership {
    /// Parse a `--chown` style value. A missing group repeats the user.
    pub fn parse(spec: Option<&str>) -> Result<Self, StoreError> {
        let Some(spec) = spec.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self::Root);
        };
        let (user, group) = spec.split_once(':').unwrap_or((spec, spec));
        if user.is_empty() || group.is_empty() {
            return Err(StoreError::InvalidOwnership(spec.to_owned()));
        }
        match (user.parse::<u64>(), group.parse::<u64>()) {
            (Ok(uid), Ok(gid)) => Ok(Self::Numeric { uid, gid }),
            (Err(_), Err(_)) => Ok(Self::Named {
                user: user.to_owned(),
                group: group.to_owned(),
            }),
            _ => Err(StoreError::InvalidOwnership(spec.to_owned())),
        }
    }
}

/// How a layer directory is written into its archive.
#[derive(Debug, Clone)]
pub struct LayerOptions {
    /// Absolute path in the image the directory is extracted to.
    pub destination: String,
    pub ownership: Ownership,
    pub permissions: PermissionPolicy,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self {
            destination: "/".to_owned(),
            ownership: Ownership::Root,
            permissions: PermissionPolicy::Preserve,
        }
    }
}

/// Create a deterministic tar archive from a layer directory.
///
/// Entries are sorted by path and carry mtime 0. Ownership comes from
/// `options`, never from the host. Regular files, directories and symlinks
/// are supported; anything else is skipped with a warning.
pub fn pack_layer(source_dir: &Path, options: &LayerOptions) -> Result<Vec<u8>, StoreError> {
    let mut entries = collect_entries(source_dir, source_dir)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let prefix = options.destination.trim_matches('/');
    let mut ar = tar::Builder::new(Vec::new());
    ar.follow_symlinks(false);

    let mut parent = PathBuf::new();
    for component in Path::new(prefix).components() {
        parent.push(component);
        append_dir(&mut ar, &parent, 0o755, options)?;
    }

    for (rel_path, full_path) in &entries {
        let meta = match full_path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping {rel_path}: metadata error: {e}");
                continue;
            }
        };
        let archive_path = Path::new(prefix).join(rel_path);
        let ft = meta.file_type();
        let mode = meta.permissions().mode() & 0o7777;

        if ft.is_file() {
            let mode = match options.permissions {
                PermissionPolicy::Preserve => mode,
                PermissionPolicy::Fixed { file_mode, .. } => file_mode,
            };
            append_file(&mut ar, &archive_path, full_path, mode, options)?;
        } else if ft.is_dir() {
            let mode = match options.permissions {
                PermissionPolicy::Preserve => mode,
                PermissionPolicy::Fixed { dir_mode, .. } => dir_mode,
            };
            append_dir(&mut ar, &archive_path, mode, options)?;
        } else if ft.is_symlink() {
            append_symlink(&mut ar, &archive_path, full_path, options)?;
        } else {
            warn!("skipping unsupported file type: {rel_path}");
        }
    }

    Ok(ar.into_inner()?)
}

/// Extract a layer archive into a directory.
pub fn unpack_layer(tar_data: &[u8], target_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target_dir)?;
    let mut ar = tar::Archive::new(tar_data);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.unpack(target_dir)?;
    Ok(())
}

fn collect_entries(root: &Path, current: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut result = Vec::new();
    if !current.exists() {
        return Ok(result);
    }
    for entry in fs::read_dir(current)? {
        let full = entry?.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(std::io::Error::other(format!("path strip: {e}"))))?
            .to_string_lossy()
            .to_string();

        if full.symlink_metadata()?.is_dir() {
            result.push((rel, full.clone()));
            result.extend(collect_entries(root, &full)?);
        } else {
            result.push((rel, full));
        }
    }
    Ok(result)
}

fn make_header(
    entry_type: tar::EntryType,
    mode: u32,
    options: &LayerOptions,
) -> Result<tar::Header, StoreError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_mode(mode);
    match &options.ownership {
        Ownership::Root => {
            header.set_uid(0);
            header.set_gid(0);
        }
        Ownership::Numeric { uid, gid } => {
            header.set_uid(*uid);
            header.set_gid(*gid);
        }
        Ownership::Named { user, group } => {
            header.set_uid(0);
            header.set_gid(0);
            header.set_username(user)?;
            header.set_groupname(group)?;
        }
    }
    Ok(header)
}

fn append_file(
    ar: &mut tar::Builder<Vec<u8>>,
    archive_path: &Path,
    full_path: &Path,
    mode: u32,
    options: &LayerOptions,
) -> Result<(), StoreError> {
    let data = fs::read(full_path)?;
    let mut header = make_header(tar::EntryType::Regular, mode, options)?;
    header.set_size(data.len() as u64);
    header.set_cksum();
    ar.append_data(&mut header, archive_path, data.as_slice())?;
    Ok(())
}

fn append_dir(
    ar: &mut tar::Builder<Vec<u8>>,
    archive_path: &Path,
    mode: u32,
    options: &LayerOptions,
) -> Result<(), StoreError> {
    let mut header = make_header(tar::EntryType::Directory, mode, options)?;
    header.set_size(0);
    header.set_cksum();
    let path = format!("{}/", archive_path.to_string_lossy().trim_end_matches('/'));
    ar.append_data(&mut header, &path, &[] as &[u8])?;
    Ok(())
}

fn append_symlink(
    ar: &mut tar::Builder<Vec<u8>>,
    archive_path: &Path,
    full_path: &Path,
    options: &LayerOptions,
) -> Result<(), StoreError> {
    let target = fs::read_link(full_path)?;
    let mut header = make_header(tar::EntryType::Symlink, 0o777, options)?;
    header.set_size(0);
    header.set_cksum();
    ar.append_link(&mut header, archive_path, &target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(dir: &Path) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/tool"), "#!/bin/sh\necho hi\n").unwrap();
        fs::set_permissions(dir.join("bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.join("README"), "readme").unwrap();
        fs::set_permissions(dir.join("README"), fs::Permissions::from_mode(0o600)).unwrap();
        std::os::unix::fs::symlink("bin/tool", dir.join("tool")).unwrap();
    }

    fn entries(data: &[u8]) -> Vec<(String, u64, u64, u32)> {
        let mut ar = tar::Archive::new(data);
        ar.entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let h = e.header();
                (
                    e.path().unwrap().to_string_lossy().to_string(),
                    h.uid().unwrap(),
                    h.gid().unwrap(),
                    h.mode().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn pack_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let a = pack_layer(dir.path(), &LayerOptions::default()).unwrap();
        let b = pack_layer(dir.path(), &LayerOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let src = tempfile::tempdir().unwrap();
        fixture(src.path());
        let data = pack_layer(src.path(), &LayerOptions::default()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack_layer(&data, dst.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dst.path().join("bin/tool")).unwrap(),
            "#!/bin/sh\necho hi\n"
        );
        assert_eq!(
            fs::read_link(dst.path().join("tool")).unwrap(),
            PathBuf::from("bin/tool")
        );
    }

    #[test]
    fn destination_prefixes_entries() {
        let src = tempfile::tempdir().unwrap();
        fixture(src.path());
        let options = LayerOptions {
            destination: "/opt/app".to_owned(),
            ..LayerOptions::default()
        };
        let data = pack_layer(src.path(), &options).unwrap();
        let paths: Vec<String> = entries(&data).into_iter().map(|e| e.0).collect();
        assert_eq!(paths[0], "opt/");
        assert_eq!(paths[1], "opt/app/");
        assert!(paths.contains(&"opt/app/README".to_owned()));
    }

    #[test]
    fn ownership_override_applies_to_every_entry() {
        let src = tempfile::tempdir().unwrap();
        fixture(src.path());
        let options = LayerOptions {
            ownership: Ownership::Numeric { uid: 1000, gid: 100 },
            ..LayerOptions::default()
        };
        let data = pack_layer(src.path(), &options).unwrap();
        for (path, uid, gid, _) in entries(&data) {
            assert_eq!((uid, gid), (1000, 100), "{path}");
        }
    }

    #[test]
    fn fixed_permissions_override_source_modes() {
        let src = tempfile::tempdir().unwrap();
        fixture(src.path());
        let options = LayerOptions {
            permissions: PermissionPolicy::Fixed {
                file_mode: 0o644,
                dir_mode: 0o750,
            },
            ..LayerOptions::default()
        };
        let data = pack_layer(src.path(), &options).unwrap();
        for (path, _, _, mode) in entries(&data) {
            match path.as_str() {
                "README" | "bin/tool" => assert_eq!(mode & 0o7777, 0o644, "{path}"),
                "bin/" => assert_eq!(mode & 0o7777, 0o750, "{path}"),
                _ => {}
            }
        }
    }

    #[test]
    fn preserve_keeps_source_modes() {
        let src = tempfile::tempdir().unwrap();
        fixture(src.path());
        let data = pack_layer(src.path(), &LayerOptions::default()).unwrap();
        let readme = entries(&data)
            .into_iter()
            .find(|e| e.0 == "README")
            .unwrap();
        assert_eq!(readme.3 & 0o7777, 0o600);
    }

    #[test]
    fn ownership_parsing() {
        assert_eq!(Ownership::parse(None).unwrap(), Ownership::Root);
        assert_eq!(
            Ownership::parse(Some("1000")).unwrap(),
            Ownership::Numeric { uid: 1000, gid: 1000 }
        );
        assert_eq!(
            Ownership::parse(Some("app:staff")).unwrap(),
            Ownership::Named {
                user: "app".to_owned(),
                group: "staff".to_owned()
            }
        );
        assert!(Ownership::parse(Some("1000:staff")).is_err());
        assert!(Ownership::parse(Some(":1")).is_err());
    }
}
