//! Image-file CRUD for the management RPC surface (spec.md section 4.13):
//! CREATE_IMAGE, DELETE_IMAGE, RENAME_IMAGE, COPY_IMAGE, PROTECT_IMAGE,
//! UNPROTECT_IMAGE, and the folder listing behind IMAGE_FILE_INFO. Mirrors
//! `CommandImageSupport`, folded into free functions over a `PropertyMap`-
//! derived `image_folder`/`scan_depth` pair rather than kept as a
//! process-wide singleton (spec.md section 9's singleton note).

use crate::factory::ReservationRegistry;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub name: PathBuf,
    pub size: u64,
    pub read_only: bool,
}

/// One error per operation, carrying enough to map onto a `PbErrorCode` and
/// localized message at the dispatcher layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    InvalidPath(String),
    AlreadyExists(PathBuf),
    NotFound(PathBuf),
    ReservedFile(PathBuf),
    Io(String),
    InvalidSize(u64),
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::InvalidPath(p) => write!(f, "invalid image path: {p}"),
            ImageError::AlreadyExists(p) => write!(f, "image file already exists: {}", p.display()),
            ImageError::NotFound(p) => write!(f, "image file not found: {}", p.display()),
            ImageError::ReservedFile(p) => write!(f, "image file is in use: {}", p.display()),
            ImageError::Io(e) => write!(f, "{e}"),
            ImageError::InvalidSize(s) => write!(f, "invalid image size: {s}"),
        }
    }
}

/// Resolves a (possibly relative) filename against `image_folder`, rejecting
/// any path that would escape it or exceed `scan_depth` directory levels.
pub fn resolve_path(image_folder: &Path, scan_depth: usize, filename: &str) -> Result<PathBuf, ImageError> {
    let candidate = Path::new(filename);
    if candidate.is_absolute() {
        return Err(ImageError::InvalidPath(filename.to_string()));
    }
    if candidate.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(ImageError::InvalidPath(filename.to_string()));
    }
    let depth = candidate.components().count().saturating_sub(1);
    if depth > scan_depth {
        return Err(ImageError::InvalidPath(filename.to_string()));
    }
    Ok(image_folder.join(candidate))
}

/// Lists regular files under `image_folder`, descending at most `scan_depth`
/// directory levels, for IMAGE_FILE_INFO / DEVICES_INFO's `detected` bit.
pub fn list_images(image_folder: &Path, scan_depth: usize) -> Vec<ImageFile> {
    let mut out = Vec::new();
    walk(image_folder, image_folder, scan_depth, &mut out);
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn walk(root: &Path, dir: &Path, remaining_depth: usize, out: &mut Vec<ImageFile>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else { continue };
        if metadata.is_dir() {
            if remaining_depth > 0 {
                walk(root, &path, remaining_depth - 1, out);
            }
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else { continue };
        out.push(ImageFile {
            name: relative.to_path_buf(),
            size: metadata.len(),
            read_only: metadata.permissions().readonly(),
        });
    }
}

/// CREATE_IMAGE: `size` must be a multiple of 512 and at least 512, per
/// spec.md section 4.13.
pub fn create_image(path: &Path, size: u64, read_only: bool) -> Result<(), ImageError> {
    if size < 512 || size % 512 != 0 {
        return Err(ImageError::InvalidSize(size));
    }
    if path.exists() {
        return Err(ImageError::AlreadyExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ImageError::Io(e.to_string()))?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| ImageError::Io(e.to_string()))?;
    file.set_len(size).map_err(|e| ImageError::Io(e.to_string()))?;

    let mut permissions = file.metadata().map_err(|e| ImageError::Io(e.to_string()))?.permissions();
    permissions.set_mode(if read_only { 0o444 } else { 0o644 });
    fs::set_permissions(path, permissions).map_err(|e| ImageError::Io(e.to_string()))?;
    Ok(())
}

fn reject_if_reserved(registry: &ReservationRegistry, path: &Path) -> Result<(), ImageError> {
    if registry.ids_for(path).is_some() {
        return Err(ImageError::ReservedFile(path.to_path_buf()));
    }
    Ok(())
}

pub fn delete_image(registry: &ReservationRegistry, path: &Path) -> Result<(), ImageError> {
    reject_if_reserved(registry, path)?;
    if !path.exists() {
        return Err(ImageError::NotFound(path.to_path_buf()));
    }
    fs::remove_file(path).map_err(|e| ImageError::Io(e.to_string()))
}

pub fn rename_image(registry: &ReservationRegistry, from: &Path, to: &Path) -> Result<(), ImageError> {
    reject_if_reserved(registry, from)?;
    if !from.exists() {
        return Err(ImageError::NotFound(from.to_path_buf()));
    }
    if to.exists() {
        return Err(ImageError::AlreadyExists(to.to_path_buf()));
    }
    fs::rename(from, to).map_err(|e| ImageError::Io(e.to_string()))
}

pub fn copy_image(registry: &ReservationRegistry, from: &Path, to: &Path) -> Result<(), ImageError> {
    let _ = registry;
    if !from.exists() {
        return Err(ImageError::NotFound(from.to_path_buf()));
    }
    if to.exists() {
        return Err(ImageError::AlreadyExists(to.to_path_buf()));
    }
    fs::copy(from, to).map_err(|e| ImageError::Io(e.to_string()))?;
    Ok(())
}

pub fn set_protected(path: &Path, protected: bool) -> Result<(), ImageError> {
    if !path.exists() {
        return Err(ImageError::NotFound(path.to_path_buf()));
    }
    let mut permissions = fs::metadata(path).map_err(|e| ImageError::Io(e.to_string()))?.permissions();
    permissions.set_mode(if protected { 0o444 } else { 0o644 });
    fs::set_permissions(path, permissions).map_err(|e| ImageError::Io(e.to_string()))
}

/// Writes the serialized property map to `/etc/s2p.conf` (or wherever the
/// caller points it), for PERSIST_CONFIGURATION (spec.md section 6.4).
pub fn persist_properties(path: &Path, properties: &crate::properties::PropertyMap) -> Result<(), ImageError> {
    properties.save(path).map_err(|e| ImageError::Io(e.to_string()))
}

/// Truncates-then-rewrites is avoided on purpose: `create_image` uses
/// `create_new` so a second CREATE_IMAGE for the same name always fails
/// instead of silently clobbering. This helper backs tests that need to
/// touch an existing file's length without going through CREATE_IMAGE.
#[cfg(test)]
pub fn resize_for_test(path: &Path, size: u64) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(0))?;
    file.set_len(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_image_rejects_bad_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.hda");
        assert_eq!(create_image(&path, 100, false), Err(ImageError::InvalidSize(100)));
    }

    #[test]
    fn create_image_rejects_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.hda");
        create_image(&path, 512, false).unwrap();
        assert!(matches!(create_image(&path, 512, false), Err(ImageError::AlreadyExists(_))));
    }

    #[test]
    fn delete_rejects_reserved_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.hda");
        create_image(&path, 512, false).unwrap();

        let registry = ReservationRegistry::new();
        registry.reserve(&path, 0, 0);
        assert!(matches!(delete_image(&registry, &path), Err(ImageError::ReservedFile(_))));

        registry.unreserve(&path);
        assert!(delete_image(&registry, &path).is_ok());
    }

    #[test]
    fn resolve_path_rejects_absolute_and_traversal() {
        let folder = Path::new("/images");
        assert!(resolve_path(folder, 1, "/etc/passwd").is_err());
        assert!(resolve_path(folder, 1, "../etc/passwd").is_err());
        assert!(resolve_path(folder, 1, "disk.hda").is_ok());
    }

    #[test]
    fn resolve_path_enforces_scan_depth() {
        let folder = Path::new("/images");
        assert!(resolve_path(folder, 0, "sub/disk.hda").is_err());
        assert!(resolve_path(folder, 1, "sub/disk.hda").is_ok());
    }

    #[test]
    fn protect_then_unprotect_toggles_readonly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.hda");
        create_image(&path, 512, false).unwrap();

        set_protected(&path, true).unwrap();
        assert!(fs::metadata(&path).unwrap().permissions().readonly());

        set_protected(&path, false).unwrap();
        assert!(!fs::metadata(&path).unwrap().permissions().readonly());
    }
}
