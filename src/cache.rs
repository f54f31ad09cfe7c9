use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tempfile::{Builder, TempDir};
use tracing::debug;

use crate::domain::Checksums;
use crate::error::XnatError;
use crate::fs_util;
use crate::uri;

/// Local mirror of downloaded resources, laid out as
/// `<root>/projects/<dataset-id>/...` after the remote URI.
#[derive(Debug, Clone)]
pub struct Cache {
    root: Utf8PathBuf,
}

/// Sidecar written next to every cached resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub uri: String,
    pub checksums: Checksums,
    pub cached_at: String,
}

impl Cache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn default_root() -> Result<Utf8PathBuf, XnatError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("xnat-store")).ok()
            })
            .ok_or_else(|| XnatError::Filesystem("unable to resolve cache directory".to_string()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), XnatError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| XnatError::Filesystem(err.to_string()))
    }

    pub fn path_for(&self, dataset_id: &str, uri: &str) -> Result<Utf8PathBuf, XnatError> {
        let relative = uri::cache_relative(dataset_id, uri)?;
        Ok(self.root.join(relative))
    }

    pub fn record_path(resource_dir: &Utf8Path) -> Utf8PathBuf {
        let name = resource_dir.file_name().unwrap_or("resource");
        resource_dir.with_file_name(format!("{name}.checksums.json"))
    }

    /// Temporary directory on the same filesystem as the cache so finished
    /// downloads can be renamed into place.
    pub fn staging_dir(&self) -> Result<TempDir, XnatError> {
        self.ensure_root()?;
        Builder::new()
            .prefix(".xnat-store-staging")
            .tempdir_in(self.root.as_std_path())
            .map_err(|err| XnatError::Filesystem(err.to_string()))
    }

    pub fn read_record(resource_dir: &Utf8Path) -> Result<Option<ChecksumRecord>, XnatError> {
        let path = Self::record_path(resource_dir);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                debug!(path = %path, error = %err, "ignoring unreadable checksum record");
                Ok(None)
            }
        }
    }

    pub fn write_record(
        resource_dir: &Utf8Path,
        uri: &str,
        checksums: &Checksums,
    ) -> Result<(), XnatError> {
        let record = ChecksumRecord {
            uri: uri.to_string(),
            checksums: checksums.clone(),
            cached_at: Utc::now().to_rfc3339(),
        };
        let path = Self::record_path(resource_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(&record)
            .map_err(|err| XnatError::Serialization(err.to_string()))?;
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// A cached resource is usable only while its recorded checksums equal
    /// the ones the server reports now.
    pub fn is_fresh(resource_dir: &Utf8Path, remote: &Checksums) -> Result<bool, XnatError> {
        if !resource_dir.as_std_path().is_dir() {
            return Ok(false);
        }
        Ok(Self::read_record(resource_dir)?
            .is_some_and(|record| &record.checksums == remote))
    }

    /// Moves `from` into the cache at `resource_dir`, dropping the old copy.
    pub fn install(from: &Utf8Path, resource_dir: &Utf8Path) -> Result<(), XnatError> {
        fs_util::remove_file_if_exists(Self::record_path(resource_dir).as_std_path())?;
        fs_util::replace_dir(from.as_std_path(), resource_dir.as_std_path())
    }

    pub fn invalidate(resource_dir: &Utf8Path) -> Result<(), XnatError> {
        fs_util::remove_file_if_exists(Self::record_path(resource_dir).as_std_path())?;
        fs_util::remove_dir_if_exists(resource_dir.as_std_path())
    }
}

pub fn utf8(path: std::path::PathBuf) -> Result<Utf8PathBuf, XnatError> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|path| XnatError::Filesystem(format!("non-utf8 path {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let cache = Cache::new("/tmp/cache");
        let path = cache
            .path_for("PROJ", "/data/experiments/E1/scans/1/resources/DICOM")
            .unwrap();
        assert!(path.ends_with("projects/PROJ/experiments/E1/scans/1/resources/DICOM"));
        assert_eq!(
            Cache::record_path(&path).file_name(),
            Some("DICOM.checksums.json")
        );
    }

    #[test]
    fn records_decide_freshness() {
        let temp = tempfile::tempdir().unwrap();
        let root = utf8(temp.path().to_path_buf()).unwrap();
        let dir = root.join("projects/PROJ/resources/brain__at__");
        fs::create_dir_all(dir.as_std_path()).unwrap();

        let mut checksums = Checksums::new();
        checksums.insert("mask.nii".to_string(), "abc".to_string());
        assert!(!Cache::is_fresh(&dir, &checksums).unwrap());

        Cache::write_record(&dir, "/data/projects/PROJ/resources/brain__at__", &checksums)
            .unwrap();
        assert!(Cache::is_fresh(&dir, &checksums).unwrap());

        checksums.insert("mask.nii".to_string(), "def".to_string());
        assert!(!Cache::is_fresh(&dir, &checksums).unwrap());

        Cache::invalidate(&dir).unwrap();
        assert!(!dir.as_std_path().exists());
        assert!(!Cache::record_path(&dir).as_std_path().exists());
    }
}
