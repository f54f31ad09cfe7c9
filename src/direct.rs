use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{self, Cache};
use crate::client::{XnatClient, XnatHttpClient};
use crate::config::{ConfigLoader, MountConfig};
use crate::connection::ConnectionGuard;
use crate::domain::{
    Checksums, DataEntry, DataRow, DataTree, Datatype, EntryAttrs, FileSet, Frequency, Provenance,
    RowAddress,
};
use crate::error::XnatError;
use crate::fs_util;
use crate::paths::path_to_label;
use crate::resolve;
use crate::store::{DataStore, Xnat};
use crate::uri;

const CATALOG_SUFFIX: &str = "_catalog.xml";

/// Store used inside the XNAT container service. File-sets of the row being
/// processed are read straight from the archive mount and written to the
/// output mount; everything else goes through the REST API.
pub struct XnatViaCs<C> {
    inner: Xnat<C>,
    mounts: MountConfig,
}

impl XnatViaCs<XnatHttpClient> {
    pub fn from_env(row_frequency: Frequency, row_id: Option<String>) -> Result<Self, XnatError> {
        let (config, mounts) = ConfigLoader::from_env(row_frequency, row_id)?;
        debug!(server = %config.server, "XNAT (via container service) server found");
        Ok(Self::new(Xnat::from_config(config)?, mounts))
    }
}

impl<C: XnatClient> XnatViaCs<C> {
    pub fn new(inner: Xnat<C>, mounts: MountConfig) -> Self {
        Self { inner, mounts }
    }

    pub fn inner(&self) -> &Xnat<C> {
        &self.inner
    }

    pub fn mounts(&self) -> &MountConfig {
        &self.mounts
    }

    /// Directory on the input mount holding the row's archive, if the row is
    /// the one the container was launched for (or a session inside it).
    pub fn resolve_mount(&self, row: &RowAddress) -> Result<Utf8PathBuf, XnatError> {
        let mount_frequency = &self.mounts.row_frequency;
        debug!(
            row = %row,
            mount_frequency = %mount_frequency,
            mount_id = self.mounts.row_id.as_deref().unwrap_or("-"),
            "resolving archive mount"
        );
        if mount_frequency == &row.frequency {
            return Ok(self.mounts.input_mount.clone());
        }
        if mount_frequency == &Frequency::Dataset && row.frequency == Frequency::Session {
            if let Some(id) = row.id() {
                return Ok(self.mounts.input_mount.join(id));
            }
        }
        Err(XnatError::NoDirectMount {
            frequency: row.frequency.to_string(),
            mount_frequency: mount_frequency.to_string(),
        })
    }

    /// Where a derivative is written on the output mount.
    pub fn entry_path(&self, path: &str) -> Utf8PathBuf {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.mounts.output_mount.clone(), |dir, segment| dir.join(segment))
    }

    fn make_uri(row: &RowAddress) -> String {
        let mut uri = format!("/data/archive/projects/{}", row.dataset_id);
        let id = row.id().unwrap_or_default();
        match &row.frequency {
            Frequency::Dataset => {}
            Frequency::Session => uri.push_str(&format!("/experiments/{id}")),
            Frequency::Subject => uri.push_str(&format!("/subjects/{id}")),
            Frequency::Custom(_) => {
                uri.push_str(&format!("/subjects/{}", resolve::make_row_name(row)))
            }
        }
        uri
    }

    fn stage_links(
        &self,
        entry: &DataEntry,
        uri: &str,
        resource_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, XnatError> {
        let staging = self.inner.cache_path(&entry.row.dataset_id, uri)?;
        Cache::invalidate(&staging)?;
        fs::create_dir_all(staging.as_std_path())
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        for item in archive_items(resource_dir)? {
            let Some(name) = item.file_name() else {
                continue;
            };
            fs_util::link_file(item.as_std_path(), staging.join(name).as_std_path())?;
        }
        Ok(staging)
    }
}

fn archive_items(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, XnatError> {
    fs_util::list_dir(dir.as_std_path())?
        .into_iter()
        .map(cache::utf8)
        .filter(|item| {
            item.as_ref()
                .map(|item| !item.as_str().ends_with(CATALOG_SUFFIX))
                .unwrap_or(true)
        })
        .collect()
}

fn output_paths(datatype: Datatype, dir: Utf8PathBuf) -> Result<Vec<PathBuf>, XnatError> {
    if datatype.is_dir() {
        Ok(vec![dir.into_std_path_buf()])
    } else {
        fs_util::list_dir(dir.as_std_path())
    }
}

fn std_paths(paths: Vec<Utf8PathBuf>) -> Vec<PathBuf> {
    paths.into_iter().map(Utf8PathBuf::into_std_path_buf).collect()
}

impl<C: XnatClient> DataStore for XnatViaCs<C> {
    fn connect(&self) -> Result<ConnectionGuard<'_>, XnatError> {
        self.inner.connect()
    }

    fn populate_tree(&self, tree: &mut DataTree) -> Result<(), XnatError> {
        self.inner.populate_tree(tree)
    }

    fn populate_row(&self, row: &mut DataRow) -> Result<(), XnatError> {
        self.inner.populate_row(row)
    }

    fn save_dataset_definition(
        &self,
        dataset_id: &str,
        definition: &Value,
        name: &str,
    ) -> Result<(), XnatError> {
        self.inner
            .save_dataset_definition(dataset_id, definition, name)
    }

    fn load_dataset_definition(
        &self,
        dataset_id: &str,
        name: &str,
    ) -> Result<Option<Value>, XnatError> {
        self.inner.load_dataset_definition(dataset_id, name)
    }

    fn put_provenance(&self, entry: &DataEntry, provenance: &Provenance) -> Result<(), XnatError> {
        self.inner.put_provenance(entry, provenance)
    }

    fn get_provenance(&self, entry: &DataEntry) -> Result<Provenance, XnatError> {
        self.inner.get_provenance(entry)
    }

    fn download_files(
        &self,
        entry: &DataEntry,
        download_dir: &Path,
    ) -> Result<PathBuf, XnatError> {
        self.inner.download_files(entry, download_dir)
    }

    fn upload_files(&self, cache_path: &Path, entry: &DataEntry) -> Result<(), XnatError> {
        self.inner.upload_files(cache_path, entry)
    }

    fn get_fileset(&self, entry: &DataEntry) -> Result<FileSet, XnatError> {
        let mount = match self.resolve_mount(&entry.row) {
            Ok(mount) => mount,
            Err(XnatError::NoDirectMount { .. }) => {
                info!(entry = %entry, "no direct mount for row, getting file-set via API access");
                return self.inner.get_fileset(entry);
            }
            Err(err) => return Err(err),
        };
        info!(
            entry = %entry.path,
            row = %entry.row,
            "getting file-set via direct access to archive directory"
        );
        let written = self.entry_path(&entry.path);
        let fspaths = if written.as_std_path().exists() {
            debug!(entry = %entry, path = %written, "reading file-set from the output mount");
            output_paths(entry.datatype, written)?
        } else {
            match entry.uri.as_deref() {
                Some(uri) => {
                    let resource_dir = mount.join(uri::mount_relative(uri)?);
                    if entry.datatype.is_dir() {
                        vec![self.stage_links(entry, uri, &resource_dir)?.into_std_path_buf()]
                    } else {
                        std_paths(archive_items(&resource_dir)?)
                    }
                }
                None => {
                    debug!(
                        entry = %entry,
                        "no URI set, assuming a newly created derivative on the output mount"
                    );
                    output_paths(entry.datatype, written)?
                }
            }
        };
        Ok(FileSet::new(entry.datatype, fspaths))
    }

    fn put_fileset(&self, fileset: &FileSet, entry: &DataEntry) -> Result<FileSet, XnatError> {
        match self.resolve_mount(&entry.row) {
            Ok(_) => {}
            Err(XnatError::NoDirectMount { .. }) => {
                info!(entry = %entry, "no direct mount for row, putting file-set via API access");
                return self.inner.put_fileset(fileset, entry);
            }
            Err(err) => return Err(err),
        }
        let dest = self.entry_path(&entry.path);
        let parent = dest
            .parent()
            .ok_or_else(|| XnatError::Usage(format!("cannot write {entry} to the output mount")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let staging = tempfile::Builder::new()
            .prefix(".xnat-store-output")
            .tempdir_in(parent.as_std_path())
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let staged = staging.path().join("files");
        if fileset.is_dir() {
            let source = fileset
                .fspath()
                .ok_or_else(|| XnatError::Usage(format!("empty file-set for {entry}")))?;
            fs_util::copy_dir_recursive(source, &staged)?;
        } else {
            fs_util::copy_into(&fileset.fspaths, &staged)?;
        }
        fs_util::replace_dir(&staged, dest.as_std_path())?;
        info!(
            entry = %entry.path,
            row = %entry.row,
            "put file-set via direct access to archive directory"
        );
        let fspaths = output_paths(fileset.datatype, dest)?;
        Ok(FileSet::new(fileset.datatype, fspaths))
    }

    fn post_fileset(
        &self,
        fileset: &FileSet,
        path: &str,
        datatype: Datatype,
        row: &mut DataRow,
    ) -> Result<DataEntry, XnatError> {
        if let Err(XnatError::NoDirectMount { .. }) = self.resolve_mount(row.address()) {
            return self.inner.post_fileset(fileset, path, datatype, row);
        }
        let uri = format!(
            "{}/RESOURCES/{}",
            Self::make_uri(row.address()),
            path_to_label(path)
        );
        let entry = row
            .add_entry(path, datatype, EntryAttrs::with_uri(uri))
            .clone();
        self.put_fileset(fileset, &entry)?;
        Ok(entry)
    }

    fn get_field(&self, entry: &DataEntry) -> Result<String, XnatError> {
        self.inner.get_field(entry)
    }

    fn put_field(&self, value: &str, entry: &DataEntry) -> Result<(), XnatError> {
        self.inner.put_field(value, entry)
    }

    fn create_fileset_entry(
        &self,
        path: &str,
        datatype: Datatype,
        row: &mut DataRow,
    ) -> Result<DataEntry, XnatError> {
        self.inner.create_fileset_entry(path, datatype, row)
    }

    fn create_field_entry(
        &self,
        path: &str,
        datatype: Datatype,
        row: &mut DataRow,
    ) -> Result<DataEntry, XnatError> {
        self.inner.create_field_entry(path, datatype, row)
    }

    fn get_checksums(&self, uri: Option<&str>) -> Result<Checksums, XnatError> {
        self.inner.get_checksums(uri)
    }

    fn calculate_checksums(&self, fileset: &FileSet) -> Result<Checksums, XnatError> {
        self.inner.calculate_checksums(fileset)
    }
}
