use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{self, Cache};
use crate::client::{
    MR_SCAN_XSI_TYPE, MR_SESSION_XSI_TYPE, XResource, XnatClient, XnatHttpClient,
};
use crate::config::XnatConfig;
use crate::connection::{ConnectionGuard, ConnectionScope};
use crate::dicom;
use crate::domain::{
    Checksums, DataEntry, DataRow, DataTree, Datatype, DERIVATIVE_MARKER, EntryAttrs, FieldType,
    FileSet, Frequency, Provenance, RowAddress,
};
use crate::error::XnatError;
use crate::fs_util;
use crate::paths::{label_to_path, path_to_label};
use crate::resolve::{self, RemoteRow};
use crate::uri;

pub const PROVENANCE_RESOURCE: &str = "__provenance__";
pub const FIELD_PROVENANCE_PREFIX: &str = "__field__";
pub const METADATA_RESOURCE: &str = "__metadata__";

const DICOM_RESOURCE_LABELS: &[&str] = &["DICOM", "secondary"];

/// Operations a dataset needs from the repository it is stored in.
pub trait DataStore {
    /// Opens (or joins) a session; it stays open until the guard is dropped.
    fn connect(&self) -> Result<ConnectionGuard<'_>, XnatError>;

    fn disconnect(&self, guard: ConnectionGuard<'_>) {
        drop(guard);
    }

    fn populate_tree(&self, tree: &mut DataTree) -> Result<(), XnatError>;
    fn populate_row(&self, row: &mut DataRow) -> Result<(), XnatError>;

    fn save_dataset_definition(
        &self,
        dataset_id: &str,
        definition: &Value,
        name: &str,
    ) -> Result<(), XnatError>;
    fn load_dataset_definition(
        &self,
        dataset_id: &str,
        name: &str,
    ) -> Result<Option<Value>, XnatError>;

    fn put_provenance(&self, entry: &DataEntry, provenance: &Provenance) -> Result<(), XnatError>;
    fn get_provenance(&self, entry: &DataEntry) -> Result<Provenance, XnatError>;

    /// Downloads the entry's resource into `download_dir` and returns the
    /// directory holding its files.
    fn download_files(
        &self,
        entry: &DataEntry,
        download_dir: &Path,
    ) -> Result<PathBuf, XnatError>;
    /// Pushes everything under `cache_path` to the entry's resource.
    fn upload_files(&self, cache_path: &Path, entry: &DataEntry) -> Result<(), XnatError>;

    fn get_fileset(&self, entry: &DataEntry) -> Result<FileSet, XnatError>;
    fn put_fileset(&self, fileset: &FileSet, entry: &DataEntry) -> Result<FileSet, XnatError>;
    fn post_fileset(
        &self,
        fileset: &FileSet,
        path: &str,
        datatype: Datatype,
        row: &mut DataRow,
    ) -> Result<DataEntry, XnatError>;

    fn get_field(&self, entry: &DataEntry) -> Result<String, XnatError>;
    fn put_field(&self, value: &str, entry: &DataEntry) -> Result<(), XnatError>;

    fn create_fileset_entry(
        &self,
        path: &str,
        datatype: Datatype,
        row: &mut DataRow,
    ) -> Result<DataEntry, XnatError>;
    fn create_field_entry(
        &self,
        path: &str,
        datatype: Datatype,
        row: &mut DataRow,
    ) -> Result<DataEntry, XnatError>;

    fn get_checksums(&self, uri: Option<&str>) -> Result<Checksums, XnatError>;
    fn calculate_checksums(&self, fileset: &FileSet) -> Result<Checksums, XnatError>;
}

/// Dataset store backed by the XNAT REST API.
pub struct Xnat<C> {
    client: C,
    config: XnatConfig,
    cache: Cache,
    scope: ConnectionScope,
}

struct ProvenanceLocation {
    resource: XResource,
    file_name: String,
    uri: String,
    cache_path: Utf8PathBuf,
}

impl Xnat<XnatHttpClient> {
    pub fn from_config(config: XnatConfig) -> Result<Self, XnatError> {
        let client =
            XnatHttpClient::new(&config.server, config.user.clone(), config.password.clone())?;
        Ok(Self::new(client, config))
    }
}

impl<C: XnatClient> Xnat<C> {
    pub fn new(client: C, config: XnatConfig) -> Self {
        let cache = Cache::new(config.cache_dir.clone());
        Self {
            client,
            config,
            cache,
            scope: ConnectionScope::new(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &XnatConfig {
        &self.config
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn cache_path(&self, dataset_id: &str, uri: &str) -> Result<Utf8PathBuf, XnatError> {
        self.cache.path_for(dataset_id, uri)
    }

    pub fn resolve_row(&self, row: &RowAddress) -> Result<RemoteRow, XnatError> {
        let _session = self.connect()?;
        resolve::resolve(&self.client, row)
    }

    /// Creates a project holding one MR session per `(subject, session)` leaf.
    pub fn create_data_tree(
        &self,
        dataset_id: &str,
        leaves: &[(String, String)],
    ) -> Result<DataTree, XnatError> {
        let _session = self.connect()?;
        self.client.create_project(dataset_id)?;
        let mut tree = DataTree::new(dataset_id);
        for (subject, session) in leaves {
            self.client.create_subject(dataset_id, subject)?;
            self.client
                .create_experiment(dataset_id, subject, session, MR_SESSION_XSI_TYPE)?;
            tree.add_leaf(&[subject, session])?;
        }
        info!(dataset = dataset_id, sessions = leaves.len(), "created data tree");
        Ok(tree)
    }

    /// The store's configuration with the credentials swapped for a freshly
    /// issued token, safe to hand to another process.
    pub fn serialize_config(&self) -> Result<XnatConfig, XnatError> {
        let _session = self.connect()?;
        let token = self.client.issue_token()?;
        let mut config = self.config.clone();
        config.user = Some(token.alias);
        config.password = Some(token.secret);
        Ok(config)
    }

    fn fetch_resource(
        &self,
        resource_uri: &str,
        download_dir: &Path,
    ) -> Result<PathBuf, XnatError> {
        fs::create_dir_all(download_dir).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let zip_path = download_dir.join("download.zip");
        self.client.download_zip(resource_uri, &zip_path)?;
        let expanded = download_dir.join("expanded");
        fs_util::extract_zip(&zip_path, &expanded)?;
        fs_util::find_dir_named(&expanded, "files")?.ok_or(XnatError::MissingFilesDir(expanded))
    }

    fn find_resource(&self, parent_uri: &str, label: &str) -> Result<Option<XResource>, XnatError> {
        Ok(self
            .client
            .resources(parent_uri)?
            .into_iter()
            .find(|resource| resource.label == label))
    }

    fn provenance_location(
        &self,
        entry: &DataEntry,
        create_resource: bool,
    ) -> Result<ProvenanceLocation, XnatError> {
        let remote = resolve::resolve(&self.client, &entry.row)?;
        let label = path_to_label(&entry.path);
        let file_name = if entry.is_field() {
            format!("{FIELD_PROVENANCE_PREFIX}{label}.json")
        } else {
            format!("{label}.json")
        };
        let resource = match self.find_resource(remote.uri(), PROVENANCE_RESOURCE)? {
            Some(resource) => resource,
            None if create_resource => {
                self.client
                    .create_resource(remote.uri(), PROVENANCE_RESOURCE, Some("PROVENANCE"))?
            }
            None => {
                return Err(XnatError::NotFound(format!(
                    "provenance resource of {}",
                    entry.row
                )));
            }
        };
        let uri = format!("{}/files/{file_name}", resolve::resource_uri(&resource));
        let cache_path = self.cache_path(&entry.row.dataset_id, &uri)?;
        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        }
        Ok(ProvenanceLocation {
            resource,
            file_name,
            uri,
            cache_path,
        })
    }

    fn fileset_at(datatype: Datatype, dir: &Utf8Path) -> Result<FileSet, XnatError> {
        let fspaths = if datatype.is_dir() {
            vec![dir.as_std_path().to_path_buf()]
        } else {
            fs_util::list_dir(dir.as_std_path())?
        };
        Ok(FileSet::new(datatype, fspaths))
    }
}

impl<C: XnatClient> DataStore for Xnat<C> {
    fn connect(&self) -> Result<ConnectionGuard<'_>, XnatError> {
        self.scope.enter(&self.client)
    }

    fn populate_tree(&self, tree: &mut DataTree) -> Result<(), XnatError> {
        let _session = self.connect()?;
        for experiment in self.client.experiments(tree.dataset_id())? {
            tree.add_leaf(&[experiment.subject_label, experiment.label])?;
        }
        Ok(())
    }

    fn populate_row(&self, row: &mut DataRow) -> Result<(), XnatError> {
        let _session = self.connect()?;
        let remote = resolve::resolve(&self.client, row.address())?;

        if let Some(experiment) = remote.session() {
            for scan in self.client.scans(&experiment.uri)? {
                for resource in self.client.resources(&scan.uri)? {
                    let uri = resolve::resource_uri(&resource);
                    let (datatype, item_metadata) =
                        if DICOM_RESOURCE_LABELS.contains(&resource.label.as_str()) {
                            (Datatype::DicomSet, dicom::dicom_header(&self.client, &uri)?)
                        } else {
                            (Datatype::FileSet, Default::default())
                        };
                    row.add_entry(
                        format!("{}/{}", scan.scan_type, resource.label),
                        datatype,
                        EntryAttrs {
                            uri: Some(uri),
                            item_metadata,
                            order: Some(scan.id.clone()),
                            quality: scan.quality.clone(),
                            ..EntryAttrs::default()
                        },
                    );
                }
            }
        }

        for name in self.client.fields(remote.uri())?.keys() {
            row.add_entry(
                label_to_path(name),
                Datatype::Field(FieldType::Text),
                EntryAttrs::default(),
            );
        }

        for resource in self.client.resources(remote.uri())? {
            if resource.label == PROVENANCE_RESOURCE || resource.label == METADATA_RESOURCE {
                continue;
            }
            let uri = resolve::resource_uri(&resource);
            let datatype = match resource.format.as_deref().map(Datatype::from_mime) {
                Some(Ok(datatype)) => datatype,
                Some(Err(err)) => {
                    debug!(resource = %uri, error = %err, "treating as generic file-set");
                    Datatype::FileSet
                }
                None => Datatype::FileSet,
            };
            let mut path = label_to_path(&resource.label);
            if !path.contains(DERIVATIVE_MARKER) {
                path.push(DERIVATIVE_MARKER);
            }
            let checksums = self.get_checksums(Some(&uri))?;
            row.add_entry(
                path,
                datatype,
                EntryAttrs {
                    uri: Some(uri),
                    checksums,
                    ..EntryAttrs::default()
                },
            );
        }
        debug!(row = %row.address(), entries = row.len(), "populated row");
        Ok(())
    }

    fn save_dataset_definition(
        &self,
        dataset_id: &str,
        definition: &Value,
        name: &str,
    ) -> Result<(), XnatError> {
        let _session = self.connect()?;
        let project = self.client.project(dataset_id)?;
        let resource = match self.find_resource(&project.uri, METADATA_RESOURCE)? {
            Some(resource) => resource,
            None => self
                .client
                .create_resource(&project.uri, METADATA_RESOURCE, Some("json"))?,
        };
        let staging = tempfile::Builder::new()
            .prefix("xnat-store-definition")
            .tempdir()
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let file_name = format!("{name}.json");
        let path = staging.path().join(&file_name);
        let content = serde_json::to_vec_pretty(definition)
            .map_err(|err| XnatError::Serialization(err.to_string()))?;
        fs::write(&path, content).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        self.client
            .upload_file(&resource.uri, &path, &file_name, true)?;
        info!(dataset = dataset_id, name, "saved dataset definition");
        Ok(())
    }

    fn load_dataset_definition(
        &self,
        dataset_id: &str,
        name: &str,
    ) -> Result<Option<Value>, XnatError> {
        let _session = self.connect()?;
        let project = self.client.project(dataset_id)?;
        let Some(resource) = self.find_resource(&project.uri, METADATA_RESOURCE)? else {
            return Ok(None);
        };
        let download_dir = tempfile::Builder::new()
            .prefix("xnat-store-definition")
            .tempdir()
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let files_dir = match self.fetch_resource(&resource.uri, download_dir.path()) {
            Ok(dir) => dir,
            Err(XnatError::MissingFilesDir(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let path = files_dir.join(format!("{name}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&path).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| XnatError::Serialization(err.to_string()))
    }

    fn put_provenance(&self, entry: &DataEntry, provenance: &Provenance) -> Result<(), XnatError> {
        let _session = self.connect()?;
        let location = self.provenance_location(entry, true)?;
        let content = serde_json::to_vec_pretty(provenance)
            .map_err(|err| XnatError::Serialization(err.to_string()))?;
        fs::write(location.cache_path.as_std_path(), content)
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        self.client.upload_file(
            &location.resource.uri,
            location.cache_path.as_std_path(),
            &location.file_name,
            true,
        )
    }

    fn get_provenance(&self, entry: &DataEntry) -> Result<Provenance, XnatError> {
        let _session = self.connect()?;
        let location = match self.provenance_location(entry, false) {
            Ok(location) => location,
            Err(XnatError::NotFound(_)) => return Ok(Provenance::new()),
            Err(err) => return Err(err),
        };
        match self
            .client
            .download_file(&location.uri, location.cache_path.as_std_path())
        {
            Ok(()) => {}
            Err(XnatError::NotFound(_)) => return Ok(Provenance::new()),
            Err(err) => return Err(err),
        }
        let content = fs::read_to_string(location.cache_path.as_std_path())
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        match serde_json::from_str(&content) {
            Ok(Value::Object(provenance)) => Ok(provenance),
            Ok(_) => Err(XnatError::Serialization(format!(
                "provenance of {entry} is not a JSON object"
            ))),
            Err(err) => Err(XnatError::Serialization(err.to_string())),
        }
    }

    fn download_files(
        &self,
        entry: &DataEntry,
        download_dir: &Path,
    ) -> Result<PathBuf, XnatError> {
        let uri = entry_uri(entry)?;
        let _session = self.connect()?;
        self.fetch_resource(uri, download_dir)
    }

    fn upload_files(&self, cache_path: &Path, entry: &DataEntry) -> Result<(), XnatError> {
        let uri = entry_uri(entry)?;
        let _session = self.connect()?;
        self.client
            .upload_dir(uri, cache_path, entry.is_derivative())
    }

    fn get_fileset(&self, entry: &DataEntry) -> Result<FileSet, XnatError> {
        let uri = entry_uri(entry)?;
        let _session = self.connect()?;
        let remote = self.get_checksums(Some(uri))?;
        let cache_dir = self.cache_path(&entry.row.dataset_id, uri)?;
        if Cache::is_fresh(&cache_dir, &remote)? {
            debug!(entry = %entry, path = %cache_dir, "using cached copy");
        } else {
            info!(entry = %entry, "getting file-set via API access");
            let staging = self.cache.staging_dir()?;
            let installed = self
                .download_files(entry, staging.path())
                .and_then(cache::utf8)
                .and_then(|data| Cache::install(&data, &cache_dir));
            if let Err(err) = installed {
                Cache::invalidate(&cache_dir)?;
                return Err(err);
            }
            Cache::write_record(&cache_dir, uri, &remote)?;
        }
        Self::fileset_at(entry.datatype, &cache_dir)
    }

    fn put_fileset(&self, fileset: &FileSet, entry: &DataEntry) -> Result<FileSet, XnatError> {
        let uri = entry_uri(entry)?;
        let cache_dir = self.cache_path(&entry.row.dataset_id, uri)?;
        let staging = self.cache.staging_dir()?;
        let staged = staging.path().join("files");
        if fileset.is_dir() {
            let source = fileset
                .fspath()
                .ok_or_else(|| XnatError::Usage(format!("empty file-set for {entry}")))?;
            fs_util::copy_dir_recursive(source, &staged)?;
        } else {
            fs_util::copy_into(&fileset.fspaths, &staged)?;
        }
        Cache::install(&cache::utf8(staged)?, &cache_dir)?;

        let _session = self.connect()?;
        info!(entry = %entry, "putting file-set via API access");
        self.upload_files(cache_dir.as_std_path(), entry)?;
        let cached = Self::fileset_at(fileset.datatype, &cache_dir)?;
        let checksums = self.calculate_checksums(&cached)?;
        Cache::write_record(&cache_dir, uri, &checksums)?;
        Ok(cached)
    }

    fn post_fileset(
        &self,
        fileset: &FileSet,
        path: &str,
        datatype: Datatype,
        row: &mut DataRow,
    ) -> Result<DataEntry, XnatError> {
        let _session = self.connect()?;
        let entry = self.create_fileset_entry(path, datatype, row)?;
        self.put_fileset(fileset, &entry)?;
        Ok(entry)
    }

    fn get_field(&self, entry: &DataEntry) -> Result<String, XnatError> {
        let _session = self.connect()?;
        let remote = resolve::resolve(&self.client, &entry.row)?;
        let label = path_to_label(&entry.path);
        self.client
            .fields(remote.uri())?
            .get(&label)
            .map(|value| value.replace("&quot;", "\""))
            .ok_or_else(|| XnatError::NotFound(format!("field {entry}")))
    }

    fn put_field(&self, value: &str, entry: &DataEntry) -> Result<(), XnatError> {
        let _session = self.connect()?;
        let remote = resolve::resolve(&self.client, &entry.row)?;
        let label = path_to_label(&entry.path);
        if !entry.is_derivative() && self.client.fields(remote.uri())?.contains_key(&label) {
            return Err(XnatError::Usage(format!(
                "refusing to overwrite non-derivative field {} in {}",
                entry.path,
                remote.label()
            )));
        }
        self.client
            .set_field(remote.uri(), remote.xsi_type(), &label, value)
    }

    fn create_fileset_entry(
        &self,
        path: &str,
        datatype: Datatype,
        row: &mut DataRow,
    ) -> Result<DataEntry, XnatError> {
        let derivative = DataEntry::path_is_derivative(path);
        if !derivative && row.frequency() != &Frequency::Session {
            return Err(XnatError::Usage(format!(
                "cannot create file-set entry for '{path}': non-derivative file-sets \
                 (paths without '@') are only allowed in session rows"
            )));
        }
        let _session = self.connect()?;
        let remote = resolve::resolve(&self.client, row.address())?;
        let resource = match remote.session() {
            Some(experiment) if !derivative => {
                let (scan_id, label) = match path.split('/').collect::<Vec<_>>().as_slice() {
                    [scan_id, label] if !scan_id.is_empty() && !label.is_empty() => {
                        (scan_id.to_string(), label.to_string())
                    }
                    _ => {
                        return Err(XnatError::Usage(format!(
                            "non-derivative entry path '{path}' must be <scan-id>/<resource-label>"
                        )));
                    }
                };
                let scan = self
                    .client
                    .create_scan(&experiment.uri, &scan_id, MR_SCAN_XSI_TYPE)?;
                self.client.create_resource(&scan.uri, &label, None)?
            }
            _ => self.client.create_resource(
                remote.uri(),
                &path_to_label(path),
                Some(datatype.mime_like()),
            )?,
        };
        let entry = row.add_entry(
            path,
            datatype,
            EntryAttrs::with_uri(resolve::resource_uri(&resource)),
        );
        Ok(entry.clone())
    }

    fn create_field_entry(
        &self,
        path: &str,
        datatype: Datatype,
        row: &mut DataRow,
    ) -> Result<DataEntry, XnatError> {
        if !datatype.is_field() {
            return Err(XnatError::Usage(format!(
                "{datatype} is not a field datatype"
            )));
        }
        Ok(row.add_entry(path, datatype, EntryAttrs::default()).clone())
    }

    fn get_checksums(&self, uri: Option<&str>) -> Result<Checksums, XnatError> {
        let uri = uri.ok_or_else(|| {
            XnatError::Usage("can't retrieve checksums as URI has not been set".to_string())
        })?;
        let _session = self.connect()?;
        self.client
            .files(uri)?
            .into_iter()
            .map(|file| Ok((uri::checksum_key(&file.uri)?, file.digest)))
            .collect()
    }

    fn calculate_checksums(&self, fileset: &FileSet) -> Result<Checksums, XnatError> {
        let root = fileset
            .checksum_root()
            .ok_or_else(|| XnatError::Usage("cannot checksum an empty file-set".to_string()))?;
        fileset.hash_files(root)
    }
}

pub(crate) fn entry_uri(entry: &DataEntry) -> Result<&str, XnatError> {
    entry
        .uri
        .as_deref()
        .ok_or_else(|| XnatError::Usage(format!("URI has not been set for {entry}")))
}
