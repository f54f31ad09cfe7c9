#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use xnat_store::client::{
    DicomDumpTag, IssuedToken, MR_SESSION_XSI_TYPE, RemoteFile, XExperiment, XProject, XResource,
    XScan, XSubject, XnatClient,
};
use xnat_store::config::XnatConfig;
use xnat_store::error::XnatError;
use xnat_store::fs_util;
use xnat_store::store::Xnat;

/// In-memory XNAT server. Objects are addressed by path-style URIs under
/// `/data/archive/projects/...`. Resources get numeric ids the way XNAT
/// assigns them, and answer to both `resources/<id>` and `resources/<label>`.
#[derive(Default)]
pub struct MockXnat {
    state: Mutex<MockState>,
    pub connects: Mutex<usize>,
    pub disconnects: Mutex<usize>,
    pub downloads: Mutex<usize>,
    pub uploads: Mutex<Vec<(String, bool)>>,
    pub dicom_requests: Mutex<Vec<String>>,
    pub corrupt_downloads: Mutex<bool>,
}

#[derive(Default)]
struct MockState {
    projects: Vec<String>,
    subjects: Vec<(String, String)>,
    experiments: Vec<(String, String, String)>,
    scans: BTreeMap<String, Vec<XScan>>,
    resources: BTreeMap<String, Vec<XResource>>,
    files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    fields: BTreeMap<String, BTreeMap<String, String>>,
    dicom: Vec<DicomDumpTag>,
    last_resource_id: usize,
}

impl MockState {
    /// Rewrites `.../resources/<id>[/...]` to the label form files are kept under.
    fn canonical(&self, uri: &str) -> String {
        for (parent, resources) in &self.resources {
            for resource in resources {
                let rest = match uri.strip_prefix(resource.uri.as_str()) {
                    Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
                    _ => continue,
                };
                return format!("{parent}/resources/{}{rest}", resource.label);
            }
        }
        uri.to_string()
    }

    /// The id-form URI of a resource given in label form.
    fn id_uri(&self, label_uri: &str) -> Option<String> {
        self.resources.iter().find_map(|(parent, resources)| {
            resources
                .iter()
                .find(|r| format!("{parent}/resources/{}", r.label) == label_uri)
                .map(|r| r.uri.clone())
        })
    }
}

pub fn project_uri(project: &str) -> String {
    format!("/data/archive/projects/{project}")
}

pub fn subject_uri(project: &str, subject: &str) -> String {
    format!("{}/subjects/{subject}", project_uri(project))
}

pub fn experiment_uri(project: &str, subject: &str, session: &str) -> String {
    format!("{}/experiments/{session}", subject_uri(project, subject))
}

impl MockXnat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, project: &str) -> String {
        let mut state = self.state.lock().unwrap();
        if !state.projects.iter().any(|p| p == project) {
            state.projects.push(project.to_string());
        }
        project_uri(project)
    }

    pub fn add_session(&self, project: &str, subject: &str, session: &str) -> String {
        self.add_project(project);
        let mut state = self.state.lock().unwrap();
        let subject_key = (project.to_string(), subject.to_string());
        if !state.subjects.contains(&subject_key) {
            state.subjects.push(subject_key);
        }
        let key = (project.to_string(), subject.to_string(), session.to_string());
        if !state.experiments.contains(&key) {
            state.experiments.push(key);
        }
        experiment_uri(project, subject, session)
    }

    pub fn add_scan(&self, experiment: &str, id: &str, scan_type: &str, quality: &str) -> String {
        let uri = format!("{experiment}/scans/{id}");
        let mut state = self.state.lock().unwrap();
        state.scans.entry(experiment.to_string()).or_default().push(XScan {
            id: id.to_string(),
            scan_type: scan_type.to_string(),
            quality: Some(quality.to_string()),
            uri: uri.clone(),
        });
        uri
    }

    pub fn add_resource(&self, parent: &str, label: &str, format: Option<&str>) -> String {
        let mut state = self.state.lock().unwrap();
        let resource = Self::insert_resource(&mut state, parent, label, format);
        format!("{parent}/resources/{}", resource.label)
    }

    /// Same resource as `add_resource`, addressed the way the server lists it.
    pub fn resource_id_uri(&self, parent: &str, label: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .resources
            .get(parent)?
            .iter()
            .find(|r| r.label == label)
            .map(|r| r.uri.clone())
    }

    pub fn add_file(&self, resource: &str, name: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let key = state.canonical(resource);
        state
            .files
            .entry(key)
            .or_default()
            .insert(name.to_string(), content.to_vec());
    }

    pub fn add_field(&self, object: &str, name: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .fields
            .entry(object.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_dicom_tags(&self, tags: Vec<DicomDumpTag>) {
        self.state.lock().unwrap().dicom = tags;
    }

    pub fn file(&self, resource: &str, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.files.get(&state.canonical(resource))?.get(name).cloned()
    }

    pub fn file_names(&self, resource: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&state.canonical(resource))
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn resource_labels(&self, parent: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .resources
            .get(parent)
            .map(|resources| resources.iter().map(|r| r.label.clone()).collect())
            .unwrap_or_default()
    }

    pub fn field(&self, object: &str, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.fields.get(object)?.get(name).cloned()
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }

    pub fn disconnects(&self) -> usize {
        *self.disconnects.lock().unwrap()
    }

    pub fn downloads(&self) -> usize {
        *self.downloads.lock().unwrap()
    }

    pub fn corrupt_downloads(&self, corrupt: bool) {
        *self.corrupt_downloads.lock().unwrap() = corrupt;
    }

    fn insert_resource(
        state: &mut MockState,
        parent: &str,
        label: &str,
        format: Option<&str>,
    ) -> XResource {
        let existing = state
            .resources
            .get(parent)
            .and_then(|resources| resources.iter().find(|r| r.label == label));
        if let Some(existing) = existing {
            return existing.clone();
        }
        state.last_resource_id += 1;
        let id = (1000 + state.last_resource_id).to_string();
        let resource = XResource {
            uri: format!("{parent}/resources/{id}"),
            id,
            label: label.to_string(),
            format: format.map(str::to_string),
        };
        state
            .resources
            .entry(parent.to_string())
            .or_default()
            .push(resource.clone());
        resource
    }

    fn not_found(what: &str) -> XnatError {
        XnatError::NotFound(what.to_string())
    }

    fn store_file(
        &self,
        resource_uri: &str,
        name: &str,
        content: Vec<u8>,
        overwrite: bool,
    ) -> Result<(), XnatError> {
        let mut state = self.state.lock().unwrap();
        let key = state.canonical(resource_uri);
        let files = state.files.entry(key).or_default();
        if files.contains_key(name) && !overwrite {
            return Err(XnatError::XnatStatus {
                status: 409,
                message: format!("{name} already exists"),
            });
        }
        files.insert(name.to_string(), content);
        Ok(())
    }
}

impl XnatClient for MockXnat {
    fn connect(&self) -> Result<(), XnatError> {
        *self.connects.lock().unwrap() += 1;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), XnatError> {
        *self.disconnects.lock().unwrap() += 1;
        Ok(())
    }

    fn project(&self, project_id: &str) -> Result<XProject, XnatError> {
        let state = self.state.lock().unwrap();
        if !state.projects.iter().any(|p| p == project_id) {
            return Err(Self::not_found(project_id));
        }
        Ok(XProject {
            id: project_id.to_string(),
            uri: project_uri(project_id),
        })
    }

    fn create_project(&self, project_id: &str) -> Result<XProject, XnatError> {
        self.add_project(project_id);
        self.project(project_id)
    }

    fn subject(&self, project_id: &str, label: &str) -> Result<XSubject, XnatError> {
        let state = self.state.lock().unwrap();
        if !state
            .subjects
            .contains(&(project_id.to_string(), label.to_string()))
        {
            return Err(Self::not_found(label));
        }
        Ok(XSubject {
            id: label.to_string(),
            label: label.to_string(),
            uri: subject_uri(project_id, label),
        })
    }

    fn create_subject(&self, project_id: &str, label: &str) -> Result<XSubject, XnatError> {
        {
            let mut state = self.state.lock().unwrap();
            let key = (project_id.to_string(), label.to_string());
            if !state.subjects.contains(&key) {
                state.subjects.push(key);
            }
        }
        self.subject(project_id, label)
    }

    fn experiments(&self, project_id: &str) -> Result<Vec<XExperiment>, XnatError> {
        let state = self.state.lock().unwrap();
        if !state.projects.iter().any(|p| p == project_id) {
            return Err(Self::not_found(project_id));
        }
        Ok(state
            .experiments
            .iter()
            .filter(|(project, _, _)| project == project_id)
            .map(|(project, subject, session)| XExperiment {
                id: session.clone(),
                label: session.clone(),
                subject_label: subject.clone(),
                xsi_type: MR_SESSION_XSI_TYPE.to_string(),
                uri: experiment_uri(project, subject, session),
            })
            .collect())
    }

    fn experiment(&self, project_id: &str, label: &str) -> Result<XExperiment, XnatError> {
        self.experiments(project_id)?
            .into_iter()
            .find(|experiment| experiment.label == label)
            .ok_or_else(|| Self::not_found(label))
    }

    fn create_experiment(
        &self,
        project_id: &str,
        subject_label: &str,
        label: &str,
        _xsi_type: &str,
    ) -> Result<XExperiment, XnatError> {
        self.add_session(project_id, subject_label, label);
        self.experiment(project_id, label)
    }

    fn scans(&self, experiment_uri: &str) -> Result<Vec<XScan>, XnatError> {
        let state = self.state.lock().unwrap();
        Ok(state.scans.get(experiment_uri).cloned().unwrap_or_default())
    }

    fn create_scan(
        &self,
        experiment_uri: &str,
        scan_id: &str,
        _xsi_type: &str,
    ) -> Result<XScan, XnatError> {
        if let Some(scan) = self
            .scans(experiment_uri)?
            .into_iter()
            .find(|scan| scan.id == scan_id)
        {
            return Ok(scan);
        }
        let uri = format!("{experiment_uri}/scans/{scan_id}");
        let scan = XScan {
            id: scan_id.to_string(),
            scan_type: scan_id.to_string(),
            quality: None,
            uri,
        };
        let mut state = self.state.lock().unwrap();
        state
            .scans
            .entry(experiment_uri.to_string())
            .or_default()
            .push(scan.clone());
        Ok(scan)
    }

    fn resources(&self, parent_uri: &str) -> Result<Vec<XResource>, XnatError> {
        let state = self.state.lock().unwrap();
        Ok(state.resources.get(parent_uri).cloned().unwrap_or_default())
    }

    fn create_resource(
        &self,
        parent_uri: &str,
        label: &str,
        format: Option<&str>,
    ) -> Result<XResource, XnatError> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::insert_resource(&mut state, parent_uri, label, format))
    }

    fn fields(&self, object_uri: &str) -> Result<BTreeMap<String, String>, XnatError> {
        let state = self.state.lock().unwrap();
        Ok(state.fields.get(object_uri).cloned().unwrap_or_default())
    }

    fn set_field(
        &self,
        object_uri: &str,
        _xsi_type: &str,
        name: &str,
        value: &str,
    ) -> Result<(), XnatError> {
        self.add_field(object_uri, name, value);
        Ok(())
    }

    fn files(&self, resource_uri: &str) -> Result<Vec<RemoteFile>, XnatError> {
        let state = self.state.lock().unwrap();
        let key = state.canonical(resource_uri);
        let listed_as = state
            .id_uri(&key)
            .ok_or_else(|| Self::not_found(resource_uri))?;
        let Some(files) = state.files.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(files
            .iter()
            .map(|(name, content)| RemoteFile {
                uri: format!("{listed_as}/files/{name}"),
                digest: format!("{:x}", md5::compute(content)),
            })
            .collect())
    }

    fn download_zip(&self, resource_uri: &str, destination: &Path) -> Result<(), XnatError> {
        *self.downloads.lock().unwrap() += 1;
        if *self.corrupt_downloads.lock().unwrap() {
            fs::write(destination, b"<html>502 Bad Gateway</html>").unwrap();
            return Ok(());
        }
        let state = self.state.lock().unwrap();
        let key = state.canonical(resource_uri);
        let files = state
            .files
            .get(&key)
            .ok_or_else(|| Self::not_found(resource_uri))?;
        let label = key.rsplit('/').next().unwrap();
        let mut writer = ZipWriter::new(fs::File::create(destination).unwrap());
        for (name, content) in files {
            writer
                .start_file(
                    format!("SESSION/resources/{label}/files/{name}"),
                    SimpleFileOptions::default(),
                )
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        Ok(())
    }

    fn download_file(&self, file_uri: &str, destination: &Path) -> Result<(), XnatError> {
        let (resource, name) = file_uri
            .split_once("/files/")
            .ok_or_else(|| Self::not_found(file_uri))?;
        let content = self
            .file(resource, name)
            .ok_or_else(|| Self::not_found(file_uri))?;
        fs::write(destination, content).unwrap();
        Ok(())
    }

    fn upload_file(
        &self,
        resource_uri: &str,
        source: &Path,
        name: &str,
        overwrite: bool,
    ) -> Result<(), XnatError> {
        self.uploads
            .lock()
            .unwrap()
            .push((resource_uri.to_string(), overwrite));
        let content = fs::read(source).unwrap();
        self.store_file(resource_uri, name, content, overwrite)
    }

    fn upload_dir(
        &self,
        resource_uri: &str,
        source_dir: &Path,
        overwrite: bool,
    ) -> Result<(), XnatError> {
        self.uploads
            .lock()
            .unwrap()
            .push((resource_uri.to_string(), overwrite));
        for path in fs_util::list_files(source_dir)? {
            let name = fs_util::relative_key(&path, source_dir)?;
            let content = fs::read(&path).unwrap();
            self.store_file(resource_uri, &name, content, overwrite)?;
        }
        Ok(())
    }

    fn dicom_dump(&self, src: &str) -> Result<Vec<DicomDumpTag>, XnatError> {
        self.dicom_requests.lock().unwrap().push(src.to_string());
        Ok(self.state.lock().unwrap().dicom.clone())
    }

    fn issue_token(&self) -> Result<IssuedToken, XnatError> {
        Ok(IssuedToken {
            alias: "alias-0001".to_string(),
            secret: "secret-0001".to_string(),
        })
    }
}

pub fn test_config(cache_dir: &Path) -> XnatConfig {
    XnatConfig {
        server: "https://xnat.example.org".to_string(),
        user: Some("admin".to_string()),
        password: Some("admin".to_string()),
        cache_dir: Utf8PathBuf::from_path_buf(cache_dir.to_path_buf()).unwrap(),
        race_condition_delay_secs: 30,
    }
}

pub fn store_with(mock: MockXnat, cache_dir: &Path) -> Xnat<MockXnat> {
    Xnat::new(mock, test_config(cache_dir))
}

/// Two subjects, three MR sessions; S01_MR1 has a T1w scan with DICOM and
/// NIFTI resources plus a derivative resource and a field.
pub fn sample_project() -> MockXnat {
    let mock = MockXnat::new();
    let mr1 = mock.add_session("PROJ", "S01", "S01_MR1");
    mock.add_session("PROJ", "S01", "S01_MR2");
    mock.add_session("PROJ", "S02", "S02_MR1");

    let scan = mock.add_scan(&mr1, "1", "T1w", "usable");
    let dicom = mock.add_resource(&scan, "DICOM", Some("DICOM"));
    mock.add_file(&dicom, "1.dcm", b"dicom-1");
    mock.add_file(&dicom, "2.dcm", b"dicom-2");
    mock.add_file(&dicom, "scan_catalog.xml", b"<catalog/>");
    let nifti = mock.add_resource(&scan, "NIFTI", Some("NIFTI"));
    mock.add_file(&nifti, "t1w.nii.gz", b"nifti");

    let mask = mock.add_resource(&mr1, "brain_mask__at__", Some("medimage/nifti-gz"));
    mock.add_file(&mask, "mask.nii.gz", b"mask-data");
    mock.add_file(&mask, "sub/extra.txt", b"extra");
    mock.add_field(&mr1, "age", "42");
    mock
}

pub fn write_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}
