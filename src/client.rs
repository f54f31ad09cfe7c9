use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::XnatError;
use crate::fs_util;

pub const PROJECT_XSI_TYPE: &str = "xnat:projectData";
pub const SUBJECT_XSI_TYPE: &str = "xnat:subjectData";
pub const MR_SESSION_XSI_TYPE: &str = "xnat:mrSessionData";
pub const MR_SCAN_XSI_TYPE: &str = "xnat:mrScanData";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XProject {
    pub id: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XSubject {
    pub id: String,
    pub label: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XExperiment {
    pub id: String,
    pub label: String,
    pub subject_label: String,
    pub xsi_type: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XScan {
    pub id: String,
    pub scan_type: String,
    pub quality: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XResource {
    pub id: String,
    pub label: String,
    pub format: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub uri: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DicomDumpTag {
    pub tag1: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub vr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuedToken {
    pub alias: String,
    pub secret: String,
}

/// Typed view of the parts of the XNAT REST API the store uses. Lookups of
/// missing objects fail with [`XnatError::NotFound`].
pub trait XnatClient: Send + Sync {
    fn connect(&self) -> Result<(), XnatError>;
    fn disconnect(&self) -> Result<(), XnatError>;

    fn project(&self, project_id: &str) -> Result<XProject, XnatError>;
    fn create_project(&self, project_id: &str) -> Result<XProject, XnatError>;
    fn subject(&self, project_id: &str, label: &str) -> Result<XSubject, XnatError>;
    /// Creates the subject unless it already exists, then returns it.
    fn create_subject(&self, project_id: &str, label: &str) -> Result<XSubject, XnatError>;
    fn experiments(&self, project_id: &str) -> Result<Vec<XExperiment>, XnatError>;
    fn experiment(&self, project_id: &str, label: &str) -> Result<XExperiment, XnatError>;
    fn create_experiment(
        &self,
        project_id: &str,
        subject_label: &str,
        label: &str,
        xsi_type: &str,
    ) -> Result<XExperiment, XnatError>;
    fn scans(&self, experiment_uri: &str) -> Result<Vec<XScan>, XnatError>;
    fn create_scan(
        &self,
        experiment_uri: &str,
        scan_id: &str,
        xsi_type: &str,
    ) -> Result<XScan, XnatError>;
    fn resources(&self, parent_uri: &str) -> Result<Vec<XResource>, XnatError>;
    fn create_resource(
        &self,
        parent_uri: &str,
        label: &str,
        format: Option<&str>,
    ) -> Result<XResource, XnatError>;
    fn fields(&self, object_uri: &str) -> Result<BTreeMap<String, String>, XnatError>;
    fn set_field(
        &self,
        object_uri: &str,
        xsi_type: &str,
        name: &str,
        value: &str,
    ) -> Result<(), XnatError>;

    fn files(&self, resource_uri: &str) -> Result<Vec<RemoteFile>, XnatError>;
    /// Writes the resource's files, zipped by the server, to `destination`.
    fn download_zip(&self, resource_uri: &str, destination: &Path) -> Result<(), XnatError>;
    fn download_file(&self, file_uri: &str, destination: &Path) -> Result<(), XnatError>;
    fn upload_file(
        &self,
        resource_uri: &str,
        source: &Path,
        name: &str,
        overwrite: bool,
    ) -> Result<(), XnatError>;
    fn upload_dir(
        &self,
        resource_uri: &str,
        source_dir: &Path,
        overwrite: bool,
    ) -> Result<(), XnatError>;

    fn dicom_dump(&self, src: &str) -> Result<Vec<DicomDumpTag>, XnatError>;
    fn issue_token(&self) -> Result<IssuedToken, XnatError>;
}

pub struct XnatHttpClient {
    client: Client,
    server: String,
    user: Option<String>,
    password: Option<String>,
    session: Mutex<Option<String>>,
}

impl XnatHttpClient {
    pub fn new(
        server: &str,
        user: Option<String>,
        password: Option<String>,
    ) -> Result<Self, XnatError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("xnat-store/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| XnatError::XnatHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| XnatError::XnatHttp(err.to_string()))?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            user,
            password,
            session: Mutex::new(None),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn session_id(&self) -> Option<String> {
        self.session
            .lock()
            .ok()
            .and_then(|session| session.as_ref().cloned())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.server, path);
        let request = self.client.request(method, url);
        if let Some(session) = self.session_id() {
            request.header(COOKIE, format!("JSESSIONID={session}"))
        } else if let Some(user) = &self.user {
            request.basic_auth(user, self.password.as_ref())
        } else {
            request
        }
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, XnatError> {
        let response = request
            .send()
            .map_err(|err| XnatError::XnatHttp(err.to_string()))?;
        Self::handle_status(response, what)
    }

    fn handle_status(response: Response, what: &str) -> Result<Response, XnatError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        if status == 404 {
            return Err(XnatError::NotFound(what.to_string()));
        }
        let message = response
            .text()
            .unwrap_or_else(|_| "XNAT request failed".to_string());
        Err(XnatError::XnatStatus { status, message })
    }

    fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<Value, XnatError> {
        let request = self
            .request(Method::GET, path)
            .query(&[("format", "json")])
            .query(query);
        self.send(request, what)?
            .json()
            .map_err(|err| XnatError::XnatResponse(err.to_string()))
    }

    fn put(&self, path: &str, query: &[(&str, &str)], what: &str) -> Result<(), XnatError> {
        self.send(self.request(Method::PUT, path).query(query), what)?;
        Ok(())
    }

    fn download_to(
        &self,
        request: RequestBuilder,
        destination: &Path,
        what: &str,
    ) -> Result<(), XnatError> {
        let mut response = self.send(request, what)?;
        let mut file =
            File::create(destination).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| XnatError::XnatHttp(format!("download {what}: {err}")))?;
        Ok(())
    }

    fn subjects(&self, project_id: &str) -> Result<Vec<XSubject>, XnatError> {
        let value = self.get_json(
            &format!("/data/projects/{project_id}/subjects"),
            &[("columns", "ID,label")],
            &format!("subjects of project {project_id}"),
        )?;
        parse_subjects(&value)
    }
}

impl XnatClient for XnatHttpClient {
    fn connect(&self) -> Result<(), XnatError> {
        let response = self.send(
            self.request(Method::POST, "/data/JSESSION"),
            "session endpoint",
        )?;
        let session = response
            .text()
            .map_err(|err| XnatError::XnatHttp(err.to_string()))?;
        let mut guard = self
            .session
            .lock()
            .map_err(|_| XnatError::XnatHttp("session lock poisoned".to_string()))?;
        *guard = Some(session.trim().to_string());
        debug!(server = %self.server, "opened XNAT session");
        Ok(())
    }

    fn disconnect(&self) -> Result<(), XnatError> {
        if self.session_id().is_none() {
            return Ok(());
        }
        let result = self.send(
            self.request(Method::DELETE, "/data/JSESSION"),
            "session endpoint",
        );
        if let Ok(mut guard) = self.session.lock() {
            *guard = None;
        }
        debug!(server = %self.server, "closed XNAT session");
        result.map(|_| ())
    }

    fn project(&self, project_id: &str) -> Result<XProject, XnatError> {
        let uri = format!("/data/projects/{project_id}");
        self.get_json(&uri, &[], &format!("project {project_id}"))?;
        Ok(XProject {
            id: project_id.to_string(),
            uri,
        })
    }

    fn create_project(&self, project_id: &str) -> Result<XProject, XnatError> {
        self.put(
            &format!("/data/archive/projects/{project_id}"),
            &[],
            &format!("project {project_id}"),
        )?;
        self.project(project_id)
    }

    fn subject(&self, project_id: &str, label: &str) -> Result<XSubject, XnatError> {
        self.subjects(project_id)?
            .into_iter()
            .find(|subject| subject.label == label || subject.id == label)
            .ok_or_else(|| {
                XnatError::NotFound(format!("subject {label} in project {project_id}"))
            })
    }

    fn create_subject(&self, project_id: &str, label: &str) -> Result<XSubject, XnatError> {
        match self.subject(project_id, label) {
            Err(XnatError::NotFound(_)) => {}
            other => return other,
        }
        self.put(
            &format!("/data/projects/{project_id}/subjects/{label}"),
            &[],
            &format!("subject {label}"),
        )?;
        self.subject(project_id, label)
    }

    fn experiments(&self, project_id: &str) -> Result<Vec<XExperiment>, XnatError> {
        let value = self.get_json(
            &format!("/data/projects/{project_id}/experiments"),
            &[("columns", "ID,label,subject_label,xsiType")],
            &format!("experiments of project {project_id}"),
        )?;
        parse_experiments(&value)
    }

    fn experiment(&self, project_id: &str, label: &str) -> Result<XExperiment, XnatError> {
        self.experiments(project_id)?
            .into_iter()
            .find(|experiment| experiment.label == label || experiment.id == label)
            .ok_or_else(|| {
                XnatError::NotFound(format!("experiment {label} in project {project_id}"))
            })
    }

    fn create_experiment(
        &self,
        project_id: &str,
        subject_label: &str,
        label: &str,
        xsi_type: &str,
    ) -> Result<XExperiment, XnatError> {
        self.put(
            &format!("/data/projects/{project_id}/subjects/{subject_label}/experiments/{label}"),
            &[("xsiType", xsi_type)],
            &format!("experiment {label}"),
        )?;
        self.experiment(project_id, label)
    }

    fn scans(&self, experiment_uri: &str) -> Result<Vec<XScan>, XnatError> {
        let value = self.get_json(
            &format!("{experiment_uri}/scans"),
            &[],
            &format!("scans of {experiment_uri}"),
        )?;
        parse_scans(&value, experiment_uri)
    }

    fn create_scan(
        &self,
        experiment_uri: &str,
        scan_id: &str,
        xsi_type: &str,
    ) -> Result<XScan, XnatError> {
        self.put(
            &format!("{experiment_uri}/scans/{scan_id}"),
            &[("xsiType", xsi_type)],
            &format!("scan {scan_id}"),
        )?;
        self.scans(experiment_uri)?
            .into_iter()
            .find(|scan| scan.id == scan_id)
            .ok_or_else(|| XnatError::NotFound(format!("scan {scan_id} in {experiment_uri}")))
    }

    fn resources(&self, parent_uri: &str) -> Result<Vec<XResource>, XnatError> {
        let value = self.get_json(
            &format!("{parent_uri}/resources"),
            &[],
            &format!("resources of {parent_uri}"),
        )?;
        parse_resources(&value, parent_uri)
    }

    fn create_resource(
        &self,
        parent_uri: &str,
        label: &str,
        format: Option<&str>,
    ) -> Result<XResource, XnatError> {
        let mut query = Vec::new();
        if let Some(format) = format {
            query.push(("format", format));
        }
        self.put(
            &format!("{parent_uri}/resources/{label}"),
            &query,
            &format!("resource {label}"),
        )?;
        self.resources(parent_uri)?
            .into_iter()
            .find(|resource| resource.label == label)
            .ok_or_else(|| XnatError::NotFound(format!("resource {label} in {parent_uri}")))
    }

    fn fields(&self, object_uri: &str) -> Result<BTreeMap<String, String>, XnatError> {
        let value = self.get_json(object_uri, &[], object_uri)?;
        Ok(parse_fields(&value))
    }

    fn set_field(
        &self,
        object_uri: &str,
        xsi_type: &str,
        name: &str,
        value: &str,
    ) -> Result<(), XnatError> {
        let key = format!("{xsi_type}/fields/field[name={name}]/field");
        self.put(object_uri, &[(key.as_str(), value)], &format!("field {name}"))
    }

    fn files(&self, resource_uri: &str) -> Result<Vec<RemoteFile>, XnatError> {
        let value = self.get_json(
            &format!("{resource_uri}/files"),
            &[],
            &format!("files of {resource_uri}"),
        )?;
        parse_files(&value)
    }

    fn download_zip(&self, resource_uri: &str, destination: &Path) -> Result<(), XnatError> {
        let request = self
            .request(Method::GET, &format!("{resource_uri}/files"))
            .query(&[("format", "zip")]);
        self.download_to(request, destination, resource_uri)
    }

    fn download_file(&self, file_uri: &str, destination: &Path) -> Result<(), XnatError> {
        self.download_to(self.request(Method::GET, file_uri), destination, file_uri)
    }

    fn upload_file(
        &self,
        resource_uri: &str,
        source: &Path,
        name: &str,
        overwrite: bool,
    ) -> Result<(), XnatError> {
        let file = File::open(source).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let request = self
            .request(Method::PUT, &format!("{resource_uri}/files/{name}"))
            .query(&[("inbody", "true"), ("overwrite", bool_param(overwrite))])
            .body(file);
        self.send(request, &format!("{resource_uri}/files/{name}"))?;
        Ok(())
    }

    fn upload_dir(
        &self,
        resource_uri: &str,
        source_dir: &Path,
        overwrite: bool,
    ) -> Result<(), XnatError> {
        let staging = tempfile::Builder::new()
            .prefix("xnat-store-upload")
            .tempdir()
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let zip_path = staging.path().join("upload.zip");
        fs_util::zip_dir(source_dir, &zip_path)?;
        let file = File::open(&zip_path).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let request = self
            .request(Method::PUT, &format!("{resource_uri}/files/upload.zip"))
            .query(&[
                ("inbody", "true"),
                ("extract", "true"),
                ("overwrite", bool_param(overwrite)),
            ])
            .header(CONTENT_TYPE, "application/zip")
            .body(file);
        self.send(request, resource_uri)?;
        Ok(())
    }

    fn dicom_dump(&self, src: &str) -> Result<Vec<DicomDumpTag>, XnatError> {
        let value = self.get_json(
            "/REST/services/dicomdump",
            &[("src", src)],
            &format!("DICOM header of {src}"),
        )?;
        result_rows(&value)?
            .iter()
            .map(|row| {
                serde_json::from_value(row.clone())
                    .map_err(|err| XnatError::XnatResponse(err.to_string()))
            })
            .collect()
    }

    fn issue_token(&self) -> Result<IssuedToken, XnatError> {
        self.send(
            self.request(Method::GET, "/data/services/tokens/issue"),
            "token service",
        )?
        .json()
        .map_err(|err| XnatError::XnatResponse(err.to_string()))
    }
}

fn bool_param(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

pub fn result_rows(value: &Value) -> Result<&Vec<Value>, XnatError> {
    value
        .get("ResultSet")
        .and_then(|value| value.get("Result"))
        .and_then(|value| value.as_array())
        .ok_or_else(|| XnatError::XnatResponse("missing ResultSet.Result".to_string()))
}

fn text(row: &Value, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn required(row: &Value, key: &str) -> Result<String, XnatError> {
    text(row, key).ok_or_else(|| XnatError::XnatResponse(format!("result row without {key}")))
}

pub fn parse_subjects(value: &Value) -> Result<Vec<XSubject>, XnatError> {
    result_rows(value)?
        .iter()
        .map(|row| {
            let id = required(row, "ID")?;
            Ok(XSubject {
                label: text(row, "label").unwrap_or_else(|| id.clone()),
                uri: text(row, "URI").unwrap_or_else(|| format!("/data/subjects/{id}")),
                id,
            })
        })
        .collect()
}

pub fn parse_experiments(value: &Value) -> Result<Vec<XExperiment>, XnatError> {
    result_rows(value)?
        .iter()
        .map(|row| {
            let id = required(row, "ID")?;
            Ok(XExperiment {
                label: text(row, "label").unwrap_or_else(|| id.clone()),
                subject_label: required(row, "subject_label")?,
                xsi_type: text(row, "xsiType")
                    .unwrap_or_else(|| MR_SESSION_XSI_TYPE.to_string()),
                uri: text(row, "URI").unwrap_or_else(|| format!("/data/experiments/{id}")),
                id,
            })
        })
        .collect()
}

pub fn parse_scans(value: &Value, experiment_uri: &str) -> Result<Vec<XScan>, XnatError> {
    result_rows(value)?
        .iter()
        .map(|row| {
            let id = required(row, "ID")?;
            Ok(XScan {
                scan_type: text(row, "type").unwrap_or_else(|| id.clone()),
                quality: text(row, "quality").filter(|quality| !quality.is_empty()),
                uri: format!("{experiment_uri}/scans/{id}"),
                id,
            })
        })
        .collect()
}

pub fn parse_resources(value: &Value, parent_uri: &str) -> Result<Vec<XResource>, XnatError> {
    result_rows(value)?
        .iter()
        .map(|row| {
            let id = required(row, "xnat_abstractresource_id")?;
            Ok(XResource {
                label: text(row, "label").unwrap_or_else(|| id.clone()),
                format: text(row, "format").filter(|format| !format.is_empty()),
                uri: format!("{parent_uri}/resources/{id}"),
                id,
            })
        })
        .collect()
}

pub fn parse_files(value: &Value) -> Result<Vec<RemoteFile>, XnatError> {
    result_rows(value)?
        .iter()
        .map(|row| {
            Ok(RemoteFile {
                uri: required(row, "URI")?,
                digest: text(row, "digest").unwrap_or_default(),
            })
        })
        .collect()
}

/// Pulls custom fields out of the `items[0].children` block XNAT returns for a
/// project, subject or experiment.
pub fn parse_fields(value: &Value) -> BTreeMap<String, String> {
    value
        .get("items")
        .and_then(|items| items.as_array())
        .and_then(|items| items.first())
        .and_then(|item| item.get("children"))
        .and_then(|children| children.as_array())
        .into_iter()
        .flatten()
        .filter(|child| child.get("field").and_then(|field| field.as_str()) == Some("fields/field"))
        .filter_map(|child| child.get("items").and_then(|items| items.as_array()))
        .flatten()
        .filter_map(|item| {
            let data = item.get("data_fields")?;
            let name = text(data, "name")?;
            let value = text(data, "field").unwrap_or_default();
            Some((name, value))
        })
        .collect()
}
