use std::collections::{BTreeMap, BTreeSet, btree_map};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::XnatError;
use crate::fs_util;

pub const DERIVATIVE_MARKER: char = '@';

pub type Checksums = BTreeMap<String, String>;

pub type Provenance = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Frequency {
    Dataset,
    Subject,
    Session,
    Custom(String),
}

impl Frequency {
    pub fn as_str(&self) -> &str {
        match self {
            Frequency::Dataset => "dataset",
            Frequency::Subject => "subject",
            Frequency::Session => "session",
            Frequency::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = XnatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        match normalized.as_str() {
            "" => Err(XnatError::Usage("empty row frequency".to_string())),
            "dataset" => Ok(Frequency::Dataset),
            "subject" => Ok(Frequency::Subject),
            "session" => Ok(Frequency::Session),
            other => {
                if !other
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
                {
                    return Err(XnatError::Usage(format!(
                        "invalid row frequency: {value}"
                    )));
                }
                Ok(Frequency::Custom(other.to_string()))
            }
        }
    }
}

impl TryFrom<String> for Frequency {
    type Error = XnatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Frequency> for String {
    fn from(value: Frequency) -> Self {
        value.as_str().to_string()
    }
}

/// Identity of a row: which dataset it belongs to, its frequency and its ids.
///
/// `ids` is the composite id of the row at its own frequency, `axes` carries the
/// id along every axis the row sits on (a session row knows its subject too).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowAddress {
    pub dataset_id: String,
    pub frequency: Frequency,
    ids: Vec<String>,
    axes: BTreeMap<String, String>,
}

impl RowAddress {
    pub fn dataset(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            frequency: Frequency::Dataset,
            ids: Vec::new(),
            axes: BTreeMap::new(),
        }
    }

    pub fn subject(dataset_id: impl Into<String>, subject: impl Into<String>) -> Self {
        let subject = subject.into();
        let mut axes = BTreeMap::new();
        axes.insert("subject".to_string(), subject.clone());
        Self {
            dataset_id: dataset_id.into(),
            frequency: Frequency::Subject,
            ids: vec![subject],
            axes,
        }
    }

    pub fn session(
        dataset_id: impl Into<String>,
        subject: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        let session = session.into();
        let mut axes = BTreeMap::new();
        axes.insert("subject".to_string(), subject.into());
        axes.insert("session".to_string(), session.clone());
        Self {
            dataset_id: dataset_id.into(),
            frequency: Frequency::Session,
            ids: vec![session],
            axes,
        }
    }

    pub fn custom(dataset_id: impl Into<String>, frequency: Frequency, ids: Vec<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            frequency,
            ids,
            axes: BTreeMap::new(),
        }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// The row's own id, i.e. the last component of its composite id.
    pub fn id(&self) -> Option<&str> {
        self.ids.last().map(String::as_str)
    }

    pub fn frequency_id(&self, axis: &str) -> Option<&str> {
        self.axes.get(axis).map(String::as_str)
    }
}

impl fmt::Display for RowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.frequency, self.ids.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Datatype {
    FileSet,
    Directory,
    DicomSet,
    Dicom,
    Nifti,
    NiftiGz,
    Json,
    Text,
    Field(FieldType),
}

impl Datatype {
    pub fn mime_like(&self) -> &'static str {
        match self {
            Datatype::FileSet => "generic/file-set",
            Datatype::Directory => "generic/directory",
            Datatype::DicomSet => "medimage/dicom-series",
            Datatype::Dicom => "application/dicom",
            Datatype::Nifti => "medimage/nifti",
            Datatype::NiftiGz => "medimage/nifti-gz",
            Datatype::Json => "application/json",
            Datatype::Text => "text/plain",
            Datatype::Field(FieldType::Text) => "field/text",
            Datatype::Field(FieldType::Integer) => "field/integer",
            Datatype::Field(FieldType::Decimal) => "field/decimal",
            Datatype::Field(FieldType::Boolean) => "field/boolean",
        }
    }

    /// Resolves the format string XNAT stores on a resource. Besides the
    /// mime-like names this also accepts the upper-case labels that XNAT's own
    /// uploaders write (`DICOM`, `NIFTI`, ...).
    pub fn from_mime(value: &str) -> Result<Self, XnatError> {
        let normalized = value.trim().to_lowercase();
        let datatype = match normalized.as_str() {
            "generic/file-set" | "generic/fileset" => Datatype::FileSet,
            "generic/directory" | "directory" => Datatype::Directory,
            "medimage/dicom-series" | "dicom" => Datatype::DicomSet,
            "application/dicom" => Datatype::Dicom,
            "medimage/nifti" | "nifti" => Datatype::Nifti,
            "medimage/nifti-gz" | "nifti_gz" => Datatype::NiftiGz,
            "application/json" | "json" => Datatype::Json,
            "text/plain" | "text" => Datatype::Text,
            "field/text" => Datatype::Field(FieldType::Text),
            "field/integer" => Datatype::Field(FieldType::Integer),
            "field/decimal" => Datatype::Field(FieldType::Decimal),
            "field/boolean" => Datatype::Field(FieldType::Boolean),
            _ => return Err(XnatError::FormatRecognition(value.to_string())),
        };
        Ok(datatype)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Datatype::Directory | Datatype::DicomSet)
    }

    pub fn is_field(&self) -> bool {
        matches!(self, Datatype::Field(_))
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mime_like())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntryAttrs {
    pub uri: Option<String>,
    pub checksums: Checksums,
    pub item_metadata: BTreeMap<String, Value>,
    pub order: Option<String>,
    pub quality: Option<String>,
}

impl EntryAttrs {
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataEntry {
    pub path: String,
    pub datatype: Datatype,
    pub uri: Option<String>,
    pub checksums: Checksums,
    pub item_metadata: BTreeMap<String, Value>,
    pub order: Option<String>,
    pub quality: Option<String>,
    pub row: RowAddress,
}

impl DataEntry {
    pub fn path_is_derivative(path: &str) -> bool {
        path.contains(DERIVATIVE_MARKER)
    }

    pub fn is_derivative(&self) -> bool {
        Self::path_is_derivative(&self.path)
    }

    pub fn is_field(&self) -> bool {
        self.datatype.is_field()
    }
}

impl fmt::Display for DataEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.path, self.row)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    address: RowAddress,
    entries: BTreeMap<String, DataEntry>,
}

impl DataRow {
    pub fn new(address: RowAddress) -> Self {
        Self {
            address,
            entries: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> &RowAddress {
        &self.address
    }

    pub fn frequency(&self) -> &Frequency {
        &self.address.frequency
    }

    pub fn add_entry(
        &mut self,
        path: impl Into<String>,
        datatype: Datatype,
        attrs: EntryAttrs,
    ) -> &mut DataEntry {
        let path = path.into();
        let entry = DataEntry {
            path: path.clone(),
            datatype,
            uri: attrs.uri,
            checksums: attrs.checksums,
            item_metadata: attrs.item_metadata,
            order: attrs.order,
            quality: attrs.quality,
            row: self.address.clone(),
        };
        match self.entries.entry(path) {
            btree_map::Entry::Occupied(mut existing) => {
                existing.insert(entry);
                existing.into_mut()
            }
            btree_map::Entry::Vacant(slot) => slot.insert(entry),
        }
    }

    pub fn entry(&self, path: &str) -> Option<&DataEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DataEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Leaf index of a dataset: every (subject, session) pair found on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTree {
    dataset_id: String,
    leaves: BTreeSet<(String, String)>,
}

impl DataTree {
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            leaves: BTreeSet::new(),
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn add_leaf<S: AsRef<str>>(&mut self, ids: &[S]) -> Result<(), XnatError> {
        match ids {
            [subject, session] => {
                self.leaves
                    .insert((subject.as_ref().to_string(), session.as_ref().to_string()));
                Ok(())
            }
            _ => Err(XnatError::Usage(format!(
                "tree leaves need a subject and a session id, got {} ids",
                ids.len()
            ))),
        }
    }

    pub fn leaves(&self) -> impl Iterator<Item = &(String, String)> {
        self.leaves.iter()
    }

    pub fn rows(&self, frequency: &Frequency) -> Vec<RowAddress> {
        match frequency {
            Frequency::Dataset => vec![RowAddress::dataset(&self.dataset_id)],
            Frequency::Subject => self
                .leaves
                .iter()
                .map(|(subject, _)| subject)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|subject| RowAddress::subject(&self.dataset_id, subject))
                .collect(),
            Frequency::Session => self
                .leaves
                .iter()
                .map(|(subject, session)| RowAddress::session(&self.dataset_id, subject, session))
                .collect(),
            Frequency::Custom(_) => Vec::new(),
        }
    }
}

/// Local materialisation of a file-set entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSet {
    pub datatype: Datatype,
    pub fspaths: Vec<PathBuf>,
}

impl FileSet {
    pub fn new(datatype: Datatype, fspaths: Vec<PathBuf>) -> Self {
        Self { datatype, fspaths }
    }

    pub fn fspath(&self) -> Option<&Path> {
        self.fspaths.first().map(PathBuf::as_path)
    }

    pub fn is_dir(&self) -> bool {
        self.datatype.is_dir()
    }

    pub fn mime_like(&self) -> &'static str {
        self.datatype.mime_like()
    }

    /// Directory the checksum keys are relative to: the directory itself for
    /// directory-shaped file-sets, the parent of the primary file otherwise.
    pub fn checksum_root(&self) -> Option<&Path> {
        let fspath = self.fspath()?;
        if self.is_dir() {
            Some(fspath)
        } else {
            fspath.parent()
        }
    }

    pub fn hash_files(&self, relative_to: &Path) -> Result<Checksums, XnatError> {
        let mut checksums = Checksums::new();
        for fspath in &self.fspaths {
            let files = if fspath.is_dir() {
                fs_util::list_files(fspath)?
            } else {
                vec![fspath.clone()]
            };
            for file in files {
                let key = fs_util::relative_key(&file, relative_to)?;
                checksums.insert(key, fs_util::md5_file(&file)?);
            }
        }
        Ok(checksums)
    }
}
