use std::io::{self, Write};
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::config::XnatConfig;
use crate::domain::{Checksums, DataEntry, DataRow, DataTree, FileSet};

#[derive(Debug, Serialize)]
pub struct TreeResult {
    pub dataset_id: String,
    pub leaves: Vec<LeafRecord>,
}

#[derive(Debug, Serialize)]
pub struct LeafRecord {
    pub subject: String,
    pub session: String,
}

#[derive(Debug, Serialize)]
pub struct RowResult {
    pub row: String,
    pub entries: Vec<EntryRecord>,
}

#[derive(Debug, Serialize)]
pub struct EntryRecord {
    pub path: String,
    pub datatype: String,
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Checksums::is_empty")]
    pub checksums: Checksums,
}

#[derive(Debug, Serialize)]
pub struct ChecksumsResult {
    pub uri: String,
    pub checksums: Checksums,
}

#[derive(Debug, Serialize)]
pub struct FetchResult {
    pub path: String,
    pub datatype: String,
    pub fspaths: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct DefinitionResult {
    pub dataset_id: String,
    pub name: String,
    pub definition: Option<Value>,
}

impl From<&DataTree> for TreeResult {
    fn from(tree: &DataTree) -> Self {
        Self {
            dataset_id: tree.dataset_id().to_string(),
            leaves: tree
                .leaves()
                .map(|(subject, session)| LeafRecord {
                    subject: subject.clone(),
                    session: session.clone(),
                })
                .collect(),
        }
    }
}

impl From<&DataEntry> for EntryRecord {
    fn from(entry: &DataEntry) -> Self {
        Self {
            path: entry.path.clone(),
            datatype: entry.datatype.mime_like().to_string(),
            uri: entry.uri.clone(),
            order: entry.order.clone(),
            quality: entry.quality.clone(),
            checksums: entry.checksums.clone(),
        }
    }
}

impl From<&DataRow> for RowResult {
    fn from(row: &DataRow) -> Self {
        Self {
            row: row.address().to_string(),
            entries: row.entries().map(EntryRecord::from).collect(),
        }
    }
}

impl FetchResult {
    pub fn new(entry: &DataEntry, fileset: FileSet) -> Self {
        Self {
            path: entry.path.clone(),
            datatype: fileset.mime_like().to_string(),
            fspaths: fileset.fspaths,
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_tree(result: &TreeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_row(result: &RowResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_checksums(result: &ChecksumsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_definition(result: &DefinitionResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_config(config: &XnatConfig) -> io::Result<()> {
        Self::print_json(config)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
