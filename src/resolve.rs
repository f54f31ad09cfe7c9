use tracing::debug;

use crate::client::{
    PROJECT_XSI_TYPE, SUBJECT_XSI_TYPE, XExperiment, XProject, XResource, XSubject, XnatClient,
};
use crate::domain::{Frequency, RowAddress};
use crate::error::XnatError;

/// The XNAT object a row is stored on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRow {
    Project(XProject),
    Subject(XSubject),
    Session(XExperiment),
    /// Placeholder subject holding rows of a non-standard frequency.
    Synthetic(XSubject),
}

impl RemoteRow {
    pub fn uri(&self) -> &str {
        match self {
            RemoteRow::Project(project) => &project.uri,
            RemoteRow::Subject(subject) | RemoteRow::Synthetic(subject) => &subject.uri,
            RemoteRow::Session(experiment) => &experiment.uri,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            RemoteRow::Project(project) => &project.id,
            RemoteRow::Subject(subject) | RemoteRow::Synthetic(subject) => &subject.label,
            RemoteRow::Session(experiment) => &experiment.label,
        }
    }

    pub fn xsi_type(&self) -> &str {
        match self {
            RemoteRow::Project(_) => PROJECT_XSI_TYPE,
            RemoteRow::Subject(_) | RemoteRow::Synthetic(_) => SUBJECT_XSI_TYPE,
            RemoteRow::Session(experiment) => &experiment.xsi_type,
        }
    }

    /// Only sessions carry scans.
    pub fn session(&self) -> Option<&XExperiment> {
        match self {
            RemoteRow::Session(experiment) => Some(experiment),
            _ => None,
        }
    }
}

/// Label of the placeholder subject for a row of a non-standard frequency,
/// e.g. `__group_A_B__`, or `__group__` when the row has no ids.
pub fn make_row_name(row: &RowAddress) -> String {
    let ids = row
        .ids()
        .iter()
        .filter(|id| !id.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>();
    if ids.is_empty() {
        format!("__{}__", row.frequency)
    } else {
        format!("__{}_{}__", row.frequency, ids.join("_"))
    }
}

pub fn resolve(client: &dyn XnatClient, row: &RowAddress) -> Result<RemoteRow, XnatError> {
    let project_id = row.dataset_id.as_str();
    let remote = match &row.frequency {
        Frequency::Dataset => RemoteRow::Project(client.project(project_id)?),
        Frequency::Subject => {
            let label = axis_id(row, "subject")?;
            RemoteRow::Subject(client.subject(project_id, label)?)
        }
        Frequency::Session => {
            let label = axis_id(row, "session")?;
            RemoteRow::Session(client.experiment(project_id, label)?)
        }
        Frequency::Custom(_) => {
            let name = make_row_name(row);
            RemoteRow::Synthetic(client.create_subject(project_id, &name)?)
        }
    };
    debug!(row = %row, uri = remote.uri(), "resolved row");
    Ok(remote)
}

fn axis_id<'a>(row: &'a RowAddress, axis: &str) -> Result<&'a str, XnatError> {
    row.frequency_id(axis)
        .or_else(|| row.id())
        .ok_or_else(|| XnatError::Usage(format!("{row} has no {axis} id")))
}

/// URI of a resource addressed by label instead of by its numeric id.
pub fn resource_uri(resource: &XResource) -> String {
    match resource.uri.strip_suffix(resource.id.as_str()) {
        Some(base) if base.ends_with('/') => format!("{base}{}", resource.label),
        _ => resource.uri.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_row_names() {
        let group = Frequency::Custom("group".to_string());
        let row = RowAddress::custom("PROJ", group.clone(), vec!["A".into(), "B".into()]);
        assert_eq!(make_row_name(&row), "__group_A_B__");
        let bare = RowAddress::custom("PROJ", group, Vec::new());
        assert_eq!(make_row_name(&bare), "__group__");
    }

    #[test]
    fn resource_uri_uses_label() {
        let resource = XResource {
            id: "1234".to_string(),
            label: "brain__at__".to_string(),
            format: None,
            uri: "/data/experiments/E1/resources/1234".to_string(),
        };
        assert_eq!(
            resource_uri(&resource),
            "/data/experiments/E1/resources/brain__at__"
        );
    }
}
