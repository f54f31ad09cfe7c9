//! Parsing and rewriting of XNAT REST URIs.

use regex::Regex;

use crate::error::XnatError;

fn pattern(re: &str) -> Result<Regex, XnatError> {
    Regex::new(re).map_err(|err| XnatError::InvalidUri(err.to_string()))
}

/// Path of `uri` below the cache root. URIs outside a project (e.g.
/// `/data/experiments/ID/...`) are filed under the project they were resolved
/// through.
pub fn cache_relative(dataset_id: &str, uri: &str) -> Result<String, XnatError> {
    let re = pattern(r"^/data/(?:archive/)?(.+?)/*$")?;
    let rest = re
        .captures(uri)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| XnatError::InvalidUri(uri.to_string()))?;
    if rest.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(XnatError::InvalidUri(uri.to_string()));
    }
    if rest.starts_with("projects/") {
        Ok(rest.to_string())
    } else {
        Ok(format!("projects/{dataset_id}/{rest}"))
    }
}

/// Path of a listed file relative to its resource root. Only the first
/// `resources/<id>/files/` run is stripped, so nested paths keep theirs.
pub fn checksum_key(file_uri: &str) -> Result<String, XnatError> {
    let re = pattern(r"^.*?/resources/[^/]+/files/(.*)$")?;
    re.captures(file_uri)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| XnatError::InvalidUri(file_uri.to_string()))
}

/// Where a resource sits below a container-service input mount, e.g.
/// `.../experiments/E1/scans/2/resources/DICOM` becomes `SCANS/2/DICOM`.
pub fn mount_relative(uri: &str) -> Result<String, XnatError> {
    let re = pattern(
        r"^/data/(?:archive/)?(?:projects/[^/]+/)?(?:subjects/[^/]+/)?(?:experiments/[^/]+/)?(?P<path>.*)$",
    )?;
    let path = re
        .captures(uri)
        .and_then(|caps| caps.name("path"))
        .map(|m| m.as_str())
        .ok_or_else(|| XnatError::InvalidUri(uri.to_string()))?;
    let segments = path.split('/').collect::<Vec<_>>();
    let mapped = match segments.as_slice() {
        ["scans", scan_id, "resources", label] => format!("SCANS/{scan_id}/{label}"),
        ["resources", label] => format!("RESOURCES/{label}"),
        // already in mount layout, e.g. synthesised `RESOURCES/<label>` URIs
        ["SCANS", scan_id, label] => format!("SCANS/{scan_id}/{label}"),
        ["RESOURCES", label] => format!("RESOURCES/{label}"),
        _ => return Err(XnatError::InvalidUri(uri.to_string())),
    };
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(XnatError::InvalidUri(uri.to_string()));
    }
    Ok(mapped)
}

/// The scan a resource belongs to, in the form the dicomdump service takes
/// as `src`.
pub fn dicom_scan_src(resource_uri: &str) -> Result<String, XnatError> {
    let re = pattern(r"^/data(?P<scan>/.+/scans/[^/]+)/resources/[^/]+$")?;
    re.captures(resource_uri)
        .and_then(|caps| caps.name("scan"))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| XnatError::InvalidUri(resource_uri.to_string()))
}
