use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use crate::client::{DicomDumpTag, XnatClient};
use crate::error::XnatError;
use crate::uri;

const RELEVANT_VRS: &[&str] = &["UI", "CS", "DA", "TM", "SH", "LO", "PN", "ST", "AS"];

/// Header of the first DICOM file of the scan holding `resource_uri`, keyed
/// `"GGGG,EEEE"`.
pub fn dicom_header(
    client: &dyn XnatClient,
    resource_uri: &str,
) -> Result<BTreeMap<String, Value>, XnatError> {
    let src = uri::dicom_scan_src(resource_uri)?;
    let tags = client.dicom_dump(&src)?;
    header_from_dump(&tags)
}

pub fn header_from_dump(tags: &[DicomDumpTag]) -> Result<BTreeMap<String, Value>, XnatError> {
    let tag_re = Regex::new(r"^\(([0-9A-Fa-f]{4}),([0-9A-Fa-f]{4})\)$")
        .map_err(|err| XnatError::Usage(err.to_string()))?;
    let mut header = BTreeMap::new();
    for tag in tags {
        if !RELEVANT_VRS.contains(&tag.vr.as_str()) {
            continue;
        }
        let Some(caps) = tag_re.captures(tag.tag1.trim()) else {
            continue;
        };
        let key = format!("{},{}", &caps[1], &caps[2]).to_uppercase();
        header.insert(key, convert(&tag.value, &tag.vr));
    }
    Ok(header)
}

fn convert(value: &str, vr: &str) -> Value {
    match vr {
        "TM" => value
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string())),
        "CS" => Value::Array(
            value
                .split('\\')
                .map(|part| Value::String(part.to_string()))
                .collect(),
        ),
        _ => Value::String(value.to_string()),
    }
}
