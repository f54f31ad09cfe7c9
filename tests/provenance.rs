mod common;

use serde_json::json;

use xnat_store::domain::{DataRow, Datatype, EntryAttrs, FieldType, Provenance, RowAddress};
use xnat_store::store::{DataStore, METADATA_RESOURCE, PROVENANCE_RESOURCE};

use common::{MockXnat, experiment_uri, project_uri, sample_project, store_with};

fn provenance(pipeline: &str) -> Provenance {
    let mut record = Provenance::new();
    record.insert("pipeline".to_string(), json!(pipeline));
    record.insert("inputs".to_string(), json!(["T1w/DICOM"]));
    record
}

#[test]
fn missing_provenance_reads_as_empty_record() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_with(sample_project(), temp.path());
    let mut row = DataRow::new(RowAddress::session("PROJ", "S01", "S01_MR1"));
    store.populate_row(&mut row).unwrap();

    let entry = row.entry("brain_mask@").unwrap();
    assert!(store.get_provenance(entry).unwrap().is_empty());
}

#[test]
fn provenance_round_trips_per_entry() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_with(sample_project(), temp.path());
    let mut row = DataRow::new(RowAddress::session("PROJ", "S01", "S01_MR1"));
    store.populate_row(&mut row).unwrap();
    let mask = row.entry("brain_mask@").unwrap().clone();
    let age = row.entry("age").unwrap().clone();

    store.put_provenance(&mask, &provenance("bet")).unwrap();
    store.put_provenance(&age, &provenance("demographics")).unwrap();

    assert_eq!(store.get_provenance(&mask).unwrap(), provenance("bet"));
    assert_eq!(store.get_provenance(&age).unwrap(), provenance("demographics"));

    let resource = format!(
        "{}/resources/{PROVENANCE_RESOURCE}",
        experiment_uri("PROJ", "S01", "S01_MR1")
    );
    assert_eq!(
        store.client().file_names(&resource),
        vec!["__field__age.json", "brain_mask__at___.json"]
    );

    // the provenance resource is bookkeeping, not an entry
    let mut again = DataRow::new(RowAddress::session("PROJ", "S01", "S01_MR1"));
    store.populate_row(&mut again).unwrap();
    assert_eq!(again.len(), row.len());
}

#[test]
fn provenance_of_unsaved_entry_is_empty_once_resource_exists() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_with(sample_project(), temp.path());
    let mut row = DataRow::new(RowAddress::session("PROJ", "S01", "S01_MR1"));
    let first = row
        .add_entry("first@", Datatype::Json, EntryAttrs::default())
        .clone();
    let second = row
        .add_entry("second@", Datatype::Json, EntryAttrs::default())
        .clone();

    store.put_provenance(&first, &provenance("a")).unwrap();
    assert!(store.get_provenance(&second).unwrap().is_empty());
}

#[test]
fn dataset_definition_round_trips() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_with(sample_project(), temp.path());
    let definition = json!({
        "id": "PROJ",
        "hierarchy": ["subject", "session"],
        "columns": {
            "t1w": {"path": "T1w/DICOM", "datatype": "medimage/dicom-series"},
            "age": {"path": "age", "datatype": "field/text"},
        },
    });

    store
        .save_dataset_definition("PROJ", &definition, "default")
        .unwrap();
    assert_eq!(
        store.load_dataset_definition("PROJ", "default").unwrap(),
        Some(definition.clone())
    );
    assert_eq!(
        store.client().resource_labels(&project_uri("PROJ")),
        vec![METADATA_RESOURCE]
    );

    let replacement = json!({"id": "PROJ", "hierarchy": ["session"]});
    store
        .save_dataset_definition("PROJ", &replacement, "default")
        .unwrap();
    assert_eq!(
        store.load_dataset_definition("PROJ", "default").unwrap(),
        Some(replacement)
    );
}

#[test]
fn absent_definitions_load_as_none() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_with(sample_project(), temp.path());
    assert_eq!(store.load_dataset_definition("PROJ", "default").unwrap(), None);

    store
        .save_dataset_definition("PROJ", &json!({"id": "PROJ"}), "default")
        .unwrap();
    assert_eq!(store.load_dataset_definition("PROJ", "other").unwrap(), None);
}

#[test]
fn field_provenance_is_kept_apart_from_fileset_provenance() {
    let temp = tempfile::tempdir().unwrap();
    let mock = MockXnat::new();
    mock.add_session("PROJ", "S01", "S01_MR1");
    let store = store_with(mock, temp.path());
    let mut row = DataRow::new(RowAddress::session("PROJ", "S01", "S01_MR1"));
    let field = row
        .add_entry("score@", Datatype::Field(FieldType::Decimal), EntryAttrs::default())
        .clone();
    let mut fileset_row = DataRow::new(RowAddress::session("PROJ", "S01", "S01_MR1"));
    let fileset = fileset_row
        .add_entry("score@", Datatype::Json, EntryAttrs::default())
        .clone();

    store.put_provenance(&field, &provenance("field")).unwrap();
    store.put_provenance(&fileset, &provenance("fileset")).unwrap();
    assert_eq!(store.get_provenance(&field).unwrap(), provenance("field"));
    assert_eq!(store.get_provenance(&fileset).unwrap(), provenance("fileset"));
}
