//! End-to-end import tests over the in-memory stores
//!
//! Each test writes a fixture file, creates a job through the controller and
//! runs it to a terminal state.

mod common;

use anyhow::Result;
use chrono::NaiveDate;
use common::{fixture, init_tracing, MemoryHarness};
use sacra_import::config::ImportConfig;
use sacra_import::jobs::FlushPolicy;
use sacra_import::{
    ControllerSettings, CreateJobRequest, FieldMapping, ImportFormat, ImportJob, ImportOptions, JobStatus,
    RecordType,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn baptism_mapping() -> FieldMapping {
    FieldMapping::new()
        .map("first_name", "person_first")
        .map("last_name", "person_last")
        .map("baptized_on", "baptism_date")
        .map("priest", "officiant_name")
        .map("remarks", "notes")
        .map_list("godparents", ["godparent1", "godparent2"])
}

async fn import(
    harness: &MemoryHarness,
    church_id: i64,
    record_type: RecordType,
    path: &std::path::Path,
    mapping: &FieldMapping,
    options: ImportOptions,
) -> Result<ImportJob> {
    let job = harness
        .controller
        .create_job(CreateJobRequest::new(church_id, record_type, path))
        .await?;
    let job = harness
        .controller
        .run_job(job.id, mapping, options, CancellationToken::new())
        .await?;
    Ok(job)
}

fn baptism_csv(rows: usize) -> String {
    let mut body = String::from("first_name,last_name,baptized_on,priest,remarks,godparent1,godparent2\n");
    for i in 0..rows {
        body.push_str(&format!(
            "Child{i},Family{i},2020-03-{day:02},Fr. Ivan,entry {i},Peter Jones,\n",
            day = i % 28 + 1
        ));
    }
    body
}

#[tokio::test]
async fn test_reimport_is_idempotent() -> Result<()> {
    init_tracing();
    let harness = MemoryHarness::new();
    let file = fixture(".csv", &baptism_csv(12));
    let mapping = baptism_mapping();

    let first = import(&harness, 45, RecordType::Baptisms, file.path(), &mapping, ImportOptions::default()).await?;
    assert_eq!(first.status, JobStatus::Done);
    assert_eq!(first.counters.inserted_rows, 12);
    assert_eq!(first.counters.updated_rows, 0);

    let second = import(&harness, 45, RecordType::Baptisms, file.path(), &mapping, ImportOptions::default()).await?;
    assert_eq!(second.status, JobStatus::Done);
    assert_eq!(second.counters.inserted_rows, 0);
    assert_eq!(second.counters.updated_rows, 12);

    assert_eq!(harness.records.len(), 12);
    Ok(())
}

#[tokio::test]
async fn test_refreshed_export_updates_in_place() -> Result<()> {
    let harness = MemoryHarness::new();
    let mapping = baptism_mapping();

    let original = fixture(".csv", &baptism_csv(3));
    import(&harness, 45, RecordType::Baptisms, original.path(), &mapping, ImportOptions::default()).await?;

    // same people, same dates, new remarks and priest
    let refreshed = fixture(".csv", &baptism_csv(3).replace("Fr. Ivan", "Fr. Marko").replace("entry", "checked"));
    let job = import(&harness, 45, RecordType::Baptisms, refreshed.path(), &mapping, ImportOptions::default()).await?;

    assert_eq!(job.counters.updated_rows, 3);
    let stored = harness.records.records(45, RecordType::Baptisms);
    assert_eq!(stored.len(), 3);
    assert!(stored
        .iter()
        .all(|r| r.record.record.text("officiant_name") == Some("Fr. Marko") && r.write_count == 2));
    Ok(())
}

#[tokio::test]
async fn test_bad_date_row_does_not_fail_job() -> Result<()> {
    let harness = MemoryHarness::new();
    let mut body = String::from("first_name,last_name,baptized_on\n");
    for i in 1..=10 {
        let date = if i == 5 { "the feast of St. Nobody".to_string() } else { format!("2021-06-{i:02}") };
        body.push_str(&format!("Child{i},Family,{date}\n"));
    }
    let file = fixture(".csv", &body);

    let job = import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), ImportOptions::default()).await?;

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.counters.processed_rows, 10);
    assert!(job.counters.error_rows >= 1);
    assert_eq!(job.counters.inserted_rows, 9);
    assert!(job.error_text.is_none());
    Ok(())
}

#[tokio::test]
async fn test_godparent_columns_fold_into_list() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(".csv", &baptism_csv(1));

    import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), ImportOptions::default()).await?;

    let stored = harness.records.records(45, RecordType::Baptisms);
    let godparents = stored[0].record.record.get("godparents");
    assert_eq!(godparents, Some(sacra_import::records::FieldRef::List(&["Peter Jones".to_string()])));
    Ok(())
}

#[tokio::test]
async fn test_yearless_date_end_to_end() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(".json", r#"[{"Date":"2/15","Name":"Helen Russo","Age":"80"}]"#);
    let mapping = FieldMapping::new()
        .map("Date", "baptism_date")
        .map("Name", "person_first")
        .map("Age", "notes");

    let job = import(&harness, 45, RecordType::Baptisms, file.path(), &mapping, ImportOptions::default()).await?;

    assert_eq!(job.format, ImportFormat::Json);
    assert_eq!(job.counters.inserted_rows, 1);
    let stored = harness.records.records(45, RecordType::Baptisms);
    assert_eq!(stored.len(), 1);
    let record = &stored[0].record;
    assert_eq!(record.church_id, 45);
    assert_eq!(record.record.text("person_first"), Some("Helen Russo"));
    assert_eq!(record.record.text("notes"), Some("80"));
    assert_eq!(record.record.date("baptism_date"), NaiveDate::from_ymd_opt(2001, 2, 15));
    assert_eq!(
        record.source_hash,
        sacra_common::checksum::sha256_hex("Helen Russo|2001-02-15||".as_bytes())
    );
    Ok(())
}

#[tokio::test]
async fn test_xml_marriages() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(
        ".xml",
        r#"<?xml version="1.0" encoding="UTF-8"?>
<register>
  <marriages>
    <marriage book="3" page="12">
      <groom>Luka Horvat</groom>
      <bride>Ana Kovac</bride>
      <date>June 4, 1998</date>
      <witness>Marija Babic</witness>
      <witness>Josip Novak</witness>
    </marriage>
    <marriage book="3" page="13">
      <groom>Petar Juric</groom>
      <bride>Iva Maric</bride>
      <date>1998-07-11</date>
    </marriage>
  </marriages>
</register>"#,
    );
    let mapping = FieldMapping::new()
        .map("groom", "groom_first")
        .map("bride", "bride_first")
        .map("date", "marriage_date")
        .map("book", "book_no")
        .map("page", "page_no")
        .map_list("witnesses", ["witness", "witness_2"]);

    let job = import(&harness, 7, RecordType::Marriages, file.path(), &mapping, ImportOptions::default()).await?;

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.counters.inserted_rows, 2);
    let stored = harness.records.records(7, RecordType::Marriages);
    let luka = stored
        .iter()
        .find(|r| r.record.record.text("groom_first") == Some("Luka Horvat"))
        .expect("first marriage stored");
    assert_eq!(luka.record.record.date("marriage_date"), NaiveDate::from_ymd_opt(1998, 6, 4));
    assert_eq!(luka.record.record.text("book_no"), Some("3"));
    assert_eq!(
        luka.record.record.get("witnesses"),
        Some(sacra_import::records::FieldRef::List(&[
            "Marija Babic".to_string(),
            "Josip Novak".to_string()
        ]))
    );
    Ok(())
}

#[tokio::test]
async fn test_sql_dump_funerals() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(
        ".sql",
        "-- legacy export\n\
         SET NAMES utf8mb4;\n\
         INSERT INTO `funeral_records` (`deceased_first`, `deceased_last`, `death_date`, `funeral_date`, `notes`) VALUES\n\
         ('Stjepan', 'O''Neill', '1990-01-02', '1990-01-05', 'aged 91'),\n\
         ('Kata', 'Radic', '1991-03-09', NULL, NULL);\n\
         INSERT INTO audit_log (what) VALUES ('ignored');\n",
    );
    let mapping = FieldMapping::new()
        .map("deceased_first", "deceased_first")
        .map("deceased_last", "deceased_last")
        .map("death_date", "death_date")
        .map("funeral_date", "funeral_date")
        .map("notes", "notes");

    let job = import(&harness, 9, RecordType::Funerals, file.path(), &mapping, ImportOptions::default()).await?;

    assert_eq!(job.format, ImportFormat::Sql);
    assert_eq!(job.counters.total_rows, 2);
    assert_eq!(job.counters.inserted_rows, 2);
    let stored = harness.records.records(9, RecordType::Funerals);
    assert!(stored
        .iter()
        .any(|r| r.record.record.text("deceased_last") == Some("O'Neill")));
    Ok(())
}

#[tokio::test]
async fn test_json_wrapper_with_non_object_element() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(
        ".json",
        r#"{"exported": "2024-02-01", "records": [
            {"first_name": "Mara", "baptized_on": "01/15/2024"},
            42,
            {"first_name": "Tena", "baptized_on": "January 15, 2024"}
        ]}"#,
    );

    let job = import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), ImportOptions::default()).await?;

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.counters.total_rows, 3);
    assert_eq!(job.counters.inserted_rows, 2);
    assert_eq!(job.counters.error_rows, 1);
    Ok(())
}

#[tokio::test]
async fn test_rows_without_identity_are_skipped() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(
        ".csv",
        "first_name,last_name,baptized_on,priest\nAnna,Berg,2024-01-15,Fr. Ivan\n,,,Fr. Ivan\n",
    );

    let job = import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), ImportOptions::default()).await?;

    assert_eq!(job.counters.inserted_rows, 1);
    assert_eq!(job.counters.skipped_rows, 1);
    assert_eq!(harness.records.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_oversized_value_is_row_error() -> Result<()> {
    let harness = MemoryHarness::new();
    let long_name = "x".repeat(150);
    let file = fixture(
        ".csv",
        &format!("first_name,last_name,baptized_on\n{long_name},Berg,2024-01-15\nAnna,Berg,2024-01-15\n"),
    );

    let job = import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), ImportOptions::default()).await?;

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.counters.error_rows, 1);
    assert_eq!(job.counters.inserted_rows, 1);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_store_fails_job() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(".csv", &baptism_csv(5));
    harness.records.set_available(false);

    let job = import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), ImportOptions::default()).await?;

    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error_text.as_deref().unwrap_or_default().contains("store unavailable"));
    assert_eq!(job.counters.processed_rows, 0);
    assert!(job.finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_dry_run_writes_nothing() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(".csv", &baptism_csv(4));
    let dry_run = ImportOptions {
        dry_run: true,
        ..ImportOptions::default()
    };

    let job = import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), dry_run.clone()).await?;
    assert_eq!(job.counters.inserted_rows, 4);
    assert!(harness.records.is_empty());

    import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), ImportOptions::default()).await?;
    let job = import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), dry_run).await?;
    assert_eq!(job.counters.updated_rows, 4);
    assert_eq!(harness.records.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_source_system_is_recorded() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(".csv", &baptism_csv(1));
    let options = ImportOptions {
        source_system: Some("parish-legacy".to_string()),
        ..ImportOptions::default()
    };

    import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), options).await?;

    let stored = harness.records.records(45, RecordType::Baptisms);
    assert_eq!(stored[0].record.source_system, "parish-legacy");
    Ok(())
}

#[tokio::test]
async fn test_configured_source_system_is_the_default_label() -> Result<()> {
    let mut config = ImportConfig::default();
    config.import.source_system = "registry-2019".to_string();
    let harness = MemoryHarness::with_settings(ControllerSettings::from(&config));
    let file = fixture(".csv", &baptism_csv(2));

    import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), ImportOptions::default()).await?;

    let stored = harness.records.records(45, RecordType::Baptisms);
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|r| r.record.source_system == "registry-2019"));
    Ok(())
}

#[tokio::test]
async fn test_progress_is_flushed_while_running() -> Result<()> {
    let settings = ControllerSettings {
        flush: FlushPolicy {
            every_rows: 10,
            interval: Duration::from_secs(3600),
        },
        ..ControllerSettings::default()
    };
    let harness = MemoryHarness::with_settings(settings);
    let file = fixture(".csv", &baptism_csv(35));

    let job = import(&harness, 45, RecordType::Baptisms, file.path(), &baptism_mapping(), ImportOptions::default()).await?;

    assert_eq!(job.counters.processed_rows, 35);
    assert_eq!(harness.jobs.progress_writes(), 3);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_keeps_committed_rows() -> Result<()> {
    init_tracing();
    let settings = ControllerSettings {
        flush: FlushPolicy {
            every_rows: 1,
            interval: Duration::from_secs(3600),
        },
        ..ControllerSettings::default()
    };
    let harness = MemoryHarness::with_settings(settings);
    harness.records.set_write_delay(Duration::from_millis(20));
    let file = fixture(".csv", &baptism_csv(50));

    let job = harness
        .controller
        .create_job(CreateJobRequest::new(45, RecordType::Baptisms, file.path()))
        .await?;
    let running = harness
        .controller
        .spawn_job(job.id, baptism_mapping(), ImportOptions::default());

    // wait for live progress before cancelling
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let live = harness.controller.get_job(job.id).await?;
        if live.counters.processed_rows >= 3 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job made no progress");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(harness.controller.cancel_job(job.id));

    let job = running.wait().await?;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error_text.as_deref(), Some("cancelled"));
    assert!(job.counters.processed_rows >= 3);
    assert!(job.counters.processed_rows < 50);
    assert_eq!(harness.records.len() as i64, job.counters.inserted_rows);
    assert!(!harness.controller.cancel_job(job.id));
    Ok(())
}

#[tokio::test]
async fn test_recent_jobs_newest_first() -> Result<()> {
    let harness = MemoryHarness::new();
    let file = fixture(".csv", &baptism_csv(1));

    let older = harness
        .controller
        .create_job(CreateJobRequest::new(45, RecordType::Baptisms, file.path()))
        .await?;
    let newer = harness
        .controller
        .create_job(CreateJobRequest::new(45, RecordType::Baptisms, file.path()).format(ImportFormat::Csv))
        .await?;

    let recent = harness.controller.list_recent_jobs(45, Some(10)).await?;
    let ids: Vec<_> = recent.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![newer.id, older.id]);
    Ok(())
}
