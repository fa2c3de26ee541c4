use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jpx_core::format_utc;
use jpx_storage::{
    ContinuationToken, Item, JsonDirStore, KeySpec, MemoryStore, Projection, ScanPage, SinkStore,
    SourceStore, StoreError,
};
use jpx_sync::{FailureStage, Pipeline, PipelineConfig, PipelineState, RunMode};
use serde_json::{json, Value};

const SOURCE: &str = "job-postings-enhanced";
const FLAT: &str = "job-postings-normalized";
const TECH_INDEX: &str = "job-tech-index";
const TECH_INDEX_V2: &str = "job-tech-index-v2";

fn as_of() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()
}

fn days_ago(days: i64) -> String {
    format_utc(as_of() - Duration::days(days))
}

fn config() -> PipelineConfig {
    PipelineConfig {
        as_of: as_of(),
        page_size: 3,
        ..PipelineConfig::default()
    }
}

fn item(value: Value) -> Item {
    match value {
        Value::Object(map) => map,
        _ => panic!("item fixture must be an object"),
    }
}

/// Seeds the source collection in the given order.
async fn seeded(postings: Vec<Value>) -> MemoryStore {
    let store = MemoryStore::new();
    let items = postings
        .into_iter()
        .enumerate()
        .map(|(seq, mut posting)| {
            posting["seq"] = json!(format!("{seq:05}"));
            item(posting)
        })
        .collect();
    store
        .insert(SOURCE, &KeySpec::new(["seq"]), items)
        .await
        .expect("seed source");
    store
}

async fn run(store: &MemoryStore, config: PipelineConfig) -> jpx_sync::RunSummary {
    let store = Arc::new(store.clone());
    Pipeline::new(config, store.clone(), store)
        .expect("pipeline")
        .run()
        .await
        .expect("run succeeds")
}

fn find<'a>(rows: &'a [Item], field: &str, value: &str) -> &'a Item {
    rows.iter()
        .find(|row| row.get(field).and_then(Value::as_str) == Some(value))
        .unwrap_or_else(|| panic!("no row with {field}={value}"))
}

fn sample_postings() -> Vec<Value> {
    vec![
        json!({
            "id": "job-1",
            "job_title": "Backend Engineer",
            "status": "Active",
            "processed_date": "2026-02-20T10:00:00Z",
            "technologies": ["Node.js", "nodejs", "PostgreSQL", "postgres"],
            "skills": ["communication", "Communication"],
            "industry": "Transportation and Logistics",
        }),
        json!({
            "jobId": "job-2",
            "processed_date": 1700000000,
            "technologies": ["React", "react.js", "C#"],
            "benefits": ["401k"],
            "industry": "Finance & Insurance",
        }),
        json!({
            "PK": "JOB#job-3",
            "SK": "META",
            "processed_date": "not a date",
            "technologies": ["ReactJS", "Go"],
            "requirements": ["Bachelor's degree"],
            "industry": "technology/transportation",
        }),
        json!({
            "id": "job-4",
            "status": "Closed",
            "processed_date": days_ago(5),
            "technologies": [],
            "company_name": "Acme",
        }),
        json!({"title": "orphan without identifier", "technologies": ["Rust"]}),
        json!({
            "id": "job-5",
            "processed_date": "2026-02-27 08:00:00",
            "technologies": ["Docker", "kubernetes", 42, ""],
        }),
        json!({"id": "job-6", "technologies": ["Python", "python"]}),
    ]
}

async fn destination_bytes(store: &MemoryStore) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for name in store.collection_names().await {
        if name == SOURCE {
            continue;
        }
        let rows = store.snapshot(&name).await;
        out.push((name, serde_json::to_string(&rows).unwrap()));
    }
    out
}

#[tokio::test]
async fn rerun_over_unchanged_source_is_byte_identical() {
    let store = seeded(sample_postings()).await;

    let first = run(&store, config()).await;
    let before = destination_bytes(&store).await;
    let second = run(&store, config()).await;
    let after = destination_bytes(&store).await;

    assert_eq!(before, after);
    assert_eq!(first.written, second.written);
    assert_eq!(first.state, PipelineState::Done);
    assert_eq!(first.pages, 3);
    assert!(before.iter().any(|(name, _)| name == TECH_INDEX_V2));
}

#[tokio::test]
async fn postings_without_identifier_are_excluded_from_every_output() {
    let store = seeded(sample_postings()).await;
    let summary = run(&store, config()).await;

    assert_eq!(summary.scanned, 7);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.processed, 6);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.written.flat_view, 6);
    assert_eq!(store.len(FLAT).await, 6);

    let rust = store.snapshot("job-postings-technologies").await;
    assert!(rust.iter().all(|row| row["Name"] != json!("Rust")));
}

#[tokio::test]
async fn identifiers_come_from_aliases_and_prefixed_keys() {
    let store = seeded(sample_postings()).await;
    run(&store, config()).await;

    let flat = store.snapshot(FLAT).await;
    let ids: Vec<_> = flat.iter().map(|row| row["Id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["job-1", "job-2", "job-3", "job-4", "job-5", "job-6"]);
}

#[tokio::test]
async fn recent_postings_get_inferred_status_and_stale_ones_do_not() {
    let store = seeded(vec![
        json!({"id": "fresh", "processed_date": days_ago(10)}),
        json!({"id": "stale", "processed_date": days_ago(40)}),
        json!({"id": "closed", "processed_date": days_ago(1), "status": "Closed"}),
    ])
    .await;
    run(&store, config()).await;

    let flat = store.snapshot(FLAT).await;
    assert_eq!(find(&flat, "Id", "fresh")["status"], json!("Active"));
    assert!(find(&flat, "Id", "stale").get("status").is_none());
    assert_eq!(find(&flat, "Id", "closed")["status"], json!("Closed"));
}

#[tokio::test]
async fn flat_view_rows_are_default_filled() {
    let store = seeded(sample_postings()).await;
    run(&store, config()).await;

    let flat = store.snapshot(FLAT).await;
    let job4 = find(&flat, "Id", "job-4");
    assert_eq!(job4["company_name"], json!("Acme"));
    assert_eq!(job4["location"], json!("Unknown"));
    assert_eq!(job4["salary_mentioned"], json!(false));
    assert_eq!(job4["job_title"], json!("Unknown"));
    assert_eq!(job4["normalized"], json!(true));
    assert_eq!(job4["normalized_at"], json!("2026-03-01T00:00:00+00:00"));
    assert!(job4.get("technologies").is_none());

    let job3 = find(&flat, "Id", "job-3");
    assert_eq!(job3["processed_date"], json!("2026-03-01T00:00:00+00:00"));
    let job2 = find(&flat, "Id", "job-2");
    assert_eq!(job2["processed_date"], json!("2023-11-14T22:13:20+00:00"));
}

#[tokio::test]
async fn lookup_counts_are_distinct_postings() {
    let store = seeded(sample_postings()).await;
    let summary = run(&store, config()).await;

    let tech = store.snapshot("job-postings-technologies").await;
    assert_eq!(find(&tech, "Name", "React")["postingCount"], json!(2));
    assert_eq!(find(&tech, "Name", "Node.js")["postingCount"], json!(1));
    assert_eq!(find(&tech, "Name", "PostgreSQL")["postingCount"], json!(1));
    assert_eq!(find(&tech, "Name", "Python")["postingCount"], json!(1));
    assert_eq!(find(&tech, "Name", "Node.js")["Id"], json!("nodejs"));
    assert_eq!(find(&tech, "Name", "Go")["createdAt"], json!("2026-03-01T00:00:00+00:00"));

    let skills = store.snapshot("job-postings-skills").await;
    assert_eq!(skills.len(), 1);
    assert_eq!(skills[0]["postingCount"], json!(1));

    assert_eq!(
        summary.unique_terms[&jpx_core::AttributeCategory::Technologies],
        tech.len()
    );
}

#[tokio::test]
async fn industries_are_split_into_atomic_terms() {
    let store = seeded(sample_postings()).await;
    run(&store, config()).await;

    let industries = store.snapshot("job-postings-industries").await;
    let mut names: Vec<_> = industries
        .iter()
        .map(|row| row["Name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["Finance", "Insurance", "Logistics", "Technology", "Transportation"]
    );
    assert_eq!(find(&industries, "Name", "Transportation")["postingCount"], json!(2));
}

#[tokio::test]
async fn both_index_generations_are_written_to_their_own_collections() {
    let store = seeded(sample_postings()).await;
    run(&store, config()).await;

    let display = store.snapshot(TECH_INDEX).await;
    let node = find(&display, "PK", "Node.js");
    assert_eq!(node["SK"], json!("Active#2026-02-20T10:00:00+00:00#job-1"));
    assert_eq!(node["jobId"], json!("job-1"));
    assert_eq!(node["tech"], json!("Node.js"));
    let naive = find(&display, "jobId", "job-5");
    assert!(naive["SK"].as_str().unwrap().starts_with("Active#2026-02-27T08:00:00+00:00#"));

    let slug = store.snapshot(TECH_INDEX_V2).await;
    assert!(slug.iter().all(|row| {
        let pk = row["PK"].as_str().unwrap();
        pk.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    }));
    assert_eq!(find(&slug, "PK", "nodejs")["jobId"], json!("job-1"));
    assert_eq!(find(&slug, "PK", "nodejs")["slug"], json!("nodejs"));
    assert_eq!(find(&slug, "PK", "csharp")["jobId"], json!("job-2"));
    assert!(display.iter().all(|row| row["PK"] != json!("nodejs")));

    let react_rows = display.iter().filter(|row| row["PK"] == json!("React")).count();
    assert_eq!(react_rows, 2);
}

#[tokio::test]
async fn wrong_typed_categories_are_ignored_and_the_posting_still_lands() {
    let store = seeded(vec![
        json!({"id": "ok-1", "technologies": ["Rust"]}),
        json!({
            "id": "bad",
            "technologies": "React, Vue",
            "skills": ["leadership"],
            "company_name": "Acme",
        }),
        json!({"id": "bad-industry", "industry": ["Finance"], "technologies": ["rust"]}),
    ])
    .await;
    let summary = run(&store, config()).await;

    assert_eq!(summary.state, PipelineState::Done);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.failed, 0);

    let flat = store.snapshot(FLAT).await;
    assert_eq!(flat.len(), 3);
    assert_eq!(find(&flat, "Id", "bad")["company_name"], json!("Acme"));

    let skills = store.snapshot("job-postings-skills").await;
    assert_eq!(find(&skills, "Name", "Leadership")["postingCount"], json!(1));

    let tech = store.snapshot("job-postings-technologies").await;
    assert_eq!(tech.len(), 1);
    assert_eq!(find(&tech, "Name", "Rust")["postingCount"], json!(2));
    assert_eq!(store.len("job-postings-industries").await, 0);
    assert!(store
        .snapshot(TECH_INDEX)
        .await
        .iter()
        .all(|row| row["jobId"] != json!("bad")));
}

/// Records every batch and sync it receives before delegating to memory.
#[derive(Default)]
struct RecordingSink {
    inner: MemoryStore,
    batches: Mutex<Vec<(String, usize)>>,
    syncs: AtomicUsize,
}

#[async_trait]
impl SinkStore for RecordingSink {
    async fn batch_upsert(
        &self,
        collection: &str,
        key: &KeySpec,
        items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        self.batches
            .lock()
            .unwrap()
            .push((collection.to_string(), items.len()));
        self.inner.batch_upsert(collection, key, items).await
    }

    async fn sync(&self) -> Result<(), StoreError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn writes_are_chunked_under_the_batch_ceiling() {
    let postings = (0..1203)
        .map(|i| json!({"id": format!("job-{i:05}"), "technologies": [format!("tool-{}", i % 7)]}))
        .collect();
    let source = seeded(postings).await;
    let sink = Arc::new(RecordingSink::default());

    let config = PipelineConfig {
        page_size: 1000,
        ..config()
    };
    let summary = Pipeline::new(config, Arc::new(source), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.processed, 1203);
    assert_eq!(summary.written.flat_view, 1203);
    assert_eq!(summary.written.index, 2 * 1203);
    assert_eq!(sink.inner.len(FLAT).await, 1203);

    let batches = sink.batches.lock().unwrap().clone();
    assert!(batches.iter().all(|(_, size)| *size <= 500 && *size > 0));
    let flat_batches: Vec<_> = batches
        .iter()
        .filter(|(name, _)| name == FLAT)
        .map(|(_, size)| *size)
        .collect();
    assert_eq!(flat_batches.iter().sum::<usize>(), 1203);
    assert!(flat_batches.len() >= 3);
    // one per page plus one after the lookup tables
    assert_eq!(summary.pages, 2);
    assert_eq!(sink.syncs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn smaller_batch_sizes_are_honoured() {
    let postings = (0..25).map(|i| json!({"id": format!("j{i:03}")})).collect();
    let source = seeded(postings).await;
    let sink = Arc::new(RecordingSink::default());
    let config = PipelineConfig {
        batch_size: 10,
        page_size: 100,
        ..config()
    };
    Pipeline::new(config, Arc::new(source), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    let flat_batches: Vec<_> = sink
        .batches
        .lock()
        .unwrap()
        .iter()
        .filter(|(name, _)| name == FLAT)
        .map(|(_, size)| *size)
        .collect();
    assert_eq!(flat_batches, vec![10, 10, 5]);
}

/// Serves one good page, then fails.
struct FlakySource {
    inner: MemoryStore,
    calls: AtomicUsize,
}

#[async_trait]
impl SourceStore for FlakySource {
    async fn scan(
        &self,
        collection: &str,
        projection: &Projection,
        start: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "source went away",
            )));
        }
        self.inner.scan(collection, projection, start, limit).await
    }
}

#[tokio::test]
async fn scan_failures_abort_with_partial_summary() {
    let postings = (0..5)
        .map(|i| json!({"id": format!("job-{i}"), "technologies": ["Go"]}))
        .collect();
    let source = Arc::new(FlakySource {
        inner: seeded(postings).await,
        calls: AtomicUsize::new(0),
    });
    let sink = Arc::new(MemoryStore::new());

    let failure = Pipeline::new(config(), source, sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap_err();

    assert_eq!(failure.stage, FailureStage::Scanning);
    assert_eq!(failure.summary.state, PipelineState::Error);
    assert_eq!(failure.summary.pages, 1);
    assert_eq!(failure.summary.scanned, 3);
    assert_eq!(failure.summary.processed, 3);
    assert_eq!(failure.summary.written.flat_view, 3);
    assert_eq!(sink.len(FLAT).await, 3);
    assert_eq!(sink.len("job-postings-technologies").await, 0);
    assert!(failure.to_string().contains("source went away"));
}

struct BrokenSink;

#[async_trait]
impl SinkStore for BrokenSink {
    async fn batch_upsert(
        &self,
        _collection: &str,
        _key: &KeySpec,
        _items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        Err(StoreError::Io(std::io::Error::other("disk full")))
    }
}

#[tokio::test]
async fn write_failures_are_fatal() {
    let source = seeded(sample_postings()).await;
    let failure = Pipeline::new(config(), Arc::new(source), Arc::new(BrokenSink))
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert_eq!(failure.stage, FailureStage::Flushing);
    assert_eq!(failure.summary.state, PipelineState::Error);
    assert_eq!(failure.summary.written.total(), 0);
}

#[tokio::test]
async fn dry_runs_write_nothing() {
    let store = seeded(sample_postings()).await;
    let summary = run(
        &store,
        PipelineConfig {
            dry_run: true,
            ..config()
        },
    )
    .await;

    assert_eq!(store.collection_names().await, vec![SOURCE.to_string()]);
    assert_eq!(summary.written.total(), 0);
    assert!(summary.rows_staged > 0);
    assert_eq!(summary.processed, 6);
}

#[tokio::test]
async fn index_mode_rebuilds_only_indexes() {
    let store = seeded(sample_postings()).await;
    let summary = run(
        &store,
        PipelineConfig {
            mode: RunMode::IndexOnly,
            ..config()
        },
    )
    .await;

    let mut names = store.collection_names().await;
    names.sort();
    assert_eq!(names, vec![SOURCE, TECH_INDEX, TECH_INDEX_V2]);
    assert_eq!(summary.written.flat_view, 0);
    assert_eq!(summary.written.lookup, 0);
    assert!(summary.written.index > 0);
}

#[tokio::test]
async fn json_directory_exports_run_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join(format!("{SOURCE}.json")),
        serde_json::to_vec(&sample_postings()).unwrap(),
    )
    .unwrap();
    let store = Arc::new(JsonDirStore::new(dir.path()));

    let summary = Pipeline::new(config(), store.clone(), store.clone())
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(summary.processed, 6);

    let flat_path = store.collection_path(FLAT);
    let first = std::fs::read(&flat_path).unwrap();
    Pipeline::new(config(), store.clone(), store)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(first, std::fs::read(&flat_path).unwrap());
    assert!(dir.path().join(format!("{TECH_INDEX_V2}.json")).exists());
}

/// Counts the files a JSON directory store rewrites on each sync.
struct CountingDirSink {
    inner: JsonDirStore,
    rewrites: AtomicUsize,
}

#[async_trait]
impl SinkStore for CountingDirSink {
    async fn batch_upsert(
        &self,
        collection: &str,
        key: &KeySpec,
        items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        self.inner.batch_upsert(collection, key, items).await
    }

    async fn sync(&self) -> Result<(), StoreError> {
        let rewritten = self.inner.flush_dirty().await?;
        self.rewrites.fetch_add(rewritten, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn json_directory_files_are_rewritten_once_per_page() {
    let dir = tempfile::tempdir().expect("tempdir");
    let postings: Vec<Value> = (0..30)
        .map(|i| json!({"id": format!("job-{i:03}"), "technologies": ["Go"]}))
        .collect();
    std::fs::write(
        dir.path().join(format!("{SOURCE}.json")),
        serde_json::to_vec(&postings).unwrap(),
    )
    .unwrap();
    let store = JsonDirStore::new(dir.path());
    let sink = Arc::new(CountingDirSink {
        inner: store.clone(),
        rewrites: AtomicUsize::new(0),
    });

    let config = PipelineConfig {
        batch_size: 4,
        page_size: 30,
        ..config()
    };
    let summary = Pipeline::new(config, Arc::new(store.clone()), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(summary.pages, 1);
    assert_eq!(summary.written.flat_view, 30);

    // flat view and both indexes at end of page, then the technologies table
    assert_eq!(sink.rewrites.load(Ordering::SeqCst), 4);
    assert_eq!(store.flush_dirty().await.unwrap(), 0);
    let flat: Value =
        serde_json::from_slice(&std::fs::read(store.collection_path(FLAT)).unwrap()).unwrap();
    assert_eq!(flat.as_object().unwrap().len(), 30);
}
