//! Batch normalization pipeline: scans the source collection, aggregates
//! canonical terms, materializes flat-view rows and writes every destination
//! through chunked, idempotent upserts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use jpx_core::{AttributeCategory, SourcePosting};
use jpx_storage::{ContinuationToken, Item, KeySpec, Projection, SinkStore, SourceStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod aggregate;
pub mod config;
pub mod materialize;
pub mod report;

pub use aggregate::{Aggregator, FrequencyTable, LookupRow, PreparedPosting};
pub use config::{CollectionsConfig, IndexTarget, PipelineConfig, RunMode};
pub use materialize::Materializer;
pub use report::write_run_report;

pub const CRATE_NAME: &str = "jpx-sync";

/// Identifier and status fields read for every posting.
const BASE_FIELDS: &[&str] = &["id", "Id", "jobId", "PK", "status", "processed_date"];

/// Fields carried into the flat view.
const FLAT_VIEW_FIELDS: &[&str] = &[
    "job_title",
    "job_description",
    "company_name",
    "company_size",
    "location",
    "remote_status",
    "salary_mentioned",
    "salary_range",
    "seniority_level",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Scanning,
    Processing,
    Flushing,
    Done,
    Error,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Scanning => "SCANNING",
            PipelineState::Processing => "PROCESSING",
            PipelineState::Flushing => "FLUSHING",
            PipelineState::Done => "DONE",
            PipelineState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingIdentifier,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("posting `{job_id}` could not be encoded: {source}")]
    Encode {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What happened to a single source record.
#[derive(Debug)]
pub enum RecordOutcome {
    Processed { job_id: String, index_rows: usize },
    Skipped(SkipReason),
    Failed(RecordError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteCounts {
    pub flat_view: usize,
    pub index: usize,
    pub lookup: usize,
}

impl WriteCounts {
    pub fn total(&self) -> usize {
        self.flat_view + self.index + self.lookup
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub source_collection: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub as_of: DateTime<Utc>,
    pub dry_run: bool,
    pub pages: usize,
    pub scanned: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Rows produced for the destinations, whether or not they were written.
    pub rows_staged: usize,
    pub written: WriteCounts,
    pub unique_terms: BTreeMap<AttributeCategory, usize>,
    pub state: PipelineState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Scanning,
    Flushing,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Scanning => f.write_str("scanning the source"),
            FailureStage::Flushing => f.write_str("writing destinations"),
        }
    }
}

/// A fatal store fault, with the counts reached before it.
#[derive(Debug, Error)]
#[error("run aborted while {stage}: {source}")]
pub struct RunFailure {
    pub stage: FailureStage,
    pub summary: Box<RunSummary>,
    #[source]
    pub source: StoreError,
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn SourceStore>,
    sink: Arc<dyn SinkStore>,
    flat_key: KeySpec,
    index_key: KeySpec,
    lookup_key: KeySpec,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn SourceStore>,
        sink: Arc<dyn SinkStore>,
    ) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;
        Ok(Self {
            config,
            source,
            sink,
            flat_key: KeySpec::new(["Id"]),
            index_key: KeySpec::new(["PK", "SK"]),
            lookup_key: KeySpec::new(["Id", "Name"]),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Source fields the run reads; everything else stays in the store.
    pub fn projection(&self) -> Projection {
        if !self.config.use_projection {
            return Projection::all();
        }
        let mut fields: Vec<&str> = BASE_FIELDS.to_vec();
        match self.config.mode {
            RunMode::Normalize => {
                fields.extend(AttributeCategory::ALL.iter().map(|c| c.field_name()));
                fields.extend_from_slice(FLAT_VIEW_FIELDS);
            }
            RunMode::IndexOnly => {
                for target in &self.config.collections.indexes {
                    let field = target.category.field_name();
                    if !fields.contains(&field) {
                        fields.push(field);
                    }
                }
            }
        }
        Projection::fields(fields)
    }

    pub async fn run(&self) -> Result<RunSummary, RunFailure> {
        let mut run = Run::new(self);
        let span = info_span!(
            "pipeline_run",
            run_id = %run.summary.run_id,
            source = %self.config.source_collection,
        );
        match run.drive().instrument(span).await {
            Ok(()) => Ok(run.finish()),
            Err((stage, source)) => Err(run.fail(stage, source)),
        }
    }
}

/// Mutable state of one run, owned exclusively by the driver.
struct Run<'a> {
    pipeline: &'a Pipeline,
    state: PipelineState,
    summary: RunSummary,
    aggregator: Aggregator,
    materializer: Materializer,
    flat_buffer: Vec<Item>,
    index_buffers: Vec<Vec<Item>>,
}

impl<'a> Run<'a> {
    fn new(pipeline: &'a Pipeline) -> Self {
        let config = &pipeline.config;
        let targets = config.collections.indexes.clone();
        Self {
            pipeline,
            state: PipelineState::Scanning,
            summary: RunSummary {
                run_id: Uuid::new_v4(),
                mode: config.mode,
                source_collection: config.source_collection.clone(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                as_of: config.as_of,
                dry_run: config.dry_run,
                pages: 0,
                scanned: 0,
                processed: 0,
                skipped: 0,
                failed: 0,
                rows_staged: 0,
                written: WriteCounts::default(),
                unique_terms: BTreeMap::new(),
                state: PipelineState::Scanning,
            },
            index_buffers: vec![Vec::new(); targets.len()],
            aggregator: Aggregator::new(config.as_of, targets),
            materializer: Materializer::new(config.as_of, config.status_window_days),
            flat_buffer: Vec::new(),
        }
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "pipeline state");
            self.state = next;
        }
    }

    async fn drive(&mut self) -> Result<(), (FailureStage, StoreError)> {
        let pipeline = self.pipeline;
        let config = &pipeline.config;
        let projection = pipeline.projection();
        let mut token: Option<ContinuationToken> = None;

        info!(
            mode = ?config.mode,
            as_of = %config.as_of,
            dry_run = config.dry_run,
            "starting normalization run"
        );

        loop {
            self.transition(PipelineState::Scanning);
            let page = pipeline
                .source
                .scan(
                    &config.source_collection,
                    &projection,
                    token.as_ref(),
                    config.page_size,
                )
                .await
                .map_err(|err| (FailureStage::Scanning, err))?;
            self.summary.pages += 1;

            self.transition(PipelineState::Processing);
            for item in page.items {
                self.summary.scanned += 1;
                let outcome = self.process(item);
                self.tally(outcome);
                self.flush(true)
                    .await
                    .map_err(|err| (FailureStage::Flushing, err))?;
            }

            self.transition(PipelineState::Flushing);
            self.flush(false)
                .await
                .map_err(|err| (FailureStage::Flushing, err))?;
            self.sync()
                .await
                .map_err(|err| (FailureStage::Flushing, err))?;

            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        self.transition(PipelineState::Flushing);
        self.write_lookup_tables()
            .await
            .map_err(|err| (FailureStage::Flushing, err))?;
        self.sync()
            .await
            .map_err(|err| (FailureStage::Flushing, err))?;
        self.transition(PipelineState::Done);
        Ok(())
    }

    /// Transforms one record. Nothing is committed unless every row encodes.
    fn process(&mut self, item: Item) -> RecordOutcome {
        let posting = SourcePosting::new(item);
        let Some(job_id) = posting.job_id() else {
            return RecordOutcome::Skipped(SkipReason::MissingIdentifier);
        };

        let prepared = self.aggregator.prepare(&posting, &job_id);

        let flat = match self.pipeline.config.mode {
            RunMode::Normalize => {
                match to_item(&self.materializer.materialize(&posting, &job_id)) {
                    Ok(item) => Some(item),
                    Err(source) => {
                        return RecordOutcome::Failed(RecordError::Encode { job_id, source })
                    }
                }
            }
            RunMode::IndexOnly => None,
        };

        let mut index_items = Vec::with_capacity(prepared.index_rows.len());
        for rows in &prepared.index_rows {
            match rows.iter().map(to_item).collect::<Result<Vec<_>, _>>() {
                Ok(items) => index_items.push(items),
                Err(source) => return RecordOutcome::Failed(RecordError::Encode { job_id, source }),
            }
        }

        self.aggregator.commit(&prepared);
        if let Some(flat) = flat {
            self.flat_buffer.push(flat);
        }
        for (buffer, items) in self.index_buffers.iter_mut().zip(index_items) {
            buffer.extend(items);
        }
        RecordOutcome::Processed {
            index_rows: prepared.index_row_count(),
            job_id,
        }
    }

    fn tally(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Processed { job_id, index_rows } => {
                self.summary.processed += 1;
                debug!(job_id = %job_id, index_rows, "processed posting");
                if self.summary.processed % self.pipeline.config.progress_every == 0 {
                    info!(
                        scanned = self.summary.scanned,
                        processed = self.summary.processed,
                        written = self.summary.written.total(),
                        "progress"
                    );
                }
            }
            RecordOutcome::Skipped(reason) => {
                self.summary.skipped += 1;
                warn!(position = self.summary.scanned, ?reason, "skipping posting");
            }
            RecordOutcome::Failed(err) => {
                self.summary.failed += 1;
                warn!(error = %err, "posting failed, continuing");
            }
        }
    }

    /// Writes buffered rows. With `full_only`, only buffers that reached the
    /// batch size are written.
    async fn flush(&mut self, full_only: bool) -> Result<(), StoreError> {
        let pipeline = self.pipeline;
        let config = &pipeline.config;
        let ready = |len: usize| len > 0 && (!full_only || len >= config.batch_size);
        let before = self.summary.written.total();

        if ready(self.flat_buffer.len()) {
            let items = std::mem::take(&mut self.flat_buffer);
            let written = self
                .write(&config.collections.flat_view, &pipeline.flat_key, items)
                .await?;
            self.summary.written.flat_view += written;
        }

        for (position, target) in config.collections.indexes.iter().enumerate() {
            if !ready(self.index_buffers[position].len()) {
                continue;
            }
            let items = std::mem::take(&mut self.index_buffers[position]);
            let written = self
                .write(&target.collection, &pipeline.index_key, items)
                .await?;
            self.summary.written.index += written;
        }

        if self.summary.written.total() > before {
            info!(
                scanned = self.summary.scanned,
                processed = self.summary.processed,
                written = self.summary.written.total(),
                "flushed"
            );
        }
        Ok(())
    }

    /// Lookup tables need complete counts, so they are written once at end of stream.
    async fn write_lookup_tables(&mut self) -> Result<(), StoreError> {
        let pipeline = self.pipeline;
        let config = &pipeline.config;
        if config.mode != RunMode::Normalize {
            return Ok(());
        }
        for (category, collection) in &config.collections.lookup_tables {
            let items = self
                .aggregator
                .lookup_rows(*category)
                .iter()
                .map(to_item)
                .collect::<Result<Vec<_>, _>>()?;
            let written = self.write(collection, &pipeline.lookup_key, items).await?;
            self.summary.written.lookup += written;
            debug!(%category, collection = %collection, written, "lookup table written");
        }
        Ok(())
    }

    async fn write(
        &mut self,
        collection: &str,
        key: &KeySpec,
        items: Vec<Item>,
    ) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }
        self.summary.rows_staged += items.len();
        let config = &self.pipeline.config;
        if config.dry_run {
            debug!(collection, rows = items.len(), "dry run, not writing");
            return Ok(0);
        }
        write_chunked(
            self.pipeline.sink.as_ref(),
            collection,
            key,
            items,
            config.batch_size,
        )
        .await
    }

    /// Ends a page: everything flushed so far becomes durable.
    async fn sync(&self) -> Result<(), StoreError> {
        if self.pipeline.config.dry_run {
            return Ok(());
        }
        self.pipeline.sink.sync().await
    }

    fn close(&mut self, state: PipelineState) -> RunSummary {
        self.transition(state);
        self.summary.state = state;
        self.summary.finished_at = Utc::now();
        self.summary.unique_terms = self.aggregator.unique_terms();
        self.summary.clone()
    }

    fn finish(mut self) -> RunSummary {
        let summary = self.close(PipelineState::Done);
        info!(
            scanned = summary.scanned,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            written = summary.written.total(),
            "run complete"
        );
        summary
    }

    fn fail(mut self, stage: FailureStage, source: StoreError) -> RunFailure {
        let summary = self.close(PipelineState::Error);
        warn!(%stage, error = %source, scanned = summary.scanned, "run aborted");
        RunFailure {
            stage,
            summary: Box::new(summary),
            source,
        }
    }
}

/// Splits `items` into upserts of at most `batch_size` rows.
pub async fn write_chunked(
    sink: &dyn SinkStore,
    collection: &str,
    key: &KeySpec,
    items: Vec<Item>,
    batch_size: usize,
) -> Result<usize, StoreError> {
    let batch_size = batch_size.clamp(1, jpx_storage::MAX_BATCH_SIZE);
    let mut written = 0;
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        let chunk: Vec<Item> = items.by_ref().take(batch_size).collect();
        written += sink.batch_upsert(collection, key, chunk).await?;
    }
    Ok(written)
}

fn to_item<T: Serialize>(value: &T) -> Result<Item, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(value)?)
}
