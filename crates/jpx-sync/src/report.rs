use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::RunSummary;

/// Writes `<reports_dir>/<run_id>/summary.json` and `brief.md`.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let mut json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    json.push(b'\n');
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    fs::write(run_dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;

    Ok(run_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let unique_terms = summary
        .unique_terms
        .iter()
        .map(|(category, count)| format!("- {category}: {count}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# JPX Run Brief\n\n\
         - Run ID: `{}`\n\
         - Source: `{}`\n\
         - Mode: {:?}\n\
         - State: {}\n\
         - Started: {}\n\
         - Finished: {}\n\
         - Run clock: {}\n\
         - Dry run: {}\n\n\
         ## Records\n\
         - Pages: {}\n\
         - Scanned: {}\n\
         - Processed: {}\n\
         - Skipped: {}\n\
         - Failed: {}\n\n\
         ## Rows\n\
         - Staged: {}\n\
         - Flat view written: {}\n\
         - Index written: {}\n\
         - Lookup written: {}\n\n\
         ## Unique Terms\n{}\n",
        summary.run_id,
        summary.source_collection,
        summary.mode,
        summary.state,
        summary.started_at,
        summary.finished_at,
        summary.as_of,
        summary.dry_run,
        summary.pages,
        summary.scanned,
        summary.processed,
        summary.skipped,
        summary.failed,
        summary.rows_staged,
        summary.written.flat_view,
        summary.written.index,
        summary.written.lookup,
        unique_terms,
    )
}
