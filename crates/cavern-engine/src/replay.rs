//! Bulk replay of historical reports from a newline-delimited JSON stream.
//!
//! Each non-blank line is one [`HistoricalReport`]:
//!
//! ```json
//! {"user":7,"coord":{"x":3,"y":4},"item":"spider","at":"2026-10-14T12:00:00Z"}
//! ```
//!
//! Lines that fail to parse are logged and skipped. Parsed reports are fed to
//! the engine in batches so one bad batch never holds the epoch lock for the
//! whole stream.

use cavern_core::{Engine, IngestSummary};
use cavern_db::DurableStore;
use cavern_types::HistoricalReport;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::ServiceError;

/// Reports handed to the engine per lock acquisition.
pub const BATCH_SIZE: usize = 1000;

/// Totals across every batch of a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayTotals {
    /// Lines that did not parse.
    pub malformed: u64,
    /// Sum of the engine's per-batch summaries.
    pub ingested: IngestSummary,
}

/// Parse one line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<HistoricalReport>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

/// Read `reader` to the end, ingesting every report into `engine`.
pub async fn replay<D, R>(engine: &Engine<D>, reader: R) -> Result<ReplayTotals, ServiceError>
where
    D: DurableStore,
    R: AsyncBufRead + Unpin,
{
    let mut totals = ReplayTotals::default();
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let mut lines = reader.lines();
    let mut line_no: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        line_no = line_no.saturating_add(1);
        match parse_line(&line) {
            Ok(Some(report)) => batch.push(report),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping malformed replay line");
                totals.malformed = totals.malformed.saturating_add(1);
            }
        }
        if batch.len() >= BATCH_SIZE {
            let summary = engine.ingest_historical(batch.drain(..)).await?;
            accumulate(&mut totals.ingested, &summary);
        }
    }
    if !batch.is_empty() {
        let summary = engine.ingest_historical(batch).await?;
        accumulate(&mut totals.ingested, &summary);
    }

    tracing::info!(
        lines = line_no,
        applied = totals.ingested.applied,
        unchanged = totals.ingested.unchanged,
        rejected = totals.ingested.rejected,
        stale = totals.ingested.stale,
        malformed = totals.malformed,
        "Replay complete"
    );
    Ok(totals)
}

fn accumulate(total: &mut IngestSummary, batch: &IngestSummary) {
    total.applied = total.applied.saturating_add(batch.applied);
    total.unchanged = total.unchanged.saturating_add(batch.unchanged);
    total.rejected = total.rejected.saturating_add(batch.rejected);
    total.stale = total.stale.saturating_add(batch.stale);
    total.newest = total.newest.max(batch.newest);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use cavern_core::{Clock, EngineSettings, ManualClock, NoReplay};
    use cavern_db::MemoryDurableStore;
    use cavern_types::{Coord, ItemType, UserId};
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_line("   ").unwrap().is_none());
        let report = parse_line(
            r#"{"user":7,"coord":{"x":3,"y":4},"item":"spider","at":"2026-10-14T12:00:00Z"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(report.user, UserId(7));
        assert_eq!(report.coord, Coord::new(3, 4));
        assert_eq!(report.item, ItemType::Spider);
        assert!(parse_line("{not json").is_err());
    }

    #[tokio::test]
    async fn replay_counts_malformed_lines_and_ingests_the_rest() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 14, 18, 0, 0).single().unwrap(),
        ));
        let engine = Engine::open(
            MemoryDurableStore::new(),
            EngineSettings::default(),
            clock,
            Arc::new(NoReplay),
        )
        .await
        .unwrap();

        let input = concat!(
            r#"{"user":1,"coord":{"x":1,"y":1},"item":"spider","at":"2026-10-14T12:00:00Z"}"#,
            "\n\n",
            "garbage\n",
            r#"{"user":2,"coord":{"x":1,"y":1},"item":"spider","at":"2026-10-14T13:00:00Z"}"#,
            "\n",
        );
        let totals = replay(&engine, input.as_bytes()).await.unwrap();

        assert_eq!(totals.malformed, 1);
        assert_eq!(totals.ingested.applied, 2);
        assert_eq!(engine.dominant_type(Coord::new(1, 1)).await, ItemType::Spider);
        assert_eq!(
            engine.last_scan().await,
            Utc.with_ymd_and_hms(2026, 10, 14, 13, 0, 0).single()
        );
    }
}
