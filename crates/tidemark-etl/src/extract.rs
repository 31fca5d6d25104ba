//! Pagination driver
//!
//! Turns a windowed, page-limited extraction primitive ([`PageSource`]) into
//! one strictly ascending stream of rows pushed into a channel.
//!
//! A full page may cut a timestamp group in half, so the rows sharing the
//! page's maximum timestamp are withheld and fetched again, complete, with the
//! next page. The next fetch starts after the last emitted timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{EtlError, Result};
use crate::progress::{EventCallback, ExtractEvent, PageInfo};
use crate::row::EtlRow;

/// Extraction primitive implemented by source adapters
#[async_trait]
pub trait PageSource<R: EtlRow>: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `limit` rows with timestamps in `(since, until]`, ascending
    async fn extract_page(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<R>>;
}

/// What one extraction run handed downstream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractSummary {
    pub pages: u32,
    pub rows_emitted: u64,
    pub last_emitted_at: Option<DateTime<Utc>>,
    /// Set when every receiver went away before the window was exhausted
    pub receivers_closed: bool,
}

pub struct PageExtractor<R: EtlRow> {
    source: Arc<dyn PageSource<R>>,
    limit: usize,
}

impl<R: EtlRow> Clone for PageExtractor<R> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            limit: self.limit,
        }
    }
}

impl<R: EtlRow> PageExtractor<R> {
    pub fn new(source: Arc<dyn PageSource<R>>, limit: usize) -> Self {
        Self {
            source,
            limit: limit.max(1),
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Extract `(since, until]` page by page into `tx`.
    ///
    /// Failures are reported as [`ExtractEvent::Failed`] before being
    /// returned. Rows already sent stay sent; they always form complete
    /// timestamp groups.
    pub async fn extract(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        tx: mpsc::Sender<R>,
        on_event: EventCallback<'_, ExtractEvent>,
    ) -> Result<ExtractSummary> {
        match self.run(group_id, since, until, &tx, on_event).await {
            Ok(summary) => {
                info!(
                    extractor = self.name(),
                    group_id,
                    pages = summary.pages,
                    rows = summary.rows_emitted,
                    "extraction completed"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(extractor = self.name(), group_id, error = %e, "extraction failed");
                on_event(ExtractEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        tx: &mpsc::Sender<R>,
        on_event: EventCallback<'_, ExtractEvent>,
    ) -> Result<ExtractSummary> {
        let mut summary = ExtractSummary::default();
        let mut cursor = since;

        while cursor < until {
            summary.pages += 1;
            let page = summary.pages;
            let started = Instant::now();

            debug!(extractor = self.name(), page, since = %cursor, "fetching page");
            let rows = self
                .source
                .extract_page(group_id, cursor, until, self.limit)
                .await?;

            check_ascending(&rows, summary.last_emitted_at)?;

            let fetched = rows.len();
            let full = fetched >= self.limit;
            let emit_count = if full {
                let safe = safe_prefix_len(&rows);
                if safe == 0 {
                    return Err(EtlError::PageBoundaryAmbiguity {
                        limit: self.limit,
                        page,
                    });
                }
                safe
            } else {
                fetched
            };

            let mut emitted = 0;
            for row in rows.into_iter().take(emit_count) {
                let ts = row.timestamp();
                if tx.send(row).await.is_err() {
                    debug!(extractor = self.name(), page, "all receivers closed, stopping extraction");
                    summary.receivers_closed = true;
                    return Ok(summary);
                }
                emitted += 1;
                summary.rows_emitted += 1;
                summary.last_emitted_at = Some(ts);
                cursor = ts;
            }

            on_event(ExtractEvent::PageExtracted(PageInfo {
                page,
                rows_fetched: fetched,
                rows_emitted: emitted,
                cursor,
                duration: started.elapsed(),
            }));
            debug!(
                extractor = self.name(),
                page,
                fetched,
                emitted,
                cursor = %cursor,
                "page extracted"
            );

            if !full {
                break;
            }
        }

        Ok(summary)
    }
}

/// Fail on the first timestamp lower than its predecessor, starting from
/// the last timestamp emitted by an earlier page.
fn check_ascending<R: EtlRow>(rows: &[R], mut previous: Option<DateTime<Utc>>) -> Result<()> {
    for row in rows {
        let current = row.timestamp();
        if let Some(previous) = previous {
            if current < previous {
                return Err(EtlError::ordering(current, previous));
            }
        }
        previous = Some(current);
    }
    Ok(())
}

/// Length of the prefix strictly below the page's maximum timestamp.
///
/// Assumes `rows` is ascending.
fn safe_prefix_len<R: EtlRow>(rows: &[R]) -> usize {
    match rows.last() {
        Some(last) => {
            let max = last.timestamp();
            rows.iter().take_while(|row| row.timestamp() < max).count()
        }
        None => 0,
    }
}
