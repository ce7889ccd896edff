//! Station display client: delta polling against the ticket feed.
//!
//! A [`StationPoller`] runs as one tokio task per display. Every tick it asks
//! its [`TicketSource`] for tickets changed after the feed cursor, one page at
//! a time in change order, until a page comes back short, and merges each page
//! into a [`TicketFeed`]. Consecutive failures back the interval off
//! exponentially (capped) and, past a threshold, raise a single
//! connection-lost event until the next successful poll.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kds_common::{FeedCursor, MergeOutcome, RetentionPolicy, Role, Station, TicketFeed, TicketView};

use super::api::ROLE_HEADER;
use super::db::{DEFAULT_FEED_LIMIT, FeedOrder};

/// Where a poller gets its tickets from.
#[async_trait]
pub trait TicketSource: Send + Sync {
    /// Up to `limit` tickets changed after `after` (everything when `None`),
    /// oldest change first.
    async fn fetch(
        &self,
        station: Station,
        after: Option<FeedCursor>,
        limit: u32,
    ) -> Result<Vec<TicketView>>;
}

/// Reads the station feed from a running `kds serve`.
pub struct HttpTicketSource {
    client: reqwest::Client,
    base_url: String,
    role: Role,
}

impl HttpTicketSource {
    pub fn new(base_url: &str, role: Role, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            role,
        })
    }
}

#[async_trait]
impl TicketSource for HttpTicketSource {
    async fn fetch(
        &self,
        station: Station,
        after: Option<FeedCursor>,
        limit: u32,
    ) -> Result<Vec<TicketView>> {
        let mut query = vec![
            ("station", station.as_str().to_string()),
            ("order", FeedOrder::Changes.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(after) = after {
            query.push((
                "updated_after",
                after.changed_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ));
            query.push(("after_id", after.ticket_id.to_string()));
        }
        let url = format!("{}/api/tickets", self.base_url);
        self.client
            .get(&url)
            .header(ROLE_HEADER, self.role.as_str())
            .query(&query)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?
            .error_for_status()
            .context("Ticket feed returned error status")?
            .json::<Vec<TicketView>>()
            .await
            .context("Failed to parse ticket feed response")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub interval: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures before the connection is reported lost.
    pub failure_threshold: u32,
    /// Tickets per request. A full page is followed by the next one at once.
    pub page_size: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(3000),
            max_backoff: Duration::from_millis(30_000),
            failure_threshold: 3,
            page_size: DEFAULT_FEED_LIMIT,
        }
    }
}

/// Delay before the next poll after `failures` consecutive errors.
pub fn backoff_delay(settings: &PollerSettings, failures: u32) -> Duration {
    if failures == 0 {
        return settings.interval;
    }
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    settings
        .interval
        .checked_mul(factor)
        .unwrap_or(settings.max_backoff)
        .min(settings.max_backoff)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// A poll succeeded. `board` is the station's display order after the merge.
    Synced {
        board: Vec<TicketView>,
        outcome: MergeOutcome,
        pruned: usize,
    },
    /// Tickets this display has not seen before. Never sent for the first sync.
    NewTickets { ids: Vec<i64> },
    ConnectionLost { failures: u32, error: String },
    ConnectionRestored,
}

pub struct StationPoller {
    source: Arc<dyn TicketSource>,
    station: Station,
    settings: PollerSettings,
    retention: RetentionPolicy,
    feed: TicketFeed,
}

impl StationPoller {
    pub fn new(source: Arc<dyn TicketSource>, station: Station, settings: PollerSettings) -> Self {
        Self {
            source,
            station,
            settings,
            retention: RetentionPolicy::default(),
            feed: TicketFeed::new(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn spawn(
        self,
        events: mpsc::Sender<PollEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<TicketFeed> {
        tokio::spawn(self.run(events, cancel))
    }

    /// Poll until cancelled or the event receiver is dropped; returns the feed.
    pub async fn run(mut self, events: mpsc::Sender<PollEvent>, cancel: CancellationToken) -> TicketFeed {
        let mut failures: u32 = 0;
        let mut lost = false;
        info!(station = %self.station, "station poller started");

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.pull() => result,
            };

            match result {
                Ok(outcome) => {
                    if lost {
                        info!(station = %self.station, "connection restored");
                        if !emit(&events, &cancel, PollEvent::ConnectionRestored).await {
                            break;
                        }
                    }
                    failures = 0;
                    lost = false;
                    if !self.publish(outcome, &events, &cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(station = %self.station, failures, error = %format!("{:#}", e), "poll failed");
                    if failures >= self.settings.failure_threshold && !lost {
                        lost = true;
                        let event = PollEvent::ConnectionLost {
                            failures,
                            error: format!("{:#}", e),
                        };
                        if !emit(&events, &cancel, event).await {
                            break;
                        }
                    }
                }
            }

            let delay = backoff_delay(&self.settings, failures);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(station = %self.station, tickets = self.feed.len(), "station poller stopped");
        self.feed
    }

    /// Read pages from the cursor until one comes back short, merging each.
    /// A failure after the first page keeps what was merged; the next tick
    /// resumes from the cursor.
    async fn pull(&mut self) -> Result<MergeOutcome> {
        let limit = self.settings.page_size.max(1);
        let mut total: Option<MergeOutcome> = None;
        loop {
            let before = self.feed.cursor();
            let batch = match self.source.fetch(self.station, before, limit).await {
                Ok(batch) => batch,
                Err(e) => match total {
                    Some(total) => {
                        warn!(station = %self.station, error = %format!("{:#}", e), "page fetch failed, keeping earlier pages");
                        return Ok(total);
                    }
                    None => return Err(e),
                },
            };
            let full_page = batch.len() >= limit as usize;
            let outcome = self.feed.apply(batch);
            match total.as_mut() {
                Some(total) => total.absorb(outcome),
                None => total = Some(outcome),
            }
            if !full_page || self.feed.cursor() == before {
                break;
            }
            debug!(station = %self.station, "full page, fetching the next one");
        }
        Ok(total.unwrap_or_default())
    }

    /// Prune and publish a merged poll. False once the consumer is gone.
    async fn publish(
        &mut self,
        outcome: MergeOutcome,
        events: &mpsc::Sender<PollEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        let pruned = self.feed.prune_stale(&self.retention, Utc::now());
        debug!(
            station = %self.station,
            full_refresh = outcome.full_refresh,
            updated = outcome.updated,
            stale = outcome.stale,
            pruned,
            "feed merged"
        );

        if !outcome.new_ticket_ids.is_empty() {
            let ids = outcome.new_ticket_ids.clone();
            if !emit(events, cancel, PollEvent::NewTickets { ids }).await {
                return false;
            }
        }
        let board = self
            .feed
            .for_station(self.station)
            .into_iter()
            .cloned()
            .collect();
        emit(
            events,
            cancel,
            PollEvent::Synced {
                board,
                outcome,
                pruned,
            },
        )
        .await
    }
}

/// Send unless cancelled first. False when the poller should stop.
async fn emit(
    events: &mpsc::Sender<PollEvent>,
    cancel: &CancellationToken,
    event: PollEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}
