//! Client-side accumulating ticket cache fed by delta polls.
//!
//! The first sync replaces local state with the server snapshot. Every later
//! sync merges by ticket id: tickets in the batch overwrite their local copy
//! unless the local copy is newer, tickets absent from the batch are left as
//! they are. The cursor handed to the next poll only ever moves forward.
//!
//! The cursor is a position in the station's change stream, `(changed_at,
//! ticket id)`. The server returns cursor polls in that order, so a poll cut
//! short by its limit resumes exactly where it stopped.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{Station, Ticket, TicketView};
use crate::retention::RetentionPolicy;

/// Last position read from a station's change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedCursor {
    pub changed_at: DateTime<Utc>,
    pub ticket_id: i64,
}

impl FeedCursor {
    pub fn of(ticket: &Ticket) -> Self {
        Self {
            changed_at: ticket.changed_at,
            ticket_id: ticket.id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// True when the batch replaced local state (first sync).
    pub full_refresh: bool,
    /// Ticket ids not seen before this batch. Empty on a full refresh.
    pub new_ticket_ids: Vec<i64>,
    pub updated: usize,
    /// Batch entries older than the local copy, discarded.
    pub stale: usize,
}

impl MergeOutcome {
    /// Fold in the outcome of the next page of the same poll. Tickets first
    /// seen on later pages of a full refresh are part of the snapshot.
    pub fn absorb(&mut self, page: MergeOutcome) {
        if self.full_refresh {
            self.updated += page.updated + page.new_ticket_ids.len();
        } else {
            self.updated += page.updated;
            self.new_ticket_ids.extend(page.new_ticket_ids);
            self.new_ticket_ids.sort_unstable();
        }
        self.stale += page.stale;
    }
}

#[derive(Debug, Clone, Default)]
pub struct TicketFeed {
    tickets: HashMap<i64, TicketView>,
    cursor: Option<FeedCursor>,
    initialized: bool,
}

impl TicketFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the next poll resumes. `None` asks for a full snapshot.
    pub fn cursor(&self) -> Option<FeedCursor> {
        self.cursor
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&TicketView> {
        self.tickets.get(&id)
    }

    pub fn apply(&mut self, batch: Vec<TicketView>) -> MergeOutcome {
        let batch_max = batch.iter().map(|t| FeedCursor::of(&t.ticket)).max();
        let mut outcome = MergeOutcome::default();

        if !self.initialized {
            self.tickets = batch.into_iter().map(|t| (t.ticket.id, t)).collect();
            self.initialized = true;
            outcome.full_refresh = true;
            outcome.updated = self.tickets.len();
        } else {
            for incoming in batch {
                let id = incoming.ticket.id;
                match self.tickets.get(&id) {
                    Some(local) if local.ticket.changed_at > incoming.ticket.changed_at => {
                        outcome.stale += 1;
                    }
                    Some(_) => {
                        self.tickets.insert(id, incoming);
                        outcome.updated += 1;
                    }
                    None => {
                        self.tickets.insert(id, incoming);
                        outcome.new_ticket_ids.push(id);
                    }
                }
            }
            outcome.new_ticket_ids.sort_unstable();
        }

        if let Some(max) = batch_max {
            self.cursor = Some(self.cursor.map_or(max, |c| c.max(max)));
        }
        outcome
    }

    /// Drop terminal tickets that have aged out of the retention window.
    /// Returns how many were removed.
    pub fn prune_stale(&mut self, policy: &RetentionPolicy, now: DateTime<Utc>) -> usize {
        let before = self.tickets.len();
        self.tickets
            .retain(|_, t| policy.is_visible(t.ticket.status, t.ticket.updated_at, now));
        before - self.tickets.len()
    }

    /// Display order: rush tickets first, otherwise oldest first.
    pub fn tickets(&self) -> Vec<&TicketView> {
        let mut tickets: Vec<&TicketView> = self.tickets.values().collect();
        tickets.sort_by(|a, b| {
            b.ticket
                .priority
                .cmp(&a.ticket.priority)
                .then(a.ticket.created_at.cmp(&b.ticket.created_at))
                .then(a.ticket.id.cmp(&b.ticket.id))
        });
        tickets
    }

    pub fn for_station(&self, station: Station) -> Vec<&TicketView> {
        self.tickets()
            .into_iter()
            .filter(|t| t.ticket.station == station)
            .collect()
    }
}
