//! Station classification for cart line items.
//!
//! Resolution order: exact category id, then case-insensitive exact category
//! title, then the kitchen default. Every item lands in a station; taking the
//! default is logged so a misconfigured category list shows up in the logs.

use std::collections::HashMap;

use tracing::warn;

use crate::models::{CartItem, Category, Station};

/// Station every unmatched item falls back to.
pub const DEFAULT_STATION: Station = Station::Kitchen;

/// Which rule picked the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    CategoryId,
    CategoryTitle,
    Default,
}

/// Point-in-time copy of the category table used for one fan-out.
#[derive(Debug, Clone, Default)]
pub struct CategorySnapshot {
    by_id: HashMap<i64, Category>,
    by_title: HashMap<String, i64>,
}

impl CategorySnapshot {
    pub fn new(categories: &[Category]) -> Self {
        let mut snapshot = Self::default();
        for category in categories {
            snapshot
                .by_title
                .entry(category.title.to_lowercase())
                .or_insert(category.id);
            snapshot.by_id.insert(category.id, category.clone());
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn matched(&self, item: &CartItem) -> Option<(&Category, Resolution)> {
        if let Some(category) = item.category_id.and_then(|id| self.by_id.get(&id)) {
            return Some((category, Resolution::CategoryId));
        }
        item.category_title
            .as_deref()
            .and_then(|title| self.by_title.get(&title.to_lowercase()))
            .and_then(|id| self.by_id.get(id))
            .map(|category| (category, Resolution::CategoryTitle))
    }

    pub fn resolve(&self, item: &CartItem) -> (Station, Resolution) {
        match self.matched(item) {
            Some((category, resolution)) => (category.station, resolution),
            None => (DEFAULT_STATION, Resolution::Default),
        }
    }

    /// Category label shown on the ticket item: the matched category's title,
    /// else whatever title the cart line carried.
    pub fn category_label<'a>(&'a self, item: &'a CartItem) -> Option<&'a str> {
        self.matched(item)
            .map(|(category, _)| category.title.as_str())
            .or(item.category_title.as_deref())
    }

    pub fn classify(&self, item: &CartItem) -> Station {
        let (station, resolution) = self.resolve(item);
        if resolution == Resolution::Default {
            warn!(
                title = %item.title,
                category_id = ?item.category_id,
                category_title = ?item.category_title,
                station = %station,
                "no category matched cart item, using default station"
            );
        }
        station
    }
}
