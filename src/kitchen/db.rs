use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::Value;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params,
    params_from_iter,
};
use tracing::{debug, info, warn};

use kds_common::fanout::plan_tickets;
use kds_common::lifecycle;
use kds_common::{
    CartItem, Category, CategorySnapshot, FeedCursor, Order, OrderDetail, OrderStatus, OrderType,
    RetentionPolicy, Station, Ticket, TicketItem, TicketItemStatus, TicketStatus, TicketView,
};

use crate::errors::{KdsError, KdsResult};

/// Fixed-width UTC timestamps: lexical order in SQL is chronological order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub const DEFAULT_FEED_LIMIT: u32 = 100;

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp '{}'", raw))
}

/// Async-safe handle to the kitchen database.
///
/// Wraps `KitchenDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<KitchenDb>>,
}

impl DbHandle {
    pub fn new(db: KitchenDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> KdsResult<R>
    where
        F: FnOnce(&KitchenDb) -> KdsResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| KdsError::Internal(format!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| KdsError::Internal(format!("DB task panicked: {}", e)))?
    }
}

/// Retry and lock-wait settings for write transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Total attempts for a write transaction that keeps hitting a busy database.
    pub max_attempts: u32,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            busy_timeout: Duration::from_millis(250),
        }
    }
}

/// Sort order of a station feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedOrder {
    /// Rush first, then oldest first: what a display shows.
    #[default]
    Board,
    /// Oldest change first. Limited pages in this order can be resumed from
    /// the last ticket read.
    Changes,
}

impl FeedOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedOrder::Board => "board",
            FeedOrder::Changes => "changes",
        }
    }
}

impl FromStr for FeedOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "board" => Ok(FeedOrder::Board),
            "changes" => Ok(FeedOrder::Changes),
            other => Err(format!("Invalid feed order '{}': expected board or changes", other)),
        }
    }
}

/// Filter for a station's ticket feed.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketQuery {
    pub station: Station,
    /// Empty means every status.
    pub statuses: Vec<TicketStatus>,
    pub limit: u32,
    /// Only tickets changed after this position. Always read in change order.
    pub after: Option<FeedCursor>,
    pub order: FeedOrder,
}

impl TicketQuery {
    pub fn station(station: Station) -> Self {
        Self {
            station,
            statuses: Vec::new(),
            limit: DEFAULT_FEED_LIMIT,
            after: None,
            order: FeedOrder::Board,
        }
    }

    fn change_order(&self) -> bool {
        self.after.is_some() || self.order == FeedOrder::Changes
    }
}

/// An order handed over by the order pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewOrder {
    pub cart: Vec<CartItem>,
    pub table_label: Option<String>,
    pub delivery_address: Option<String>,
}

impl NewOrder {
    fn normalized(&self) -> KdsResult<NewOrder> {
        if self.cart.is_empty() {
            return Err(KdsError::BadRequest("Order cart is empty".into()));
        }
        let mut cart = Vec::with_capacity(self.cart.len());
        for (index, item) in self.cart.iter().enumerate() {
            let title = item.title.trim();
            if title.is_empty() {
                return Err(KdsError::BadRequest(format!(
                    "Cart item {} has an empty title",
                    index
                )));
            }
            if item.quantity < 1 {
                return Err(KdsError::BadRequest(format!(
                    "Cart item '{}' has quantity {}",
                    title, item.quantity
                )));
            }
            cart.push(CartItem {
                title: title.to_string(),
                ..item.clone()
            });
        }
        Ok(NewOrder {
            cart,
            table_label: non_blank(self.table_label.as_deref()),
            delivery_address: non_blank(self.delivery_address.as_deref()),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub struct KitchenDb {
    conn: Connection,
    options: StoreOptions,
}

impl KitchenDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_options(path, StoreOptions::default())
    }

    pub fn with_options(path: &Path, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal")?;
        let db = Self { conn, options };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn,
            options: StoreOptions::default(),
        };
        db.init()?;
        Ok(db)
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .busy_timeout(self.options.busy_timeout)
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS categories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    station TEXT NOT NULL DEFAULT 'kitchen',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    number INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'preparing',
                    table_label TEXT,
                    delivery_address TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tickets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id INTEGER NOT NULL REFERENCES orders(id),
                    station TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'new',
                    priority INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    changed_at TEXT NOT NULL,
                    UNIQUE(order_id, station)
                );

                CREATE TABLE IF NOT EXISTS ticket_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ticket_id INTEGER NOT NULL REFERENCES tickets(id),
                    position INTEGER NOT NULL,
                    menu_item_id INTEGER,
                    title TEXT NOT NULL,
                    quantity INTEGER NOT NULL DEFAULT 1,
                    instructions TEXT,
                    preparation TEXT,
                    category TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    updated_at TEXT NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_title ON categories(title COLLATE NOCASE);
                CREATE INDEX IF NOT EXISTS idx_tickets_station_updated ON tickets(station, updated_at);
                CREATE INDEX IF NOT EXISTS idx_tickets_station_changed ON tickets(station, changed_at, id);
                CREATE INDEX IF NOT EXISTS idx_tickets_changed ON tickets(changed_at);
                CREATE INDEX IF NOT EXISTS idx_tickets_order ON tickets(order_id);
                CREATE INDEX IF NOT EXISTS idx_ticket_items_ticket ON ticket_items(ticket_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Write transactions ────────────────────────────────────────────

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken before anything is read, so every
    /// read-check-write cascade inside `f` is serialized against other
    /// connections. `f` receives the transaction's timestamp; all rows it
    /// touches share it, and it is later than any change already committed.
    /// Busy/locked failures are retried up to
    /// `max_attempts` in total, then reported as contention.
    fn write_tx<R, F>(&self, op: &'static str, mut f: F) -> KdsResult<R>
    where
        F: FnMut(&Connection, &str) -> KdsResult<R>,
    {
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_write_tx(&mut f) {
                Err(err) if is_busy(&err) && attempt < max_attempts => {
                    warn!(op, attempt, "database busy, retrying write transaction");
                    std::thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
                    attempt += 1;
                }
                Err(err) if is_busy(&err) => {
                    warn!(op, attempts = attempt, "giving up on busy database");
                    return Err(KdsError::Contention { attempts: attempt });
                }
                other => return other,
            }
        }
    }

    fn try_write_tx<R, F>(&self, f: &mut F) -> KdsResult<R>
    where
        F: FnMut(&Connection, &str) -> KdsResult<R>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin write transaction")?;
        let now = next_change_timestamp(&tx)?;
        let value = f(&*tx, now.as_str())?;
        tx.commit().context("Failed to commit write transaction")?;
        Ok(value)
    }

    // ── Categories ────────────────────────────────────────────────────

    pub fn create_category(&self, title: &str, station: Station) -> KdsResult<Category> {
        let title = title.trim();
        if title.is_empty() {
            return Err(KdsError::BadRequest("Category title is empty".into()));
        }
        self.write_tx("create_category", |conn, now| {
            match conn.execute(
                "INSERT INTO categories (title, station, created_at) VALUES (?1, ?2, ?3)",
                params![title, station.as_str(), now],
            ) {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(KdsError::BadRequest(format!(
                        "Category '{}' already exists",
                        title
                    )));
                }
                Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert category").into()),
            }
            Ok(Category {
                id: conn.last_insert_rowid(),
                title: title.to_string(),
                station,
            })
        })
    }

    pub fn list_categories(&self) -> KdsResult<Vec<Category>> {
        Ok(load_categories(&self.conn)?)
    }

    // ── Orders ────────────────────────────────────────────────────────

    /// Persist an order and fan its cart out into station tickets, atomically.
    pub fn create_order(&self, order: &NewOrder) -> KdsResult<OrderDetail> {
        let order = order.normalized()?;
        self.write_tx("create_order", |conn, now| {
            let number: i64 = conn
                .query_row("SELECT COALESCE(MAX(number), 0) + 1 FROM orders", [], |row| {
                    row.get(0)
                })
                .context("Failed to allocate order number")?;
            conn.execute(
                "INSERT INTO orders (number, status, table_label, delivery_address, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    number,
                    OrderStatus::Preparing.as_str(),
                    order.table_label,
                    order.delivery_address,
                    now
                ],
            )
            .context("Failed to insert order")?;
            let order_id = conn.last_insert_rowid();

            let tickets = fan_out(conn, order_id, &order.cart, now)?;
            info!(order_id, number, tickets, items = order.cart.len(), "order fanned out to stations");

            load_order_detail(conn, order_id)?.ok_or(KdsError::OrderNotFound { id: order_id })
        })
    }

    pub fn get_order(&self, id: i64) -> KdsResult<Option<Order>> {
        Ok(load_order(&self.conn, id)?)
    }

    pub fn get_order_detail(&self, id: i64) -> KdsResult<Option<OrderDetail>> {
        Ok(load_order_detail(&self.conn, id)?)
    }

    /// Status write-back from the order pipeline. Cancelling an order cancels
    /// every ticket that is not already completed or cancelled.
    pub fn set_order_status(&self, id: i64, status: OrderStatus) -> KdsResult<OrderDetail> {
        self.write_tx("set_order_status", |conn, now| {
            let order = load_order(conn, id)?.ok_or(KdsError::OrderNotFound { id })?;
            lifecycle::check_order_status_change(&order, status)?;

            if status == OrderStatus::Cancelled {
                for ticket in load_tickets_for_order(conn, id)? {
                    if let Some(forced) = lifecycle::cancel_cascade(ticket.status) {
                        write_ticket_status(conn, ticket.id, forced, now)?;
                        touch_siblings(conn, &ticket, now)?;
                        info!(ticket_id = ticket.id, order_id = id, "ticket cancelled with its order");
                    }
                }
            }
            if status != order.status {
                conn.execute(
                    "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), now, id],
                )
                .context("Failed to update order status")?;
            }

            load_order_detail(conn, id)?.ok_or(KdsError::OrderNotFound { id })
        })
    }

    // ── Ticket reads ──────────────────────────────────────────────────

    /// A station's feed, retention-filtered. Board order puts rush tickets
    /// first, then oldest first. Cursor polls come in change order so a
    /// limited page never skips a ticket.
    pub fn list_station_tickets(
        &self,
        query: &TicketQuery,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> KdsResult<Vec<TicketView>> {
        let mut sql = format!(
            "{} WHERE t.station = ?
               AND NOT (t.status = 'completed' AND t.updated_at < ?)
               AND NOT (t.status = 'cancelled' AND t.updated_at < ?)",
            TICKET_VIEW_SELECT
        );
        let mut values: Vec<Value> = vec![
            Value::Text(query.station.as_str().to_string()),
            Value::Text(format_timestamp(retention.completed_cutoff(now))),
            Value::Text(format_timestamp(retention.cancelled_cutoff(now))),
        ];
        if let Some(after) = query.after {
            let changed_at = format_timestamp(after.changed_at);
            sql.push_str(" AND (t.changed_at > ? OR (t.changed_at = ? AND t.id > ?))");
            values.push(Value::Text(changed_at.clone()));
            values.push(Value::Text(changed_at));
            values.push(Value::Integer(after.ticket_id));
        }
        if !query.statuses.is_empty() {
            let placeholders = vec!["?"; query.statuses.len()].join(", ");
            sql.push_str(&format!(" AND t.status IN ({})", placeholders));
            values.extend(
                query
                    .statuses
                    .iter()
                    .map(|s| Value::Text(s.as_str().to_string())),
            );
        }
        if query.change_order() {
            sql.push_str(" ORDER BY t.changed_at ASC, t.id ASC LIMIT ?");
        } else {
            sql.push_str(" ORDER BY t.priority DESC, t.created_at ASC, t.id ASC LIMIT ?");
        }
        values.push(Value::Integer(i64::from(query.limit)));

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_station_tickets")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), read_ticket_view_row)
            .context("Failed to query station tickets")?;
        let mut tickets = Vec::new();
        for row in rows {
            let r = row.context("Failed to read ticket row")?;
            let items = load_items(&self.conn, r.ticket.id)?;
            tickets.push(r.into_view(items)?);
        }
        debug!(station = %query.station, count = tickets.len(), "station feed loaded");
        Ok(tickets)
    }

    pub fn get_ticket_view(&self, id: i64) -> KdsResult<Option<TicketView>> {
        Ok(load_ticket_view(&self.conn, id)?)
    }

    // ── Ticket mutations ──────────────────────────────────────────────

    /// Staff bump to an arbitrary status. Completing forces every active item
    /// to done; any status change re-evaluates the parent order.
    pub fn bump_ticket(&self, id: i64, target: TicketStatus) -> KdsResult<TicketView> {
        self.write_tx("bump_ticket", |conn, now| {
            let ticket = load_ticket(conn, id)?.ok_or(KdsError::TicketNotFound { id })?;
            lifecycle::check_bump(&ticket)?;
            set_ticket_status(conn, &ticket, target, now)?;
            require_view(conn, id)
        })
    }

    /// Send a completed ticket back to in progress. Item statuses stay as they are.
    pub fn recall_ticket(&self, id: i64) -> KdsResult<TicketView> {
        self.write_tx("recall_ticket", |conn, now| {
            let ticket = load_ticket(conn, id)?.ok_or(KdsError::TicketNotFound { id })?;
            let target = lifecycle::recall_target(&ticket)?;
            set_ticket_status(conn, &ticket, target, now)?;
            require_view(conn, id)
        })
    }

    pub fn set_ticket_priority(&self, id: i64, priority: i32) -> KdsResult<TicketView> {
        if priority < 0 {
            return Err(KdsError::BadRequest(format!(
                "Priority must be 0 or greater, got {}",
                priority
            )));
        }
        self.write_tx("set_ticket_priority", |conn, now| {
            let updated = conn
                .execute(
                    "UPDATE tickets SET priority = ?1, updated_at = ?2, changed_at = ?2 WHERE id = ?3",
                    params![priority, now, id],
                )
                .context("Failed to update ticket priority")?;
            if updated == 0 {
                return Err(KdsError::TicketNotFound { id });
            }
            require_view(conn, id)
        })
    }

    /// Advance an item one step through pending → in progress → done → pending.
    /// Cancelled items ignore the toggle.
    pub fn toggle_item(&self, item_id: i64) -> KdsResult<TicketView> {
        self.write_tx("toggle_item", |conn, now| {
            let (item, ticket) = load_item_with_ticket(conn, item_id)?;
            lifecycle::check_item_change(&ticket)?;
            let next = item.status.toggled();
            if next != item.status {
                write_item_status(conn, item_id, next, now)?;
                settle_ticket(conn, &ticket, now)?;
            }
            require_view(conn, ticket.id)
        })
    }

    pub fn cancel_item(&self, item_id: i64) -> KdsResult<TicketView> {
        self.write_tx("cancel_item", |conn, now| {
            let (item, ticket) = load_item_with_ticket(conn, item_id)?;
            lifecycle::check_item_change(&ticket)?;
            if item.status != TicketItemStatus::Cancelled {
                write_item_status(conn, item_id, TicketItemStatus::Cancelled, now)?;
                settle_ticket(conn, &ticket, now)?;
            }
            require_view(conn, ticket.id)
        })
    }
}

fn is_busy(err: &KdsError) -> bool {
    match err {
        KdsError::Database(e) => e.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<rusqlite::Error>(),
                Some(rusqlite::Error::SqliteFailure(f, _))
                    if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            )
        }),
        _ => false,
    }
}

// ── Fan-out and cascades (run inside a write transaction) ─────────────

/// Create one ticket per station that received items. Returns the ticket count.
fn fan_out(conn: &Connection, order_id: i64, cart: &[CartItem], now: &str) -> KdsResult<usize> {
    let snapshot = CategorySnapshot::new(&load_categories(conn)?);
    let groups = plan_tickets(cart, &snapshot)
        .map_err(|e| KdsError::InvariantViolation(format!("order {}: {}", order_id, e)))?;

    for group in &groups {
        conn.execute(
            "INSERT INTO tickets (order_id, station, status, priority, created_at, updated_at, changed_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4, ?4)",
            params![order_id, group.station.as_str(), TicketStatus::New.as_str(), now],
        )
        .with_context(|| format!("Failed to insert {} ticket", group.station))?;
        let ticket_id = conn.last_insert_rowid();

        for (position, item) in group.items.iter().enumerate() {
            conn.execute(
                "INSERT INTO ticket_items (ticket_id, position, menu_item_id, title, quantity, instructions, preparation, category, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    ticket_id,
                    position as i64,
                    item.menu_item_id,
                    item.title,
                    item.quantity,
                    item.instructions,
                    item.preparation,
                    snapshot.category_label(item),
                    TicketItemStatus::Pending.as_str(),
                    now
                ],
            )
            .context("Failed to insert ticket item")?;
        }
        debug!(order_id, ticket_id, station = %group.station, items = group.items.len(), "ticket created");
    }
    Ok(groups.len())
}

/// Apply a ticket status change and everything it cascades into.
fn set_ticket_status(
    conn: &Connection,
    ticket: &Ticket,
    status: TicketStatus,
    now: &str,
) -> Result<()> {
    write_ticket_status(conn, ticket.id, status, now)?;
    if status == TicketStatus::Completed {
        let forced = conn
            .execute(
                "UPDATE ticket_items SET status = ?1, updated_at = ?2
                 WHERE ticket_id = ?3 AND status IN (?4, ?5)",
                params![
                    TicketItemStatus::Done.as_str(),
                    now,
                    ticket.id,
                    TicketItemStatus::Pending.as_str(),
                    TicketItemStatus::InProgress.as_str()
                ],
            )
            .context("Failed to complete ticket items")?;
        if forced > 0 {
            debug!(ticket_id = ticket.id, forced, "active items forced to done");
        }
    }
    if status != ticket.status {
        info!(ticket_id = ticket.id, from = %ticket.status, to = %status, "ticket status changed");
        touch_siblings(conn, ticket, now)?;
    }
    reconcile_order(conn, ticket.order_id, now)?;
    Ok(())
}

/// Re-derive the ticket's status from its items after one of them changed.
fn settle_ticket(conn: &Connection, ticket: &Ticket, now: &str) -> Result<()> {
    let statuses = item_statuses(conn, ticket.id)?;
    let next = lifecycle::ticket_after_item_change(ticket.status, &statuses);
    if next != ticket.status {
        set_ticket_status(conn, ticket, next, now)
    } else {
        touch_ticket(conn, ticket.id, now)
    }
}

/// Move the order to ready (or back to preparing) from its tickets' statuses.
fn reconcile_order(conn: &Connection, order_id: i64, now: &str) -> Result<Option<OrderStatus>> {
    let order = load_order(conn, order_id)?
        .with_context(|| format!("Order {} missing for its ticket", order_id))?;
    let statuses = ticket_statuses_for_order(conn, order_id)?;
    let next = lifecycle::order_after_ticket_change(order.status, &statuses);
    if next == order.status {
        return Ok(None);
    }
    conn.execute(
        "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![next.as_str(), now, order_id],
    )
    .context("Failed to cascade order status")?;
    info!(order_id, from = %order.status, to = %next, "order status cascaded from tickets");
    Ok(Some(next))
}

fn write_ticket_status(conn: &Connection, id: i64, status: TicketStatus, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE tickets SET status = ?1, updated_at = ?2, changed_at = ?2 WHERE id = ?3",
        params![status.as_str(), now, id],
    )
    .context("Failed to update ticket status")?;
    Ok(())
}

fn write_item_status(conn: &Connection, id: i64, status: TicketItemStatus, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE ticket_items SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now, id],
    )
    .context("Failed to update ticket item status")?;
    Ok(())
}

/// Record a change to the ticket's own items.
fn touch_ticket(conn: &Connection, id: i64, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE tickets SET updated_at = ?1, changed_at = ?1 WHERE id = ?2",
        params![now, id],
    )
    .context("Failed to touch ticket")?;
    Ok(())
}

/// Sibling tickets carry this ticket's status as a derived field. Only their
/// `changed_at` moves, so delta polls deliver the new status while the
/// retention clock in `updated_at` keeps running.
fn touch_siblings(conn: &Connection, ticket: &Ticket, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE tickets SET changed_at = ?1 WHERE order_id = ?2 AND id <> ?3",
        params![now, ticket.order_id, ticket.id],
    )
    .context("Failed to touch sibling tickets")?;
    Ok(())
}

/// Timestamp for a write transaction, strictly after the latest stored
/// change. Writers are serialized by the write lock, so every commit gets a
/// distinct, increasing `changed_at` even when the clock stalls or steps back.
fn next_change_timestamp(conn: &Connection) -> Result<String> {
    let latest: Option<String> = conn
        .query_row("SELECT MAX(changed_at) FROM tickets", [], |row| row.get(0))
        .context("Failed to read latest ticket change")?;
    let mut now = Utc::now().trunc_subsecs(6);
    if let Some(latest) = latest {
        let latest = parse_timestamp(&latest)?;
        if now <= latest {
            now = latest + chrono::Duration::microseconds(1);
        }
    }
    Ok(format_timestamp(now))
}

// ── Reads shared by transactions and plain queries ────────────────────

const TICKET_VIEW_SELECT: &str = "SELECT t.id, t.order_id, t.station, t.status, t.priority, t.created_at, t.updated_at, t.changed_at,
        o.number, o.table_label, o.delivery_address,
        (SELECT s.status FROM tickets s WHERE s.order_id = t.order_id AND s.station <> t.station LIMIT 1)
     FROM tickets t JOIN orders o ON o.id = t.order_id";

const TICKET_SELECT: &str =
    "SELECT id, order_id, station, status, priority, created_at, updated_at, changed_at FROM tickets";

const ITEM_SELECT: &str = "SELECT id, ticket_id, menu_item_id, title, quantity, instructions, preparation, category, status
     FROM ticket_items";

const ORDER_SELECT: &str =
    "SELECT id, number, status, table_label, delivery_address, created_at, updated_at FROM orders";

fn load_categories(conn: &Connection) -> Result<Vec<Category>> {
    let mut stmt = conn
        .prepare("SELECT id, title, station FROM categories ORDER BY id")
        .context("Failed to prepare load_categories")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .context("Failed to query categories")?;
    let mut categories = Vec::new();
    for row in rows {
        let (id, title, station) = row.context("Failed to read category row")?;
        let station = Station::from_str(&station)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse category station")?;
        categories.push(Category { id, title, station });
    }
    Ok(categories)
}

fn load_order(conn: &Connection, id: i64) -> Result<Option<Order>> {
    let row = conn
        .query_row(&format!("{} WHERE id = ?1", ORDER_SELECT), params![id], read_order_row)
        .optional()
        .context("Failed to query order")?;
    row.map(OrderRow::into_order).transpose()
}

fn load_order_detail(conn: &Connection, id: i64) -> Result<Option<OrderDetail>> {
    let order = match load_order(conn, id)? {
        Some(order) => order,
        None => return Ok(None),
    };
    let mut stmt = conn
        .prepare(&format!("{} WHERE t.order_id = ?1 ORDER BY t.id", TICKET_VIEW_SELECT))
        .context("Failed to prepare order tickets")?;
    let rows = stmt
        .query_map(params![id], read_ticket_view_row)
        .context("Failed to query order tickets")?;
    let mut tickets = Vec::new();
    for row in rows {
        let r = row.context("Failed to read ticket row")?;
        let items = load_items(conn, r.ticket.id)?;
        tickets.push(r.into_view(items)?);
    }
    Ok(Some(OrderDetail { order, tickets }))
}

fn load_ticket(conn: &Connection, id: i64) -> Result<Option<Ticket>> {
    let row = conn
        .query_row(&format!("{} WHERE id = ?1", TICKET_SELECT), params![id], read_ticket_row)
        .optional()
        .context("Failed to query ticket")?;
    row.map(TicketRow::into_ticket).transpose()
}

fn load_tickets_for_order(conn: &Connection, order_id: i64) -> Result<Vec<Ticket>> {
    let mut stmt = conn
        .prepare(&format!("{} WHERE order_id = ?1 ORDER BY id", TICKET_SELECT))
        .context("Failed to prepare load_tickets_for_order")?;
    let rows = stmt
        .query_map(params![order_id], read_ticket_row)
        .context("Failed to query order tickets")?;
    let mut tickets = Vec::new();
    for row in rows {
        tickets.push(row.context("Failed to read ticket row")?.into_ticket()?);
    }
    Ok(tickets)
}

fn ticket_statuses_for_order(conn: &Connection, order_id: i64) -> Result<Vec<TicketStatus>> {
    Ok(load_tickets_for_order(conn, order_id)?
        .into_iter()
        .map(|t| t.status)
        .collect())
}

fn load_ticket_view(conn: &Connection, id: i64) -> Result<Option<TicketView>> {
    let row = conn
        .query_row(
            &format!("{} WHERE t.id = ?1", TICKET_VIEW_SELECT),
            params![id],
            read_ticket_view_row,
        )
        .optional()
        .context("Failed to query ticket view")?;
    match row {
        Some(r) => {
            let items = load_items(conn, r.ticket.id)?;
            Ok(Some(r.into_view(items)?))
        }
        None => Ok(None),
    }
}

fn require_view(conn: &Connection, id: i64) -> KdsResult<TicketView> {
    load_ticket_view(conn, id)?.ok_or(KdsError::TicketNotFound { id })
}

fn load_items(conn: &Connection, ticket_id: i64) -> Result<Vec<TicketItem>> {
    let mut stmt = conn
        .prepare(&format!("{} WHERE ticket_id = ?1 ORDER BY position", ITEM_SELECT))
        .context("Failed to prepare load_items")?;
    let rows = stmt
        .query_map(params![ticket_id], read_item_row)
        .context("Failed to query ticket items")?;
    let mut items = Vec::new();
    for row in rows {
        items.push(row.context("Failed to read ticket item row")?.into_item()?);
    }
    Ok(items)
}

fn item_statuses(conn: &Connection, ticket_id: i64) -> Result<Vec<TicketItemStatus>> {
    Ok(load_items(conn, ticket_id)?
        .into_iter()
        .map(|i| i.status)
        .collect())
}

fn load_item_with_ticket(conn: &Connection, item_id: i64) -> KdsResult<(TicketItem, Ticket)> {
    let item = conn
        .query_row(&format!("{} WHERE id = ?1", ITEM_SELECT), params![item_id], read_item_row)
        .optional()
        .context("Failed to query ticket item")?
        .map(ItemRow::into_item)
        .transpose()?
        .ok_or(KdsError::TicketItemNotFound { id: item_id })?;
    let ticket = load_ticket(conn, item.ticket_id)?.ok_or(KdsError::TicketNotFound {
        id: item.ticket_id,
    })?;
    Ok((item, ticket))
}

// ── Row structs ───────────────────────────────────────────────────────

/// Intermediate row struct for reading tickets from SQLite before converting
/// station / status / timestamp strings into typed values.
struct TicketRow {
    id: i64,
    order_id: i64,
    station: String,
    status: String,
    priority: i32,
    created_at: String,
    updated_at: String,
    changed_at: String,
}

fn read_ticket_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TicketRow> {
    Ok(TicketRow {
        id: row.get(0)?,
        order_id: row.get(1)?,
        station: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        changed_at: row.get(7)?,
    })
}

impl TicketRow {
    fn into_ticket(self) -> Result<Ticket> {
        let station = Station::from_str(&self.station)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse ticket station")?;
        let status = TicketStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse ticket status")?;
        Ok(Ticket {
            id: self.id,
            order_id: self.order_id,
            station,
            status,
            priority: self.priority,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            changed_at: parse_timestamp(&self.changed_at)?,
        })
    }
}

/// Ticket joined with its order's derived fields and the sibling's status.
struct TicketViewRow {
    ticket: TicketRow,
    order_number: i64,
    table_label: Option<String>,
    delivery_address: Option<String>,
    sibling_status: Option<String>,
}

fn read_ticket_view_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TicketViewRow> {
    Ok(TicketViewRow {
        ticket: read_ticket_row(row)?,
        order_number: row.get(8)?,
        table_label: row.get(9)?,
        delivery_address: row.get(10)?,
        sibling_status: row.get(11)?,
    })
}

impl TicketViewRow {
    fn into_view(self, items: Vec<TicketItem>) -> Result<TicketView> {
        let sibling_status = self
            .sibling_status
            .map(|s| TicketStatus::from_str(&s).map_err(|e| anyhow::anyhow!(e)))
            .transpose()
            .context("Failed to parse sibling ticket status")?;
        let order_type =
            OrderType::derive(self.table_label.as_deref(), self.delivery_address.as_deref());
        Ok(TicketView {
            ticket: self.ticket.into_ticket()?,
            items,
            order_number: self.order_number,
            table_label: self.table_label,
            order_type,
            sibling_status,
        })
    }
}

struct ItemRow {
    id: i64,
    ticket_id: i64,
    menu_item_id: Option<i64>,
    title: String,
    quantity: i32,
    instructions: Option<String>,
    preparation: Option<String>,
    category: Option<String>,
    status: String,
}

fn read_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        menu_item_id: row.get(2)?,
        title: row.get(3)?,
        quantity: row.get(4)?,
        instructions: row.get(5)?,
        preparation: row.get(6)?,
        category: row.get(7)?,
        status: row.get(8)?,
    })
}

impl ItemRow {
    fn into_item(self) -> Result<TicketItem> {
        let status = TicketItemStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse ticket item status")?;
        Ok(TicketItem {
            id: self.id,
            ticket_id: self.ticket_id,
            menu_item_id: self.menu_item_id,
            title: self.title,
            quantity: self.quantity,
            instructions: self.instructions,
            preparation: self.preparation,
            category: self.category,
            status,
        })
    }
}

struct OrderRow {
    id: i64,
    number: i64,
    status: String,
    table_label: Option<String>,
    delivery_address: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_order_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRow> {
    Ok(OrderRow {
        id: row.get(0)?,
        number: row.get(1)?,
        status: row.get(2)?,
        table_label: row.get(3)?,
        delivery_address: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl OrderRow {
    fn into_order(self) -> Result<Order> {
        let status = OrderStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse order status")?;
        let order_type =
            OrderType::derive(self.table_label.as_deref(), self.delivery_address.as_deref());
        Ok(Order {
            id: self.id,
            number: self.number,
            status,
            table_label: self.table_label,
            delivery_address: self.delivery_address,
            order_type,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
