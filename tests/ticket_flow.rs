//! End-to-end ticket flows against a file-backed database, including two
//! stations racing to finish the same order from separate connections.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kds::errors::KdsError;
use kds::kitchen::db::{FeedOrder, KitchenDb, NewOrder, StoreOptions, TicketQuery};
use kds::kitchen::poller::{PollEvent, PollerSettings, StationPoller, TicketSource};
use kds_common::{
    CartItem, FeedCursor, OrderDetail, OrderStatus, RetentionPolicy, Station, TicketFeed,
    TicketStatus, TicketView,
};

fn seeded(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("kds.db");
    let db = KitchenDb::new(&path).unwrap();
    db.create_category("Burgers", Station::Kitchen).unwrap();
    db.create_category("Drinks", Station::Bar).unwrap();
    path
}

fn burger_and_cola() -> NewOrder {
    NewOrder {
        cart: vec![
            CartItem::new("Cheeseburger", 1).with_category_title("Burgers"),
            CartItem::new("Cola", 2).with_category_title("Drinks"),
        ],
        ..NewOrder::default()
    }
}

fn item_for(detail: &OrderDetail, station: Station) -> i64 {
    detail
        .tickets
        .iter()
        .find(|t| t.ticket.station == station)
        .unwrap()
        .items[0]
        .id
}

#[test]
fn concurrent_station_completion_marks_order_ready() {
    let dir = TempDir::new().unwrap();
    let path = seeded(&dir);

    for _ in 0..10 {
        let detail = KitchenDb::new(&path)
            .unwrap()
            .create_order(&burger_and_cola())
            .unwrap();
        let order_id = detail.order.id;

        // Both items one toggle away from done.
        let setup = KitchenDb::new(&path).unwrap();
        let kitchen_item = item_for(&detail, Station::Kitchen);
        let bar_item = item_for(&detail, Station::Bar);
        setup.toggle_item(kitchen_item).unwrap();
        setup.toggle_item(bar_item).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let workers: Vec<_> = [kitchen_item, bar_item]
            .into_iter()
            .map(|item_id| {
                let path = path.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let options = StoreOptions {
                        max_attempts: 5,
                        busy_timeout: Duration::from_secs(5),
                    };
                    let db = KitchenDb::with_options(&path, options).unwrap();
                    barrier.wait();
                    db.toggle_item(item_id).unwrap()
                })
            })
            .collect();

        for worker in workers {
            let view = worker.join().unwrap();
            assert_eq!(view.ticket.status, TicketStatus::Completed);
        }

        let order = setup.get_order(order_id).unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Ready);
    }
}

#[test]
fn locked_database_surfaces_contention() {
    let dir = TempDir::new().unwrap();
    let path = seeded(&dir);
    let detail = KitchenDb::new(&path)
        .unwrap()
        .create_order(&burger_and_cola())
        .unwrap();

    let options = StoreOptions {
        max_attempts: 2,
        busy_timeout: Duration::from_millis(0),
    };
    let db = KitchenDb::with_options(&path, options).unwrap();

    let blocker = Connection::open(&path).unwrap();
    let _guard =
        rusqlite::Transaction::new_unchecked(&blocker, TransactionBehavior::Immediate).unwrap();

    let err = db.toggle_item(item_for(&detail, Station::Bar)).unwrap_err();
    assert!(matches!(err, KdsError::Contention { attempts: 2 }));
    assert!(err.is_retryable());
}

#[test]
fn display_feed_follows_the_order_through_delta_polls() {
    let dir = TempDir::new().unwrap();
    let path = seeded(&dir);
    let db = KitchenDb::new(&path).unwrap();
    let retention = RetentionPolicy::default();

    let first = db.create_order(&burger_and_cola()).unwrap();

    let mut feed = TicketFeed::new();
    let snapshot = db
        .list_station_tickets(&TicketQuery::station(Station::Bar), &retention, Utc::now())
        .unwrap();
    let outcome = feed.apply(snapshot);
    assert!(outcome.full_refresh);
    assert_eq!(feed.len(), 1);

    let second = db.create_order(&burger_and_cola()).unwrap();
    db.toggle_item(item_for(&first, Station::Bar)).unwrap();

    let mut query = TicketQuery::station(Station::Bar);
    query.after = feed.cursor();
    let delta = db.list_station_tickets(&query, &retention, Utc::now()).unwrap();
    assert_eq!(delta.len(), 2);

    let outcome = feed.apply(delta);
    let second_bar = second
        .tickets
        .iter()
        .find(|t| t.ticket.station == Station::Bar)
        .unwrap()
        .ticket
        .id;
    assert_eq!(outcome.new_ticket_ids, vec![second_bar]);
    assert_eq!(outcome.updated, 1);

    let board = feed.for_station(Station::Bar);
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].ticket.order_id, first.order.id);
    assert_eq!(board[0].ticket.status, TicketStatus::InProgress);
}

#[test]
fn cancelled_order_tickets_leave_the_feed_after_five_minutes() {
    let dir = TempDir::new().unwrap();
    let path = seeded(&dir);
    let db = KitchenDb::new(&path).unwrap();
    let retention = RetentionPolicy::default();

    let detail = db.create_order(&burger_and_cola()).unwrap();
    db.set_order_status(detail.order.id, OrderStatus::Cancelled)
        .unwrap();

    let query = TicketQuery::station(Station::Kitchen);
    let now = Utc::now();
    let visible = db.list_station_tickets(&query, &retention, now).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].ticket.status, TicketStatus::Cancelled);

    let later = now + chrono::Duration::minutes(6);
    assert!(db.list_station_tickets(&query, &retention, later).unwrap().is_empty());
}

/// Serves the station feed straight from the database, the way the HTTP
/// handler builds its query.
struct DbSource {
    db: Mutex<KitchenDb>,
}

#[async_trait]
impl TicketSource for DbSource {
    async fn fetch(
        &self,
        station: Station,
        after: Option<FeedCursor>,
        limit: u32,
    ) -> anyhow::Result<Vec<TicketView>> {
        let query = TicketQuery {
            limit,
            after,
            order: FeedOrder::Changes,
            ..TicketQuery::station(station)
        };
        let db = self.db.lock().unwrap();
        Ok(db.list_station_tickets(&query, &RetentionPolicy::default(), Utc::now())?)
    }
}

#[tokio::test]
async fn small_pages_still_deliver_every_ticket_to_the_display() {
    let dir = TempDir::new().unwrap();
    let path = seeded(&dir);
    let db = KitchenDb::new(&path).unwrap();

    let burger = || NewOrder {
        cart: vec![CartItem::new("Cheeseburger", 1).with_category_title("Burgers")],
        ..NewOrder::default()
    };
    let oldest = db.create_order(&burger()).unwrap();
    db.create_order(&burger()).unwrap();
    db.create_order(&burger()).unwrap();
    // The oldest ticket now has the newest change but still sorts first on the board.
    db.toggle_item(item_for(&oldest, Station::Kitchen)).unwrap();

    let source = Arc::new(DbSource { db: Mutex::new(db) });
    let settings = PollerSettings {
        interval: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        failure_threshold: 3,
        page_size: 2,
    };
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = StationPoller::new(source.clone(), Station::Kitchen, settings).spawn(tx, cancel.clone());

    let board = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let PollEvent::Synced { board, .. } = event {
            break board;
        }
    };
    assert_eq!(board.len(), 3);
    assert_eq!(board[0].ticket.order_id, oldest.order.id);
    assert_eq!(board[0].ticket.status, TicketStatus::InProgress);

    let fourth = source.db.lock().unwrap().create_order(&burger()).unwrap();
    let ids = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let PollEvent::NewTickets { ids } = event {
            break ids;
        }
    };
    assert_eq!(ids, vec![fourth.tickets[0].ticket.id]);

    cancel.cancel();
    let feed = handle.await.unwrap();
    assert_eq!(feed.len(), 4);
}
