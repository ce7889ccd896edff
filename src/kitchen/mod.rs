//! Kitchen display back-end.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────────┐  HTTP  ┌──────────────────────────────────────────────┐
//! │ Order        │ ─────> │  server.rs  (axum Router, ServerConfig)      │
//! │ pipeline     │        │    └─ api.rs  (handlers, AppState, roles)    │
//! └──────────────┘        │         │                                    │
//! ┌──────────────┐  poll  │         │ DbHandle::call()                   │
//! │ Station      │ <───── │         v                                    │
//! │ display      │        │  db.rs  (KitchenDb: fan-out, cascades,       │
//! │ (poller.rs)  │        │          feed query, BEGIN IMMEDIATE writes) │
//! └──────────────┘        └──────────────────────────────────────────────┘
//! ```
//!
//! The status rules themselves (item cycle, auto-completion, order
//! readiness, cancel cascade) live in `kds_common::lifecycle`; `db.rs`
//! applies them inside one write transaction per staff action.
//!
//! ## Typical Request Flow (last bar item marked done)
//!
//! 1. `POST /api/ticket-items/{id}/toggle` with `x-staff-role: bar`
//! 2. `api::toggle_item` checks the role, then `KitchenDb::toggle_item`
//!    opens a `BEGIN IMMEDIATE` transaction.
//! 3. The item moves to done; every live item is done, so the ticket is
//!    completed; every live ticket of the order is completed, so the order
//!    becomes ready. All three writes commit together.
//! 4. The kitchen display's next delta poll sees the bar ticket's new
//!    status through its `sibling_status` field.

pub mod api;
pub mod db;
pub mod poller;
pub mod server;
