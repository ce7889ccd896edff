use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A physical preparation area with its own display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Station {
    Kitchen,
    Bar,
}

impl Station {
    /// Fan-out order: tickets are created kitchen first, then bar.
    pub const ALL: [Station; 2] = [Station::Kitchen, Station::Bar];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kitchen => "kitchen",
            Self::Bar => "bar",
        }
    }

    /// The other station, used for cross-station awareness on the display.
    pub fn sibling(&self) -> Station {
        match self {
            Self::Kitchen => Self::Bar,
            Self::Bar => Self::Kitchen,
        }
    }
}

impl std::fmt::Display for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Station {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kitchen" => Ok(Self::Kitchen),
            "bar" => Ok(Self::Bar),
            _ => Err(format!("Invalid station: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    InProgress,
    Completed,
    Recalled,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Recalled => "recalled",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "recalled" => Ok(Self::Recalled),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid ticket status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketItemStatus {
    Pending,
    InProgress,
    Done,
    Cancelled,
}

impl TicketItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Still being worked on: forced to done when its ticket is bumped to completed.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl std::fmt::Display for TicketItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid ticket item status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "preparing" => Ok(Self::Preparing),
            "ready" => Ok(Self::Ready),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    DineIn,
    Delivery,
    Takeaway,
}

impl OrderType {
    /// A table reference wins over a delivery address; neither means takeaway.
    pub fn derive(table_label: Option<&str>, delivery_address: Option<&str>) -> Self {
        match (table_label, delivery_address) {
            (Some(_), _) => Self::DineIn,
            (None, Some(_)) => Self::Delivery,
            (None, None) => Self::Takeaway,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DineIn => "dine_in",
            Self::Delivery => "delivery",
            Self::Takeaway => "takeaway",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller role supplied by the auth collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Server,
    Kitchen,
    Bar,
    Manager,
    Admin,
}

/// Everything the engine checks a role against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    PlaceOrder,
    ReadTickets,
    WorkTickets,
    SetPriority,
    CancelItem,
    UpdateOrderStatus,
    ManageCategories,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Server => "server",
            Self::Kitchen => "kitchen",
            Self::Bar => "bar",
            Self::Manager => "manager",
            Self::Admin => "admin",
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::Manager | Self::Admin)
    }

    pub fn permits(&self, action: Action) -> bool {
        match action {
            Action::PlaceOrder => true,
            Action::ReadTickets => !matches!(self, Self::Customer),
            Action::WorkTickets => {
                matches!(self, Self::Kitchen | Self::Bar | Self::Manager | Self::Admin)
            }
            Action::SetPriority | Action::CancelItem | Action::ManageCategories => {
                self.is_elevated()
            }
            Action::UpdateOrderStatus => matches!(self, Self::Server | Self::Manager | Self::Admin),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => Ok(Self::Customer),
            "server" => Ok(Self::Server),
            "kitchen" => Ok(Self::Kitchen),
            "bar" => Ok(Self::Bar),
            "manager" => Ok(Self::Manager),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlaceOrder => "place orders",
            Self::ReadTickets => "read tickets",
            Self::WorkTickets => "update tickets",
            Self::SetPriority => "set ticket priority",
            Self::CancelItem => "cancel ticket items",
            Self::UpdateOrderStatus => "update order status",
            Self::ManageCategories => "manage categories",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub title: String,
    pub station: Station,
}

/// One line of an order's cart, as supplied by the order pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    #[serde(default)]
    pub menu_item_id: Option<i64>,
    pub title: String,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub preparation: Option<String>,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub category_title: Option<String>,
}

fn default_quantity() -> i32 {
    1
}

impl CartItem {
    pub fn new(title: impl Into<String>, quantity: i32) -> Self {
        Self {
            menu_item_id: None,
            title: title.into(),
            quantity,
            instructions: None,
            preparation: None,
            category_id: None,
            category_title: None,
        }
    }

    pub fn with_category_title(mut self, title: impl Into<String>) -> Self {
        self.category_title = Some(title.into());
        self
    }

    pub fn with_category_id(mut self, id: i64) -> Self {
        self.category_id = Some(id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub number: i64,
    pub status: OrderStatus,
    pub table_label: Option<String>,
    pub delivery_address: Option<String>,
    pub order_type: OrderType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub order_id: i64,
    pub station: Station,
    pub status: TicketStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Last change to the ticket itself. Drives retention.
    pub updated_at: DateTime<Utc>,
    /// Last change to anything shown with the ticket, including the sibling
    /// station's status. Drives delta polling. Never earlier than `updated_at`.
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketItem {
    pub id: i64,
    pub ticket_id: i64,
    pub menu_item_id: Option<i64>,
    pub title: String,
    pub quantity: i32,
    pub instructions: Option<String>,
    pub preparation: Option<String>,
    pub category: Option<String>,
    pub status: TicketItemStatus,
}

// API view types

/// A ticket as read by a station display: the ticket, its items and the
/// fields derived from the parent order and the sibling station's ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketView {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub items: Vec<TicketItem>,
    pub order_number: i64,
    pub table_label: Option<String>,
    pub order_type: OrderType,
    pub sibling_status: Option<TicketStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetail {
    pub order: Order,
    pub tickets: Vec<TicketView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_roundtrip() {
        for s in &["kitchen", "bar"] {
            let parsed: Station = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("grill".parse::<Station>().is_err());
        assert_eq!(Station::Kitchen.sibling(), Station::Bar);
        assert_eq!(Station::Bar.sibling(), Station::Kitchen);
    }

    #[test]
    fn test_ticket_status_roundtrip() {
        for s in &["new", "in_progress", "completed", "recalled", "cancelled"] {
            let parsed: TicketStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("done".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn test_item_status_roundtrip() {
        for s in &["pending", "in_progress", "done", "cancelled"] {
            let parsed: TicketItemStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("completed".parse::<TicketItemStatus>().is_err());
    }

    #[test]
    fn test_order_type_derivation() {
        assert_eq!(OrderType::derive(Some("T4"), None), OrderType::DineIn);
        assert_eq!(OrderType::derive(Some("T4"), Some("1 Main St")), OrderType::DineIn);
        assert_eq!(OrderType::derive(None, Some("1 Main St")), OrderType::Delivery);
        assert_eq!(OrderType::derive(None, None), OrderType::Takeaway);
    }

    #[test]
    fn test_role_parse_is_case_insensitive() {
        assert_eq!("Kitchen".parse::<Role>().unwrap(), Role::Kitchen);
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert!("chef".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_permissions() {
        assert!(Role::Kitchen.permits(Action::WorkTickets));
        assert!(Role::Bar.permits(Action::WorkTickets));
        assert!(!Role::Server.permits(Action::WorkTickets));
        assert!(Role::Server.permits(Action::ReadTickets));
        assert!(!Role::Customer.permits(Action::ReadTickets));
        assert!(Role::Customer.permits(Action::PlaceOrder));

        assert!(!Role::Kitchen.permits(Action::SetPriority));
        assert!(Role::Manager.permits(Action::SetPriority));
        assert!(Role::Admin.permits(Action::CancelItem));
        assert!(!Role::Bar.permits(Action::ManageCategories));
        assert!(Role::Server.permits(Action::UpdateOrderStatus));
        assert!(!Role::Kitchen.permits(Action::UpdateOrderStatus));
    }

    #[test]
    fn test_serde_produces_snake_case_strings() {
        assert_eq!(
            serde_json::to_string(&TicketStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(serde_json::to_string(&OrderType::DineIn).unwrap(), "\"dine_in\"");
        assert_eq!(
            serde_json::from_str::<Station>("\"bar\"").unwrap(),
            Station::Bar
        );
    }

    #[test]
    fn test_cart_item_defaults() {
        let item: CartItem = serde_json::from_str(r#"{"title": "Cola"}"#).unwrap();
        assert_eq!(item.quantity, 1);
        assert!(item.category_id.is_none());
        assert!(item.instructions.is_none());
    }
}
