//! Ticket, item and order transition rules.
//!
//! These functions decide the next status; the store applies them inside a
//! single write transaction so the cascade never shows a half-applied state.

use thiserror::Error;

use crate::models::{Order, OrderStatus, Ticket, TicketItemStatus, TicketStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("ticket {ticket_id} is cancelled")]
    TicketCancelled { ticket_id: i64 },

    #[error("ticket {ticket_id} is {status}, only completed tickets can be recalled")]
    NotRecallable { ticket_id: i64, status: TicketStatus },

    #[error("order {order_id} is cancelled")]
    OrderCancelled { order_id: i64 },
}

impl TicketItemStatus {
    /// Manual cycle used by station staff. Cancelled items stay cancelled.
    pub fn toggled(self) -> Self {
        match self {
            Self::Pending => Self::InProgress,
            Self::InProgress => Self::Done,
            Self::Done => Self::Pending,
            Self::Cancelled => Self::Cancelled,
        }
    }
}

/// Staff may bump to any status, but never out of the terminal cancelled state.
pub fn check_bump(ticket: &Ticket) -> Result<(), TransitionError> {
    if ticket.status.is_terminal() {
        return Err(TransitionError::TicketCancelled {
            ticket_id: ticket.id,
        });
    }
    Ok(())
}

pub fn recall_target(ticket: &Ticket) -> Result<TicketStatus, TransitionError> {
    match ticket.status {
        TicketStatus::Completed => Ok(TicketStatus::InProgress),
        TicketStatus::Cancelled => Err(TransitionError::TicketCancelled {
            ticket_id: ticket.id,
        }),
        status => Err(TransitionError::NotRecallable {
            ticket_id: ticket.id,
            status,
        }),
    }
}

/// Items of a cancelled ticket are frozen.
pub fn check_item_change(ticket: &Ticket) -> Result<(), TransitionError> {
    if ticket.status.is_terminal() {
        return Err(TransitionError::TicketCancelled {
            ticket_id: ticket.id,
        });
    }
    Ok(())
}

pub fn check_order_status_change(order: &Order, target: OrderStatus) -> Result<(), TransitionError> {
    if order.status == OrderStatus::Cancelled && target != OrderStatus::Cancelled {
        return Err(TransitionError::OrderCancelled { order_id: order.id });
    }
    Ok(())
}

/// Ticket status after one of its items changed.
///
/// Every non-cancelled item done completes the ticket; a ticket with only
/// cancelled items is left alone. An item leaving done reopens a completed
/// ticket, and the first item picked up starts a new one.
pub fn ticket_after_item_change(current: TicketStatus, items: &[TicketItemStatus]) -> TicketStatus {
    if current.is_terminal() {
        return current;
    }
    let live: Vec<TicketItemStatus> = items
        .iter()
        .copied()
        .filter(|s| *s != TicketItemStatus::Cancelled)
        .collect();
    if live.is_empty() {
        return current;
    }
    if live.iter().all(|s| *s == TicketItemStatus::Done) {
        return TicketStatus::Completed;
    }
    let started = live.iter().any(|s| *s != TicketItemStatus::Pending);
    match current {
        TicketStatus::Completed => TicketStatus::InProgress,
        TicketStatus::New if started => TicketStatus::InProgress,
        other => other,
    }
}

/// Order status after any of its tickets changed.
///
/// Ready exactly when there is at least one non-cancelled ticket and all of
/// them are completed. Completed and cancelled orders are never moved.
pub fn order_after_ticket_change(current: OrderStatus, tickets: &[TicketStatus]) -> OrderStatus {
    let live: Vec<&TicketStatus> = tickets
        .iter()
        .filter(|s| **s != TicketStatus::Cancelled)
        .collect();
    let all_completed = !live.is_empty() && live.iter().all(|s| **s == TicketStatus::Completed);

    match current {
        OrderStatus::Pending | OrderStatus::Preparing if all_completed => OrderStatus::Ready,
        OrderStatus::Ready if !all_completed => OrderStatus::Preparing,
        other => other,
    }
}

/// Status a ticket is forced into when its order is cancelled, if any.
pub fn cancel_cascade(status: TicketStatus) -> Option<TicketStatus> {
    match status {
        TicketStatus::Completed | TicketStatus::Cancelled => None,
        TicketStatus::New | TicketStatus::InProgress | TicketStatus::Recalled => {
            Some(TicketStatus::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, Station};
    use chrono::Utc;

    use TicketItemStatus as I;
    use TicketStatus as T;

    fn ticket(status: TicketStatus) -> Ticket {
        Ticket {
            id: 7,
            order_id: 1,
            station: Station::Kitchen,
            status,
            priority: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            changed_at: Utc::now(),
        }
    }

    fn order(status: OrderStatus) -> Order {
        Order {
            id: 1,
            number: 1,
            status,
            table_label: None,
            delivery_address: None,
            order_type: OrderType::Takeaway,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_item_toggle_cycle() {
        assert_eq!(I::Pending.toggled(), I::InProgress);
        assert_eq!(I::InProgress.toggled(), I::Done);
        assert_eq!(I::Done.toggled(), I::Pending);
        assert_eq!(I::Cancelled.toggled(), I::Cancelled);
    }

    #[test]
    fn test_all_done_completes_ticket() {
        assert_eq!(ticket_after_item_change(T::InProgress, &[I::Done, I::Done]), T::Completed);
        assert_eq!(ticket_after_item_change(T::New, &[I::Done]), T::Completed);
        assert_eq!(ticket_after_item_change(T::Recalled, &[I::Done]), T::Completed);
    }

    #[test]
    fn test_cancelled_items_do_not_block_completion() {
        assert_eq!(
            ticket_after_item_change(T::InProgress, &[I::Done, I::Cancelled]),
            T::Completed
        );
    }

    #[test]
    fn test_only_cancelled_items_leaves_ticket_alone() {
        assert_eq!(
            ticket_after_item_change(T::InProgress, &[I::Cancelled, I::Cancelled]),
            T::InProgress
        );
    }

    #[test]
    fn test_first_started_item_moves_new_ticket_in_progress() {
        assert_eq!(
            ticket_after_item_change(T::New, &[I::InProgress, I::Pending]),
            T::InProgress
        );
        assert_eq!(ticket_after_item_change(T::New, &[I::Pending, I::Pending]), T::New);
    }

    #[test]
    fn test_item_leaving_done_reopens_completed_ticket() {
        assert_eq!(
            ticket_after_item_change(T::Completed, &[I::Pending, I::Done]),
            T::InProgress
        );
    }

    #[test]
    fn test_cancelled_ticket_never_moves_on_item_change() {
        assert_eq!(ticket_after_item_change(T::Cancelled, &[I::Done]), T::Cancelled);
    }

    #[test]
    fn test_order_ready_only_when_all_live_tickets_completed() {
        assert_eq!(
            order_after_ticket_change(OrderStatus::Preparing, &[T::Completed, T::New]),
            OrderStatus::Preparing
        );
        assert_eq!(
            order_after_ticket_change(OrderStatus::Preparing, &[T::Completed, T::Completed]),
            OrderStatus::Ready
        );
        assert_eq!(
            order_after_ticket_change(OrderStatus::Pending, &[T::Completed, T::Cancelled]),
            OrderStatus::Ready
        );
    }

    #[test]
    fn test_order_without_live_tickets_is_not_ready() {
        assert_eq!(
            order_after_ticket_change(OrderStatus::Preparing, &[T::Cancelled]),
            OrderStatus::Preparing
        );
        assert_eq!(
            order_after_ticket_change(OrderStatus::Preparing, &[]),
            OrderStatus::Preparing
        );
    }

    #[test]
    fn test_ready_order_reverts_when_a_ticket_reopens() {
        assert_eq!(
            order_after_ticket_change(OrderStatus::Ready, &[T::InProgress, T::Completed]),
            OrderStatus::Preparing
        );
    }

    #[test]
    fn test_closed_orders_are_never_moved() {
        assert_eq!(
            order_after_ticket_change(OrderStatus::Cancelled, &[T::Completed]),
            OrderStatus::Cancelled
        );
        assert_eq!(
            order_after_ticket_change(OrderStatus::Completed, &[T::InProgress]),
            OrderStatus::Completed
        );
    }

    #[test]
    fn test_cancel_cascade_spares_completed_tickets() {
        assert_eq!(cancel_cascade(T::New), Some(T::Cancelled));
        assert_eq!(cancel_cascade(T::InProgress), Some(T::Cancelled));
        assert_eq!(cancel_cascade(T::Recalled), Some(T::Cancelled));
        assert_eq!(cancel_cascade(T::Completed), None);
        assert_eq!(cancel_cascade(T::Cancelled), None);
    }

    #[test]
    fn test_recall_only_from_completed() {
        assert_eq!(recall_target(&ticket(T::Completed)), Ok(T::InProgress));
        assert_eq!(
            recall_target(&ticket(T::New)),
            Err(TransitionError::NotRecallable {
                ticket_id: 7,
                status: T::New
            })
        );
        assert_eq!(
            recall_target(&ticket(T::Cancelled)),
            Err(TransitionError::TicketCancelled { ticket_id: 7 })
        );
    }

    #[test]
    fn test_bump_rejected_out_of_cancelled() {
        assert!(check_bump(&ticket(T::New)).is_ok());
        assert!(check_bump(&ticket(T::InProgress)).is_ok());
        assert!(check_bump(&ticket(T::Recalled)).is_ok());
        assert_eq!(
            check_bump(&ticket(T::Cancelled)),
            Err(TransitionError::TicketCancelled { ticket_id: 7 })
        );
        assert!(check_item_change(&ticket(T::Cancelled)).is_err());
    }

    #[test]
    fn test_cancelled_order_cannot_be_reopened() {
        let cancelled = order(OrderStatus::Cancelled);
        assert_eq!(
            check_order_status_change(&cancelled, OrderStatus::Preparing),
            Err(TransitionError::OrderCancelled { order_id: 1 })
        );
        assert!(check_order_status_change(&cancelled, OrderStatus::Cancelled).is_ok());
        assert!(check_order_status_change(&order(OrderStatus::Ready), OrderStatus::Completed).is_ok());
    }
}
