use thiserror::Error;

use crate::classifier::CategorySnapshot;
use crate::models::{CartItem, Station};

/// The cart lines one station will receive as a single ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct StationGroup<'a> {
    pub station: Station,
    pub items: Vec<&'a CartItem>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FanOutError {
    #[error("cart of {cart_len} items produced no tickets")]
    NoTickets { cart_len: usize },

    #[error("cart of {cart_len} items was split into {ticketed} ticket items")]
    ItemCountMismatch { cart_len: usize, ticketed: usize },
}

/// Partition a cart into one group per station that received at least one
/// item. Groups come out in `Station::ALL` order and keep cart order inside.
///
/// A non-empty cart that does not come back fully ticketed is an internal bug
/// (the classifier always has a default), so it is reported, never dropped.
pub fn plan_tickets<'a>(
    cart: &'a [CartItem],
    snapshot: &CategorySnapshot,
) -> Result<Vec<StationGroup<'a>>, FanOutError> {
    let stations: Vec<Station> = cart.iter().map(|item| snapshot.classify(item)).collect();

    let groups: Vec<StationGroup<'a>> = Station::ALL
        .iter()
        .map(|station| StationGroup {
            station: *station,
            items: cart
                .iter()
                .zip(&stations)
                .filter(|(_, s)| *s == station)
                .map(|(item, _)| item)
                .collect(),
        })
        .filter(|group| !group.items.is_empty())
        .collect();

    verify_plan(cart.len(), &groups)?;
    Ok(groups)
}

fn verify_plan(cart_len: usize, groups: &[StationGroup<'_>]) -> Result<(), FanOutError> {
    if cart_len > 0 && groups.is_empty() {
        return Err(FanOutError::NoTickets { cart_len });
    }
    let ticketed: usize = groups.iter().map(|g| g.items.len()).sum();
    if ticketed != cart_len {
        return Err(FanOutError::ItemCountMismatch { cart_len, ticketed });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;

    fn snapshot() -> CategorySnapshot {
        CategorySnapshot::new(&[
            Category {
                id: 1,
                title: "Burgers".into(),
                station: Station::Kitchen,
            },
            Category {
                id: 2,
                title: "Drinks".into(),
                station: Station::Bar,
            },
        ])
    }

    #[test]
    fn test_burger_and_drinks_split_into_two_tickets() {
        let cart = vec![
            CartItem::new("Cheeseburger", 1).with_category_title("Burgers"),
            CartItem::new("Cola", 2).with_category_title("Drinks"),
        ];
        let groups = plan_tickets(&cart, &snapshot()).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].station, Station::Kitchen);
        assert_eq!(groups[0].items.len(), 1);
        assert_eq!(groups[1].station, Station::Bar);
        assert_eq!(groups[1].items[0].quantity, 2);
    }

    #[test]
    fn test_single_station_cart_yields_one_ticket() {
        let cart = vec![
            CartItem::new("Cola", 1).with_category_id(2),
            CartItem::new("Lemonade", 1).with_category_title("drinks"),
        ];
        let groups = plan_tickets(&cart, &snapshot()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].station, Station::Bar);
        assert_eq!(groups[0].items.len(), 2);
    }

    #[test]
    fn test_every_cart_item_lands_in_exactly_one_group() {
        let cart = vec![
            CartItem::new("Fries", 1),
            CartItem::new("Beer", 1).with_category_title("Drinks"),
            CartItem::new("Burger", 3).with_category_id(1),
            CartItem::new("Water", 1).with_category_id(2),
            CartItem::new("Salad", 1).with_category_title("Unknown"),
        ];
        let groups = plan_tickets(&cart, &snapshot()).unwrap();
        let total: usize = groups.iter().map(|g| g.items.len()).sum();
        assert_eq!(total, cart.len());

        for item in &cart {
            let hits = groups
                .iter()
                .flat_map(|g| g.items.iter())
                .filter(|i| std::ptr::eq(**i, item))
                .count();
            assert_eq!(hits, 1, "{} should be ticketed once", item.title);
        }
    }

    #[test]
    fn test_group_preserves_cart_order() {
        let cart = vec![
            CartItem::new("A", 1),
            CartItem::new("B", 1).with_category_id(2),
            CartItem::new("C", 1),
        ];
        let groups = plan_tickets(&cart, &snapshot()).unwrap();
        let kitchen: Vec<&str> = groups[0].items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(kitchen, vec!["A", "C"]);
    }

    #[test]
    fn test_empty_cart_plans_nothing() {
        let groups = plan_tickets(&[], &snapshot()).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_verify_plan_rejects_lost_items() {
        let item = CartItem::new("Burger", 1);
        assert_eq!(
            verify_plan(1, &[]),
            Err(FanOutError::NoTickets { cart_len: 1 })
        );
        let groups = vec![StationGroup {
            station: Station::Kitchen,
            items: vec![&item],
        }];
        assert_eq!(
            verify_plan(2, &groups),
            Err(FanOutError::ItemCountMismatch {
                cart_len: 2,
                ticketed: 1
            })
        );
    }
}
