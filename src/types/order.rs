//! Order types
//!
//! An order is created `pending` before settlement and finalized together
//! with its debit entry.

use super::account::{TokenAmount, UserId};
use super::error::WalletError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        OrderId(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order lifecycle status
///
/// `Pending` moves to exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One priced line of an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub item_id: String,
    pub quantity: u32,

    /// Price captured at purchase time, per unit
    pub unit_price: TokenAmount,
}

impl LineItem {
    /// `quantity * unit_price`, `None` on overflow
    pub fn subtotal(&self) -> Option<TokenAmount> {
        TokenAmount::from(self.quantity).checked_mul(self.unit_price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub status: OrderStatus,

    /// Always equal to the sum of line item subtotals
    pub total: TokenAmount,
    pub line_items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Build a pending order and compute its total
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` - no line items, a zero quantity, or a zero total
    /// * `ArithmeticOverflow` - the total does not fit a token amount
    pub fn pending(
        user_id: UserId,
        line_items: Vec<LineItem>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, WalletError> {
        if line_items.is_empty() {
            return Err(WalletError::invalid_amount("order has no line items"));
        }

        let mut total: TokenAmount = 0;
        for item in &line_items {
            if item.quantity == 0 {
                return Err(WalletError::invalid_amount(format!(
                    "line item '{}' has zero quantity",
                    item.item_id
                )));
            }
            total = item
                .subtotal()
                .and_then(|subtotal| total.checked_add(subtotal))
                .ok_or_else(|| WalletError::arithmetic_overflow("order_total", user_id))?;
        }

        if total == 0 {
            return Err(WalletError::invalid_amount("order total must be positive"));
        }

        Ok(Order {
            id: OrderId::new(),
            user_id,
            status: OrderStatus::Pending,
            total,
            line_items,
            created_at,
        })
    }

    /// Move a pending order into a terminal state
    pub fn finalize(&mut self, to: OrderStatus) -> Result<(), WalletError> {
        if self.status.is_terminal() || !to.is_terminal() {
            return Err(WalletError::InvalidOrderTransition {
                order_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn item(id: &str, quantity: u32, unit_price: TokenAmount) -> LineItem {
        LineItem {
            item_id: id.to_string(),
            quantity,
            unit_price,
        }
    }

    #[test]
    fn test_pending_computes_total() {
        let order = Order::pending(
            UserId(1),
            vec![item("tomatoes", 3, 5), item("basil", 1, 7)],
            Utc::now(),
        )
        .unwrap();

        assert_eq!(order.total, 22);
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::zero_quantity(vec![item("eggs", 0, 4)])]
    #[case::free_items(vec![item("sample", 2, 0)])]
    fn test_pending_rejects_invalid_lines(#[case] items: Vec<LineItem>) {
        let result = Order::pending(UserId(1), items, Utc::now());
        assert!(matches!(
            result.unwrap_err(),
            WalletError::InvalidAmount { .. }
        ));
    }

    #[test]
    fn test_pending_rejects_overflowing_total() {
        let result = Order::pending(
            UserId(1),
            vec![item("a", 2, u64::MAX / 2 + 1)],
            Utc::now(),
        );
        assert!(matches!(
            result.unwrap_err(),
            WalletError::ArithmeticOverflow { .. }
        ));
    }

    #[rstest]
    #[case::paid(OrderStatus::Paid)]
    #[case::failed(OrderStatus::Failed)]
    fn test_finalize_is_terminal(#[case] to: OrderStatus) {
        let mut order = Order::pending(UserId(1), vec![item("a", 1, 1)], Utc::now()).unwrap();

        order.finalize(to).unwrap();
        assert_eq!(order.status, to);

        let again = order.finalize(OrderStatus::Paid);
        assert!(matches!(
            again.unwrap_err(),
            WalletError::InvalidOrderTransition { .. }
        ));
    }

    #[test]
    fn test_finalize_to_pending_is_rejected() {
        let mut order = Order::pending(UserId(1), vec![item("a", 1, 1)], Utc::now()).unwrap();
        assert!(order.finalize(OrderStatus::Pending).is_err());
    }
}
