//! Position ledger: the in-memory book of open positions, their P&L,
//! and the fill-application rules. The execution worker owns a single
//! ledger; fill application and price refresh never interleave.

use crate::domain::types::{PositionSide, PositionStatus, Side};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub current_price: f64,
    pub quantity: f64,
    pub initial_quantity: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub realized_pnl: f64,
    pub total_pnl: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub entry_time: DateTime<Utc>,
    pub status: PositionStatus,
    pub metadata: Map<String, Value>,
}

impl Position {
    fn pnl_per_unit(&self, price: f64) -> f64 {
        match self.side {
            PositionSide::Long => price - self.entry_price,
            PositionSide::Short => self.entry_price - price,
        }
    }

    fn refresh_unrealized(&mut self) {
        let per_unit = self.pnl_per_unit(self.current_price);
        self.unrealized_pnl = per_unit * self.quantity;
        self.unrealized_pnl_pct = if self.entry_price != 0.0 {
            per_unit / self.entry_price * 100.0
        } else {
            0.0
        };
        self.total_pnl = self.unrealized_pnl + self.realized_pnl;
    }
}

/// What a fill did to the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAction {
    Opened,
    Increased,
    Decreased,
    Closed,
}

/// A fill applied to the ledger: the action taken and the position
/// snapshot after it.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub action: LedgerAction,
    pub position: Position,
}

/// In-memory position book for one execution worker.
#[derive(Debug, Default)]
pub struct PositionLedger {
    open: Vec<Position>,
    closed: Vec<Position>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.open
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    pub fn position_for_symbol(&self, symbol: &str) -> Option<&Position> {
        self.open.iter().find(|p| p.symbol == symbol)
    }

    /// Apply one fill per the ledger rules: open a new position, add
    /// to a same-side one, or reduce/close an opposite-side one.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_fill(
        &mut self,
        symbol: &str,
        order_side: Side,
        quantity: f64,
        price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        metadata: Map<String, Value>,
    ) -> LedgerEvent {
        let index = self.open.iter().position(|p| p.symbol == symbol);
        match index {
            None => self.open_position(
                symbol,
                PositionSide::from_entry(order_side),
                quantity,
                price,
                stop_loss,
                take_profit,
                metadata,
            ),
            Some(index) => {
                let same_side = self.open[index].side.entry_side() == order_side;
                if same_side {
                    self.increase(index, quantity, price)
                } else {
                    self.decrease(index, quantity, price)
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn open_position(
        &mut self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        metadata: Map<String, Value>,
    ) -> LedgerEvent {
        let position = Position {
            position_id: format!("{}-{}-{}", symbol, side, Uuid::new_v4()),
            symbol: symbol.to_string(),
            side,
            entry_price,
            current_price: entry_price,
            quantity,
            initial_quantity: quantity,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            realized_pnl: 0.0,
            total_pnl: 0.0,
            stop_loss,
            take_profit,
            entry_time: Utc::now(),
            status: PositionStatus::Open,
            metadata,
        };
        self.open.push(position.clone());
        LedgerEvent {
            action: LedgerAction::Opened,
            position,
        }
    }

    fn increase(&mut self, index: usize, quantity: f64, price: f64) -> LedgerEvent {
        let position = &mut self.open[index];
        let total_cost = position.quantity * position.entry_price + quantity * price;
        let new_quantity = position.quantity + quantity;
        if new_quantity > 0.0 {
            position.entry_price = total_cost / new_quantity;
        }
        position.quantity = new_quantity;
        position.current_price = price;
        position.refresh_unrealized();

        LedgerEvent {
            action: LedgerAction::Increased,
            position: position.clone(),
        }
    }

    fn decrease(&mut self, index: usize, quantity: f64, price: f64) -> LedgerEvent {
        if quantity >= self.open[index].quantity {
            return self.close(index, price);
        }

        let position = &mut self.open[index];
        let partial_pnl = position.pnl_per_unit(price) * quantity;
        position.quantity -= quantity;
        position.realized_pnl += partial_pnl;
        position.current_price = price;
        position.status = PositionStatus::PartiallyClosed;
        position.refresh_unrealized();

        LedgerEvent {
            action: LedgerAction::Decreased,
            position: position.clone(),
        }
    }

    fn close(&mut self, index: usize, exit_price: f64) -> LedgerEvent {
        let mut position = self.open.remove(index);
        let final_pnl = position.pnl_per_unit(exit_price) * position.quantity;

        position.current_price = exit_price;
        position.realized_pnl += final_pnl;
        position.unrealized_pnl = 0.0;
        position.unrealized_pnl_pct = 0.0;
        position.total_pnl = position.realized_pnl;
        position.status = PositionStatus::Closed;
        position.quantity = 0.0;

        // Closed history only; the position is never resurrected.
        self.closed.push(position.clone());
        LedgerEvent {
            action: LedgerAction::Closed,
            position,
        }
    }

    /// Refresh one open position against a new market price; returns
    /// the updated snapshot.
    pub fn update_price(&mut self, position_id: &str, current_price: f64) -> Option<Position> {
        let position = self.open.iter_mut().find(|p| p.position_id == position_id)?;
        position.current_price = current_price;
        position.refresh_unrealized();
        Some(position.clone())
    }

    pub fn total_unrealized_pnl(&self) -> f64 {
        self.open.iter().map(|p| p.unrealized_pnl).sum()
    }

    pub fn total_realized_pnl(&self) -> f64 {
        self.open.iter().map(|p| p.realized_pnl).sum::<f64>()
            + self.closed.iter().map(|p| p.realized_pnl).sum::<f64>()
    }
}
