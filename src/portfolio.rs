// =============================================================================
// Portfolio — one participant's simulated holdings within one match
// =============================================================================
//
// Life-cycle of a Position:
//   created on first buy -> avg price updated on further buys of the same
//   address -> removed when quantity falls below the dust threshold.
//
// The portfolio is owned exclusively by its match coordinator; nothing else
// mutates it. The order ring and balance history are bounded so a serialized
// coordinator state stays inside the blob-store budget.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Virtual QUOTE balance every portfolio starts from.
pub const START_BALANCE: f64 = 1.0;
/// Positions below this quantity are removed entirely.
pub const DUST_THRESHOLD: f64 = 1e-4;
/// Recent orders retained per portfolio.
pub const ORDER_RING_CAP: usize = 10;
/// Hard prize ceiling in QUOTE.
pub const PRIZE_CAP: f64 = 5.0;
/// Gain percent above which the prize no longer grows.
pub const GAIN_CAP_PCT: f64 = 500.0;

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A single open holding, keyed by token contract address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub token_address: String,
    pub symbol: String,
    pub quantity: f64,
    /// Volume-weighted average entry price (cost basis).
    pub avg_entry_price: f64,
    /// Epoch millis of the first fill.
    pub entry_ts: i64,
    /// Highest price observed since entry; drives the trailing stop.
    #[serde(default)]
    pub high_watermark: f64,
    /// Cached unrealized P&L from the last price pass.
    #[serde(default)]
    pub unrealized_pnl: f64,
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// An executed trade record. Append-only; ids are monotonic per portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub participant_id: String,
    /// Epoch millis, already offset by the simulated latency.
    pub ts: i64,
    pub token_address: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub fill_price: f64,
    pub fee_paid: f64,
    pub slippage_bps: f64,
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// One participant's mutable state within one match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub participant_id: String,
    /// QUOTE balance; never allowed below zero.
    pub balance: f64,
    pub positions: Vec<Position>,
    /// Bounded ring of the most recent orders (cap 10).
    pub recent_orders: Vec<Order>,
    /// Monotonic order counter — also the next order id.
    pub order_count: u64,
    /// Ticks this portfolio has been evaluated on.
    pub scan_count: u64,
    pub realized_pnl: f64,
    /// Cached sum of per-position unrealized P&L.
    pub unrealized_pnl: f64,
}

impl Portfolio {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            balance: START_BALANCE,
            positions: Vec::new(),
            recent_orders: Vec::new(),
            order_count: 0,
            scan_count: 0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    pub fn position_by_address(&self, address: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.token_address == address)
    }

    pub fn position_by_address_mut(&mut self, address: &str) -> Option<&mut Position> {
        self.positions.iter_mut().find(|p| p.token_address == address)
    }

    /// Append an order, evicting the oldest entries past the ring cap.
    pub fn push_order(&mut self, order: Order) {
        self.recent_orders.push(order);
        while self.recent_orders.len() > ORDER_RING_CAP {
            self.recent_orders.remove(0);
        }
    }

    /// Recompute per-position and total unrealized P&L from an address-keyed
    /// price map. Positions absent from the map keep their cached value (the
    /// snapshot is incomplete, not a delisting). The high-watermark advances
    /// here so the trailing stop sees every observed price.
    pub fn update_unrealized(&mut self, prices: &HashMap<String, f64>) {
        let mut total = 0.0;
        for pos in &mut self.positions {
            if let Some(&price) = prices.get(&pos.token_address) {
                pos.unrealized_pnl = pos.quantity * (price - pos.avg_entry_price);
                if price > pos.high_watermark {
                    pos.high_watermark = price;
                }
            }
            total += pos.unrealized_pnl;
        }
        self.unrealized_pnl = total;
    }

    /// Balance plus positions marked at the snapshot price, falling back to
    /// cost basis for tokens the snapshot does not carry.
    pub fn total_value(&self, prices: &HashMap<String, f64>) -> f64 {
        let positions_value: f64 = self
            .positions
            .iter()
            .map(|p| {
                let price = prices
                    .get(&p.token_address)
                    .copied()
                    .unwrap_or(p.avg_entry_price);
                p.quantity * price
            })
            .sum();
        self.balance + positions_value
    }

    pub fn gain_pct(&self, prices: &HashMap<String, f64>) -> f64 {
        (self.total_value(prices) - START_BALANCE) / START_BALANCE * 100.0
    }

    /// Total value at the prices of the last unrealized-P&L pass. Used by
    /// read endpoints that run between ticks and have no snapshot in hand.
    pub fn cached_total_value(&self) -> f64 {
        let positions_value: f64 = self
            .positions
            .iter()
            .map(|p| p.quantity * p.avg_entry_price + p.unrealized_pnl)
            .sum();
        self.balance + positions_value
    }
}

// ---------------------------------------------------------------------------
// Balance history
// ---------------------------------------------------------------------------

/// One row of the coordinator's balance-curve history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Epoch millis.
    pub ts: i64,
    pub entries: Vec<BalanceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub participant_id: String,
    pub total_value: f64,
}

// ---------------------------------------------------------------------------
// Prize
// ---------------------------------------------------------------------------

/// Prize in QUOTE for the winning gain percent: 1 QUOTE per 100% gain,
/// capped at 500% gain / 5 QUOTE. Losses pay nothing.
pub fn calculate_prize(gain_pct: f64) -> f64 {
    if gain_pct <= 0.0 {
        return 0.0;
    }
    (gain_pct.min(GAIN_CAP_PCT) / 100.0).min(PRIZE_CAP)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn position(address: &str, qty: f64, avg: f64) -> Position {
        Position {
            token_address: address.to_string(),
            symbol: "TKN".to_string(),
            quantity: qty,
            avg_entry_price: avg,
            entry_ts: 0,
            high_watermark: avg,
            unrealized_pnl: 0.0,
        }
    }

    fn order(id: u64) -> Order {
        Order {
            id,
            participant_id: "p1".to_string(),
            ts: 0,
            token_address: "0xaaa".to_string(),
            symbol: "TKN".to_string(),
            side: Side::Buy,
            quantity: 1.0,
            fill_price: 1.0,
            fee_paid: 0.0,
            slippage_bps: 10.0,
        }
    }

    #[test]
    fn order_ring_is_bounded() {
        let mut pf = Portfolio::new("p1");
        for i in 0..25 {
            pf.push_order(order(i));
        }
        assert_eq!(pf.recent_orders.len(), ORDER_RING_CAP);
        // Oldest entries were evicted.
        assert_eq!(pf.recent_orders[0].id, 15);
        assert_eq!(pf.recent_orders.last().unwrap().id, 24);
    }

    #[test]
    fn unrealized_updates_and_watermark_advances() {
        let mut pf = Portfolio::new("p1");
        pf.positions.push(position("0xaaa", 2.0, 1.0));

        let mut prices = HashMap::new();
        prices.insert("0xaaa".to_string(), 1.5);
        pf.update_unrealized(&prices);

        assert!((pf.unrealized_pnl - 1.0).abs() < 1e-12);
        assert_eq!(pf.positions[0].high_watermark, 1.5);

        // Price retreats: watermark holds.
        prices.insert("0xaaa".to_string(), 1.2);
        pf.update_unrealized(&prices);
        assert_eq!(pf.positions[0].high_watermark, 1.5);
    }

    #[test]
    fn unknown_token_keeps_cached_unrealized() {
        let mut pf = Portfolio::new("p1");
        let mut pos = position("0xaaa", 1.0, 1.0);
        pos.unrealized_pnl = 0.25;
        pf.positions.push(pos);

        pf.update_unrealized(&HashMap::new());
        assert_eq!(pf.unrealized_pnl, 0.25);
    }

    #[test]
    fn total_value_falls_back_to_cost_basis() {
        let mut pf = Portfolio::new("p1");
        pf.balance = 0.5;
        pf.positions.push(position("0xaaa", 2.0, 0.1));

        // No price for 0xaaa: marked at avg entry price.
        assert!((pf.total_value(&HashMap::new()) - 0.7).abs() < 1e-12);

        let mut prices = HashMap::new();
        prices.insert("0xaaa".to_string(), 0.2);
        assert!((pf.total_value(&prices) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn prize_caps_and_floors() {
        assert_eq!(calculate_prize(-12.0), 0.0);
        assert_eq!(calculate_prize(0.0), 0.0);
        assert!((calculate_prize(100.0) - 1.0).abs() < 1e-12);
        assert!((calculate_prize(250.0) - 2.5).abs() < 1e-12);
        assert_eq!(calculate_prize(500.0), 5.0);
        assert_eq!(calculate_prize(500.0001), 5.0);
        assert_eq!(calculate_prize(10_000.0), 5.0);
    }

    #[test]
    fn gain_pct_from_start_balance() {
        let mut pf = Portfolio::new("p1");
        pf.balance = 1.2;
        assert!((pf.gain_pct(&HashMap::new()) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn cached_total_matches_last_price_pass() {
        let mut pf = Portfolio::new("p1");
        pf.balance = 0.5;
        pf.positions.push(position("0xaaa", 2.0, 0.1));

        let mut prices = HashMap::new();
        prices.insert("0xaaa".to_string(), 0.3);
        pf.update_unrealized(&prices);

        assert!((pf.cached_total_value() - pf.total_value(&prices)).abs() < 1e-12);
    }
}
