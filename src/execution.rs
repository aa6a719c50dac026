// =============================================================================
// Execution Engine — simulated fills against snapshot prices
// =============================================================================
//
// Applies an Intent to a Portfolio, producing an Order or a typed failure.
// This module owns the simulated market model: taker fee, slippage, latency
// offset, the per-match order cap, and cost-basis bookkeeping.
//
// The engine is a total function of its inputs: no I/O, no suspension, no
// panics. A failure never aborts the caller's tick — the coordinator logs it
// and moves to the next intent.
// =============================================================================

use thiserror::Error;
use tracing::debug;

use crate::portfolio::{Order, Portfolio, Position, DUST_THRESHOLD};
use crate::rules::Intent;
use crate::types::Side;

/// Taker fee applied to every fill.
pub const FEE_PCT: f64 = 0.0025;
/// Simulated slippage, 10 bps against the taker.
pub const SLIPPAGE_PCT: f64 = 0.001;
/// Simulated network latency added to order timestamps. The tick is never
/// actually delayed — this is virtual time only.
pub const LATENCY_MS: i64 = 2_000;
/// Orders a single participant may place in one match.
pub const MAX_ORDERS_PER_MATCH: u64 = 1_000;
/// Balance headroom required on buys so fees cannot overdraw.
const BUY_FEE_BUFFER: f64 = 0.10;

/// Typed execution failure. Logged per intent; other intents in the same
/// tick still execute.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TradeError {
    #[error("order cap reached ({0} orders)")]
    TooManyOrders(u64),
    #[error("insufficient balance: need {needed:.6}, have {available:.6}")]
    InsufficientBalance { needed: f64, available: f64 },
    #[error("no position in {0}")]
    NoPosition(String),
    #[error("invalid quantity {0}")]
    InvalidQuantity(f64),
}

/// Execute one intent against a portfolio at the snapshot price for the
/// intent's token. `now_ms` is the coordinator's tick time; the recorded
/// order timestamp carries the latency offset.
pub fn execute(
    portfolio: &mut Portfolio,
    intent: &Intent,
    current_price: f64,
    now_ms: i64,
) -> Result<Order, TradeError> {
    match intent.side {
        Side::Buy => execute_buy(portfolio, intent, current_price, now_ms),
        Side::Sell => execute_sell(portfolio, intent, current_price, now_ms),
    }
}

// ---------------------------------------------------------------------------
// Buy path
// ---------------------------------------------------------------------------

fn execute_buy(
    portfolio: &mut Portfolio,
    intent: &Intent,
    current_price: f64,
    now_ms: i64,
) -> Result<Order, TradeError> {
    if portfolio.order_count >= MAX_ORDERS_PER_MATCH {
        return Err(TradeError::TooManyOrders(portfolio.order_count));
    }

    let amount = intent.amount_quote;
    let needed = amount * (1.0 + BUY_FEE_BUFFER);
    if amount > portfolio.balance || needed > portfolio.balance {
        return Err(TradeError::InsufficientBalance {
            needed,
            available: portfolio.balance,
        });
    }
    if amount <= 0.0 || current_price <= 0.0 {
        return Err(TradeError::InvalidQuantity(amount));
    }

    let fill_price = current_price * (1.0 + SLIPPAGE_PCT);
    let fee = amount * FEE_PCT;
    let quantity = (amount - fee) / fill_price;

    portfolio.balance -= amount;

    let order = Order {
        id: portfolio.order_count,
        participant_id: portfolio.participant_id.clone(),
        ts: now_ms + LATENCY_MS,
        token_address: intent.token_address.clone(),
        symbol: intent.symbol.clone(),
        side: Side::Buy,
        quantity,
        fill_price,
        fee_paid: fee,
        slippage_bps: SLIPPAGE_PCT * 10_000.0,
    };
    portfolio.push_order(order.clone());
    portfolio.order_count += 1;

    // Upsert the position by token address, folding the fill into the
    // volume-weighted cost basis.
    match portfolio.position_by_address_mut(&intent.token_address) {
        Some(pos) => {
            let total_qty = pos.quantity + quantity;
            pos.avg_entry_price =
                (pos.quantity * pos.avg_entry_price + quantity * fill_price) / total_qty;
            pos.quantity = total_qty;
            if fill_price > pos.high_watermark {
                pos.high_watermark = fill_price;
            }
        }
        None => portfolio.positions.push(Position {
            token_address: intent.token_address.clone(),
            symbol: intent.symbol.clone(),
            quantity,
            avg_entry_price: fill_price,
            entry_ts: now_ms,
            high_watermark: fill_price,
            unrealized_pnl: 0.0,
        }),
    }

    debug!(
        participant = %portfolio.participant_id,
        token = %intent.token_address,
        amount,
        quantity,
        fill_price,
        "buy filled"
    );

    Ok(order)
}

// ---------------------------------------------------------------------------
// Sell path
// ---------------------------------------------------------------------------

fn execute_sell(
    portfolio: &mut Portfolio,
    intent: &Intent,
    current_price: f64,
    now_ms: i64,
) -> Result<Order, TradeError> {
    if current_price <= 0.0 {
        return Err(TradeError::InvalidQuantity(current_price));
    }

    let pos = portfolio
        .position_by_address(&intent.token_address)
        .ok_or_else(|| TradeError::NoPosition(intent.token_address.clone()))?;

    let qty_to_sell = pos.quantity.min(intent.amount_quote / current_price);
    if qty_to_sell <= 0.0 {
        return Err(TradeError::InvalidQuantity(qty_to_sell));
    }
    let avg_entry_price = pos.avg_entry_price;

    let fill_price = current_price * (1.0 - SLIPPAGE_PCT);
    let gross = qty_to_sell * fill_price;
    let fee = gross * FEE_PCT;
    let net = gross - fee;

    portfolio.balance += net;
    portfolio.realized_pnl += net - qty_to_sell * avg_entry_price;

    let order = Order {
        id: portfolio.order_count,
        participant_id: portfolio.participant_id.clone(),
        ts: now_ms + LATENCY_MS,
        token_address: intent.token_address.clone(),
        symbol: intent.symbol.clone(),
        side: Side::Sell,
        quantity: qty_to_sell,
        fill_price,
        fee_paid: fee,
        slippage_bps: SLIPPAGE_PCT * 10_000.0,
    };
    portfolio.push_order(order.clone());
    portfolio.order_count += 1;

    let pos = portfolio
        .position_by_address_mut(&intent.token_address)
        .expect("position checked above");
    pos.quantity -= qty_to_sell;
    if pos.quantity < DUST_THRESHOLD {
        portfolio
            .positions
            .retain(|p| p.token_address != intent.token_address);
    }

    debug!(
        participant = %portfolio.participant_id,
        token = %intent.token_address,
        qty = qty_to_sell,
        fill_price,
        net,
        "sell filled"
    );

    Ok(order)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::START_BALANCE;

    fn buy_intent(address: &str, amount: f64) -> Intent {
        Intent {
            side: Side::Buy,
            token_address: address.to_string(),
            symbol: "TKN".to_string(),
            amount_quote: amount,
            reason: "test".to_string(),
        }
    }

    fn sell_intent(address: &str, amount: f64) -> Intent {
        Intent {
            side: Side::Sell,
            ..buy_intent(address, amount)
        }
    }

    #[test]
    fn buy_debits_balance_and_opens_position() {
        let mut pf = Portfolio::new("p1");
        let order = execute(&mut pf, &buy_intent("0xaaa", 0.1), 1.0, 0).unwrap();

        assert!((pf.balance - 0.9).abs() < 1e-12);
        assert_eq!(pf.positions.len(), 1);
        assert_eq!(pf.order_count, 1);

        let pos = &pf.positions[0];
        let fill = 1.0 * (1.0 + SLIPPAGE_PCT);
        assert!((pos.avg_entry_price - fill).abs() < 1e-12);
        let expected_qty = (0.1 - 0.1 * FEE_PCT) / fill;
        assert!((pos.quantity - expected_qty).abs() < 1e-12);
        assert_eq!(order.ts, LATENCY_MS);
    }

    #[test]
    fn repeat_buy_averages_cost_basis() {
        let mut pf = Portfolio::new("p1");
        execute(&mut pf, &buy_intent("0xaaa", 0.1), 1.0, 0).unwrap();
        let q1 = pf.positions[0].quantity;
        let p1 = pf.positions[0].avg_entry_price;

        execute(&mut pf, &buy_intent("0xaaa", 0.1), 2.0, 1_000).unwrap();
        assert_eq!(pf.positions.len(), 1);
        let pos = &pf.positions[0];
        let fill2 = 2.0 * (1.0 + SLIPPAGE_PCT);
        let q2 = (0.1 - 0.1 * FEE_PCT) / fill2;
        let expected_avg = (q1 * p1 + q2 * fill2) / (q1 + q2);
        assert!((pos.avg_entry_price - expected_avg).abs() < 1e-12);
        assert!((pos.quantity - (q1 + q2)).abs() < 1e-12);
    }

    #[test]
    fn buy_whole_balance_rejected_by_fee_buffer() {
        let mut pf = Portfolio::new("p1");
        let err = execute(&mut pf, &buy_intent("0xaaa", START_BALANCE), 1.0, 0).unwrap_err();
        assert!(matches!(err, TradeError::InsufficientBalance { .. }));
        assert_eq!(pf.balance, START_BALANCE);
        assert!(pf.positions.is_empty());
    }

    #[test]
    fn order_cap_blocks_buys() {
        let mut pf = Portfolio::new("p1");
        pf.order_count = MAX_ORDERS_PER_MATCH;
        let err = execute(&mut pf, &buy_intent("0xaaa", 0.1), 1.0, 0).unwrap_err();
        assert!(matches!(err, TradeError::TooManyOrders(_)));
    }

    #[test]
    fn sell_without_position_fails() {
        let mut pf = Portfolio::new("p1");
        let err = execute(&mut pf, &sell_intent("0xaaa", 0.1), 1.0, 0).unwrap_err();
        assert_eq!(err, TradeError::NoPosition("0xaaa".to_string()));
    }

    #[test]
    fn sell_realizes_pnl_and_credits_net() {
        let mut pf = Portfolio::new("p1");
        execute(&mut pf, &buy_intent("0xaaa", 0.1), 1.0, 0).unwrap();
        let qty = pf.positions[0].quantity;
        let avg = pf.positions[0].avg_entry_price;
        let balance_after_buy = pf.balance;

        // Price doubles; sell everything.
        execute(&mut pf, &sell_intent("0xaaa", qty * 2.0), 2.0, 1_000).unwrap();

        let fill = 2.0 * (1.0 - SLIPPAGE_PCT);
        let gross = qty * fill;
        let net = gross - gross * FEE_PCT;
        assert!((pf.balance - (balance_after_buy + net)).abs() < 1e-12);
        assert!((pf.realized_pnl - (net - qty * avg)).abs() < 1e-12);
        assert!(pf.positions.is_empty());
    }

    #[test]
    fn dust_position_removed_after_near_total_sell() {
        // Buy 0.1 QUOTE at price 1, sell 0.0999 notional at the same price:
        // the residual falls below the dust threshold and the position goes.
        let mut pf = Portfolio::new("p1");
        execute(&mut pf, &buy_intent("0xaaa", 0.1), 1.0, 0).unwrap();
        execute(&mut pf, &sell_intent("0xaaa", 0.0999), 1.0, 1_000).unwrap();
        assert!(pf.positions.is_empty());
    }

    #[test]
    fn buy_then_sell_roundtrip_costs_two_fees() {
        let mut pf = Portfolio::new("p1");
        let amount = 0.2;
        execute(&mut pf, &buy_intent("0xaaa", amount), 1.0, 0).unwrap();
        let qty = pf.positions[0].quantity;
        execute(&mut pf, &sell_intent("0xaaa", qty * 10.0), 1.0, 1_000).unwrap();

        // Round trip at a flat price returns the balance minus both fees
        // and both slippage legs; no position remains.
        assert!(pf.positions.is_empty());
        assert!(pf.balance < START_BALANCE);
        let loss = START_BALANCE - pf.balance;
        let fee_and_slippage_bound = amount * (2.0 * FEE_PCT + 2.0 * SLIPPAGE_PCT) + 1e-9;
        assert!(loss > 0.0 && loss < fee_and_slippage_bound, "loss = {loss}");
    }

    #[test]
    fn partial_sell_keeps_position() {
        let mut pf = Portfolio::new("p1");
        execute(&mut pf, &buy_intent("0xaaa", 0.5), 1.0, 0).unwrap();
        let qty = pf.positions[0].quantity;

        execute(&mut pf, &sell_intent("0xaaa", 0.1), 1.0, 1_000).unwrap();
        assert_eq!(pf.positions.len(), 1);
        let remaining = pf.positions[0].quantity;
        assert!(remaining < qty && remaining > 0.0);
    }

    #[test]
    fn balance_never_negative() {
        let mut pf = Portfolio::new("p1");
        for i in 0..20 {
            let _ = execute(&mut pf, &buy_intent(&format!("0x{i}"), 0.3), 1.0, i);
        }
        assert!(pf.balance >= 0.0);
    }
}
