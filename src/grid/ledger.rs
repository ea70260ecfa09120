//! Rung ledger and position accounting
//!
//! The ledger is owned by exactly one engine and mutated only from its event
//! loop. Every order event is reconciled here; events for unknown orders and
//! replayed fills are reported, never applied.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::domain::{OrderEvent, TradeSide};

/// One opening order and the inventory it produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rung {
    pub order_id: String,
    pub requested_price: Decimal,
    pub requested_amount: Decimal,
    pub executed_base_amount: Decimal,
    pub average_executed_price: Decimal,
    pub cumulative_fee: Decimal,
    /// The opening order is still live at the exchange
    pub active: bool,
    /// Close order expected to retire this rung
    pub closing: Option<String>,
    /// Submission order, kept across a failure and a late restore
    #[serde(skip)]
    seq: u64,
}

impl Rung {
    fn new(order_id: String, price: Decimal, amount: Decimal, seq: u64) -> Self {
        Self {
            order_id,
            requested_price: price,
            requested_amount: amount,
            executed_base_amount: Decimal::ZERO,
            average_executed_price: Decimal::ZERO,
            cumulative_fee: Decimal::ZERO,
            active: true,
            closing: None,
            seq,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.executed_base_amount > Decimal::ZERO
    }

    pub fn awaiting_first_fill(&self) -> bool {
        self.active && !self.is_filled()
    }

    fn apply_fill(&mut self, amount: Decimal, price: Decimal, fee: Decimal, epsilon: Decimal) {
        let total = self.executed_base_amount + amount;
        self.average_executed_price =
            (self.average_executed_price * self.executed_base_amount + price * amount) / total;
        self.executed_base_amount = total;
        self.cumulative_fee += fee;
        if self.executed_base_amount + epsilon >= self.requested_amount {
            self.active = false;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseKind {
    /// Retires the tagged rungs only
    Partial,
    /// Liquidates the whole position
    Full,
}

/// A close order and the rungs it is meant to retire
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseOrder {
    pub order_id: String,
    pub kind: CloseKind,
    pub rung_ids: Vec<String>,
    pub target_amount: Decimal,
    pub filled_amount: Decimal,
    pub filled_quote: Decimal,
    pub fee: Decimal,
}

impl CloseOrder {
    pub fn average_fill_price(&self) -> Decimal {
        if self.filled_amount.is_zero() {
            Decimal::ZERO
        } else {
            self.filled_quote / self.filled_amount
        }
    }
}

/// What reconciling one order event did to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Acknowledged,
    OpenFilled,
    OpenFailed { had_fills: bool },
    CloseFilled { kind: CloseKind, confirmed: bool },
    CloseFailed { kind: CloseKind },
    /// Already applied (replayed fill, repeated failure, stale ack)
    Duplicate,
    /// References no tracked order
    Unmatched,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    side: TradeSide,
    epsilon: Decimal,
    rungs: Vec<Rung>,
    failed: Vec<Rung>,
    close: Option<CloseOrder>,
    position_average_price: Decimal,
    realized_profit: Decimal,
    cumulative_fee: Decimal,
    session_pnl: Decimal,
    opened_amount: Decimal,
    closed_amount: Decimal,
    applied_fills: HashSet<String>,
    retired_orders: HashSet<String>,
    next_seq: u64,
}

impl Ledger {
    pub fn new(side: TradeSide, epsilon: Decimal) -> Self {
        Self {
            side,
            epsilon,
            rungs: Vec::new(),
            failed: Vec::new(),
            close: None,
            position_average_price: Decimal::ZERO,
            realized_profit: Decimal::ZERO,
            cumulative_fee: Decimal::ZERO,
            session_pnl: Decimal::ZERO,
            opened_amount: Decimal::ZERO,
            closed_amount: Decimal::ZERO,
            applied_fills: HashSet::new(),
            retired_orders: HashSet::new(),
            next_seq: 0,
        }
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn side(&self) -> TradeSide {
        self.side
    }

    pub fn rungs(&self) -> &[Rung] {
        &self.rungs
    }

    pub fn failed(&self) -> &[Rung] {
        &self.failed
    }

    pub fn close_order(&self) -> Option<&CloseOrder> {
        self.close.as_ref()
    }

    /// Rung count, including rungs still waiting for their first fill
    pub fn open_nums(&self) -> usize {
        self.rungs.len()
    }

    pub fn filled_rungs(&self) -> impl Iterator<Item = &Rung> {
        self.rungs.iter().filter(|r| r.is_filled())
    }

    pub fn has_pending_open(&self) -> bool {
        self.rungs.iter().any(Rung::awaiting_first_fill)
    }

    pub fn close_in_flight(&self) -> bool {
        self.close.is_some()
    }

    /// Ids of opening orders still live at the exchange
    pub fn active_open_orders(&self) -> Vec<String> {
        self.rungs
            .iter()
            .filter(|r| r.active)
            .map(|r| r.order_id.clone())
            .collect()
    }

    /// Inventory held by the rungs
    pub fn open_filled_amount(&self) -> Decimal {
        self.rungs.iter().map(|r| r.executed_base_amount).sum()
    }

    /// Cumulative base amount bought (long) or sold (short) to open
    pub fn opened_amount(&self) -> Decimal {
        self.opened_amount
    }

    /// Cumulative base amount closed
    pub fn closed_amount(&self) -> Decimal {
        self.closed_amount
    }

    pub fn position_average_price(&self) -> Decimal {
        self.position_average_price
    }

    /// Cost basis of the open inventory in quote
    pub fn nominal_value(&self) -> Decimal {
        self.open_filled_amount() * self.position_average_price
    }

    pub fn realized_profit(&self) -> Decimal {
        self.realized_profit
    }

    pub fn cumulative_fee(&self) -> Decimal {
        self.cumulative_fee
    }

    /// Profit booked by completed full liquidations
    pub fn session_pnl(&self) -> Decimal {
        self.session_pnl
    }

    pub fn is_drained(&self) -> bool {
        self.open_filled_amount() <= self.epsilon
    }

    /// No inventory, no live orders
    pub fn is_flat(&self) -> bool {
        self.rungs.is_empty() && self.close.is_none()
    }

    /// Best entry among filled rungs: lowest for long, highest for short
    pub fn frontier_price(&self) -> Option<Decimal> {
        let prices = self.filled_rungs().map(|r| r.average_executed_price);
        match self.side {
            TradeSide::Long => prices.min(),
            TradeSide::Short => prices.max(),
        }
    }

    /// Filled rungs, not yet tagged by a close, that individually cleared `grid_close`
    pub fn partial_close_candidates(
        &self,
        last_price: Decimal,
        grid_close: Decimal,
    ) -> (Vec<String>, Decimal) {
        let selected: Vec<&Rung> = self
            .filled_rungs()
            .filter(|r| r.closing.is_none())
            .filter(|r| {
                self.side
                    .directional_return(last_price, r.average_executed_price)
                    > grid_close
            })
            .collect();
        let amount = selected.iter().map(|r| r.executed_base_amount).sum();
        (selected.into_iter().map(|r| r.order_id.clone()).collect(), amount)
    }

    /// Every filled rung and their total inventory
    pub fn full_close_targets(&self) -> (Vec<String>, Decimal) {
        let ids = self.filled_rungs().map(|r| r.order_id.clone()).collect();
        (ids, self.open_filled_amount())
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    pub fn add_open(&mut self, order_id: String, price: Decimal, amount: Decimal) {
        debug!(order_id = %order_id, %price, %amount, "Tracking opening order");
        self.rungs.push(Rung::new(order_id, price, amount, self.next_seq));
        self.next_seq += 1;
    }

    pub fn begin_close(
        &mut self,
        order_id: String,
        kind: CloseKind,
        rung_ids: Vec<String>,
        amount: Decimal,
    ) {
        for rung in self.rungs.iter_mut() {
            if rung_ids.contains(&rung.order_id) {
                rung.closing = Some(order_id.clone());
            }
        }
        debug!(order_id = %order_id, ?kind, rungs = rung_ids.len(), %amount, "Tracking close order");
        self.close = Some(CloseOrder {
            order_id,
            kind,
            rung_ids,
            target_amount: amount,
            filled_amount: Decimal::ZERO,
            filled_quote: Decimal::ZERO,
            fee: Decimal::ZERO,
        });
    }

    /// The opening order was cancelled at the exchange
    pub fn mark_cancelled(&mut self, order_id: &str) -> bool {
        let Some(idx) = self.rungs.iter().position(|r| r.order_id == order_id) else {
            return false;
        };
        self.retire_open(idx);
        true
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    pub fn apply(&mut self, event: &OrderEvent) -> EventOutcome {
        match event {
            OrderEvent::Created { order_id } => self.apply_created(order_id),
            OrderEvent::Filled {
                order_id,
                fill_id,
                amount,
                price,
                fee,
            } => self.apply_fill(order_id, fill_id, *amount, *price, *fee),
            OrderEvent::Failed { order_id, reason } => self.apply_failure(order_id, reason),
        }
    }

    fn apply_created(&self, order_id: &str) -> EventOutcome {
        if self.rungs.iter().any(|r| r.order_id == order_id)
            || self.close.as_ref().is_some_and(|c| c.order_id == order_id)
        {
            EventOutcome::Acknowledged
        } else if self.is_retired(order_id) {
            EventOutcome::Duplicate
        } else {
            EventOutcome::Unmatched
        }
    }

    fn apply_fill(
        &mut self,
        order_id: &str,
        fill_id: &str,
        amount: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> EventOutcome {
        if self.applied_fills.contains(fill_id) {
            return EventOutcome::Duplicate;
        }
        if amount <= Decimal::ZERO || price <= Decimal::ZERO {
            warn!(order_id, fill_id, %amount, %price, "Ignoring fill with non-positive amount or price");
            return EventOutcome::Unmatched;
        }

        if let Some(idx) = self.failed.iter().position(|r| r.order_id == order_id) {
            // Fill raced the failure report: the inventory is real
            warn!(order_id, "Fill received for failed opening order, restoring rung");
            let mut rung = self.failed.remove(idx);
            rung.active = true;
            let at = self.rungs.partition_point(|r| r.seq < rung.seq);
            self.rungs.insert(at, rung);
        }

        if let Some(idx) = self.rungs.iter().position(|r| r.order_id == order_id) {
            self.applied_fills.insert(fill_id.to_string());
            let filled = self.open_filled_amount();
            self.position_average_price =
                (self.position_average_price * filled + price * amount) / (filled + amount);
            self.rungs[idx].apply_fill(amount, price, fee, self.epsilon);
            self.opened_amount += amount;
            self.cumulative_fee += fee;
            return EventOutcome::OpenFilled;
        }

        if self.close.as_ref().is_some_and(|c| c.order_id == order_id) {
            self.applied_fills.insert(fill_id.to_string());
            return self.apply_close_fill(amount, price, fee);
        }

        if self.is_retired(order_id) {
            EventOutcome::Duplicate
        } else {
            EventOutcome::Unmatched
        }
    }

    fn apply_close_fill(&mut self, amount: Decimal, price: Decimal, fee: Decimal) -> EventOutcome {
        let Some(close) = self.close.as_mut() else {
            return EventOutcome::Unmatched;
        };
        close.filled_amount += amount;
        close.filled_quote += amount * price;
        close.fee += fee;

        let sign = self.side.sign();
        let close_id = close.order_id.clone();
        let mut remaining = amount;
        let mut profit = -fee;

        // Consume tagged rungs in opening order, each against its own entry
        for rung in self
            .rungs
            .iter_mut()
            .filter(|r| r.closing.as_deref() == Some(close_id.as_str()))
        {
            if remaining <= Decimal::ZERO {
                break;
            }
            let consumed = remaining.min(rung.executed_base_amount);
            if consumed <= Decimal::ZERO {
                continue;
            }
            let fee_share = rung.cumulative_fee * consumed / rung.executed_base_amount;
            profit += sign * consumed * (price - rung.average_executed_price) - fee_share;
            rung.cumulative_fee -= fee_share;
            rung.executed_base_amount -= consumed;
            remaining -= consumed;
        }
        if remaining > self.epsilon {
            warn!(order_id = %close_id, excess = %remaining, "Close fill exceeds tagged inventory");
        }

        let confirmed = close.filled_amount + self.epsilon >= close.target_amount;
        let kind = close.kind;

        self.realized_profit += profit;
        self.closed_amount += amount - remaining.max(Decimal::ZERO);
        self.cumulative_fee += fee;
        self.drop_consumed_rungs();

        if confirmed {
            self.confirm_close();
        }
        EventOutcome::CloseFilled { kind, confirmed }
    }

    fn confirm_close(&mut self) {
        let Some(close) = self.close.take() else {
            return;
        };
        for rung in self.rungs.iter_mut() {
            if rung.closing.as_deref() == Some(close.order_id.as_str()) {
                rung.closing = None;
            }
        }
        self.retired_orders.insert(close.order_id.clone());

        if close.kind == CloseKind::Full {
            self.session_pnl += self.realized_profit;
            self.realized_profit = Decimal::ZERO;
            if !self.is_drained() {
                warn!(
                    order_id = %close.order_id,
                    left = %self.open_filled_amount(),
                    "Inventory remains after full liquidation"
                );
            }
        }
        debug!(
            order_id = %close.order_id,
            kind = ?close.kind,
            avg_fill = %close.average_fill_price(),
            "Close order confirmed"
        );
    }

    fn apply_failure(&mut self, order_id: &str, reason: &str) -> EventOutcome {
        if let Some(idx) = self.rungs.iter().position(|r| r.order_id == order_id) {
            warn!(order_id, reason, "Opening order failed");
            let had_fills = self.rungs[idx].is_filled();
            self.retire_open(idx);
            return EventOutcome::OpenFailed { had_fills };
        }

        if self.close.as_ref().is_some_and(|c| c.order_id == order_id) {
            warn!(order_id, reason, "Close order failed");
            let kind = self.close.as_ref().map_or(CloseKind::Full, |c| c.kind);
            self.close = None;
            for rung in self.rungs.iter_mut() {
                if rung.closing.as_deref() == Some(order_id) {
                    rung.closing = None;
                }
            }
            self.retired_orders.insert(order_id.to_string());
            return EventOutcome::CloseFailed { kind };
        }

        if self.is_retired(order_id) {
            EventOutcome::Duplicate
        } else {
            EventOutcome::Unmatched
        }
    }

    /// Opening order is done at the exchange: drop it if it never filled
    fn retire_open(&mut self, idx: usize) {
        if self.rungs[idx].is_filled() {
            self.rungs[idx].active = false;
        } else {
            let mut rung = self.rungs.remove(idx);
            rung.active = false;
            self.failed.push(rung);
        }
    }

    /// Drops emptied rungs and re-averages what is left
    fn drop_consumed_rungs(&mut self) {
        let epsilon = self.epsilon;
        let retired = &mut self.retired_orders;
        self.rungs.retain(|r| {
            let keep = r.active || r.executed_base_amount > epsilon;
            if !keep {
                retired.insert(r.order_id.clone());
            }
            keep
        });
        self.recompute_average();
    }

    fn recompute_average(&mut self) {
        let filled = self.open_filled_amount();
        self.position_average_price = if filled > self.epsilon {
            self.rungs
                .iter()
                .map(|r| r.average_executed_price * r.executed_base_amount)
                .sum::<Decimal>()
                / filled
        } else {
            Decimal::ZERO
        };
    }

    fn is_retired(&self, order_id: &str) -> bool {
        self.retired_orders.contains(order_id) || self.failed.iter().any(|r| r.order_id == order_id)
    }
}
