//! Simulated execution venue
//!
//! Fills market orders at the request price and reports the lifecycle
//! through the registered sinks, so the engine code path is identical to a
//! live venue. In manual mode orders stay open until the caller fills or
//! fails them.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ExchangeConfig;
use crate::domain::{InstrumentId, OrderCandidate, OrderEvent, OrderRequest, PositionAction};
use crate::error::{OrderError, Result};
use crate::exchange::{ExecutionAdapter, OrderEventSink};

#[derive(Debug, Clone, PartialEq)]
pub struct PaperConfig {
    pub quote_balance: Decimal,
    pub fee_rate: Decimal,
    pub min_notional: Decimal,
    /// Fill every order as soon as it is placed
    pub auto_fill: bool,
}

impl From<&ExchangeConfig> for PaperConfig {
    fn from(config: &ExchangeConfig) -> Self {
        Self {
            quote_balance: config.quote_balance,
            fee_rate: config.fee_rate,
            min_notional: config.min_notional,
            auto_fill: true,
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    filled: Decimal,
    open: bool,
}

#[derive(Default)]
struct PaperState {
    listeners: HashMap<InstrumentId, OrderEventSink>,
    orders: HashMap<String, PaperOrder>,
    submitted: Vec<OrderRequest>,
    /// Orders refused at submission (`place_order` returns `None`)
    reject_next: HashMap<PositionAction, u32>,
    /// Orders accepted and then reported failed
    fail_next: HashMap<PositionAction, u32>,
}

pub struct PaperExchange {
    config: PaperConfig,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        info!(
            balance = %config.quote_balance,
            fee_rate = %config.fee_rate,
            auto_fill = config.auto_fill,
            "Paper exchange ready"
        );
        Self {
            config,
            state: Mutex::new(PaperState::default()),
        }
    }

    /// Orders stay open until `fill` or `fail` is called
    pub fn manual(mut config: PaperConfig) -> Self {
        config.auto_fill = false;
        Self::new(config)
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse the next `count` submissions of `action`
    pub fn reject_next(&self, action: PositionAction, count: u32) {
        *self.state().reject_next.entry(action).or_default() += count;
    }

    /// Accept and then fail the next `count` submissions of `action`
    pub fn fail_next(&self, action: PositionAction, count: u32) {
        *self.state().fail_next.entry(action).or_default() += count;
    }

    /// Every request seen by `place_order`, accepted or not
    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.state().submitted.clone()
    }

    pub fn open_orders(&self) -> Vec<OrderRequest> {
        self.state()
            .orders
            .values()
            .filter(|o| o.open)
            .map(|o| o.request.clone())
            .collect()
    }

    /// Fill an open order; the order closes once fully filled
    pub fn fill(&self, order_id: &str, amount: Decimal, price: Decimal) -> bool {
        let mut state = self.state();
        let Some(order) = state.orders.get_mut(order_id).filter(|o| o.open) else {
            return false;
        };
        order.filled += amount;
        if order.filled >= order.request.amount {
            order.open = false;
        }
        let instrument = order.request.instrument.clone();
        let event = OrderEvent::Filled {
            order_id: order_id.to_string(),
            fill_id: Uuid::new_v4().to_string(),
            amount,
            price,
            fee: self.fee(amount, price),
        };
        Self::emit(&state, &instrument, event);
        true
    }

    /// Report an open order as failed
    pub fn fail(&self, order_id: &str, reason: &str) -> bool {
        let mut state = self.state();
        let Some(order) = state.orders.get_mut(order_id).filter(|o| o.open) else {
            return false;
        };
        order.open = false;
        let instrument = order.request.instrument.clone();
        let event = OrderEvent::Failed {
            order_id: order_id.to_string(),
            reason: OrderError::Rejected {
                order_id: order_id.to_string(),
                reason: reason.to_string(),
            }
            .to_string(),
        };
        Self::emit(&state, &instrument, event);
        true
    }

    fn fee(&self, amount: Decimal, price: Decimal) -> Decimal {
        amount * price * self.config.fee_rate
    }

    fn emit(state: &PaperState, instrument: &InstrumentId, event: OrderEvent) {
        match state.listeners.get(instrument) {
            Some(sink) => {
                sink.deliver(event);
            }
            None => debug!(%instrument, ?event, "No listener registered, dropping paper event"),
        }
    }

    fn take(counter: &mut HashMap<PositionAction, u32>, action: PositionAction) -> bool {
        match counter.get_mut(&action) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ExecutionAdapter for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<Option<String>> {
        let mut state = self.state();
        state.submitted.push(request.clone());

        if Self::take(&mut state.reject_next, request.action) {
            info!(instrument = %request.instrument, action = ?request.action, "Paper exchange refused order");
            return Ok(None);
        }

        let order_id = request.client_order_id.clone();
        let fail = Self::take(&mut state.fail_next, request.action);
        let fill = !fail && self.config.auto_fill;
        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                request: request.clone(),
                filled: if fill { request.amount } else { Decimal::ZERO },
                open: !(fail || fill),
            },
        );

        debug!(
            order_id = %order_id,
            side = %request.side,
            amount = %request.amount,
            price = %request.price,
            "Paper order accepted"
        );
        Self::emit(
            &state,
            &request.instrument,
            OrderEvent::Created {
                order_id: order_id.clone(),
            },
        );

        if fail {
            Self::emit(
                &state,
                &request.instrument,
                OrderEvent::Failed {
                    order_id: order_id.clone(),
                    reason: OrderError::Rejected {
                        order_id: order_id.clone(),
                        reason: "scripted failure".to_string(),
                    }
                    .to_string(),
                },
            );
        } else if fill {
            Self::emit(
                &state,
                &request.instrument,
                OrderEvent::Filled {
                    order_id: order_id.clone(),
                    fill_id: Uuid::new_v4().to_string(),
                    amount: request.amount,
                    price: request.price,
                    fee: self.fee(request.amount, request.price),
                },
            );
        }

        Ok(Some(order_id))
    }

    async fn cancel_order(&self, instrument: &InstrumentId, order_id: &str) -> Result<bool> {
        let mut state = self.state();
        match state.orders.get_mut(order_id) {
            Some(order) if order.open => {
                order.open = false;
                debug!(%instrument, order_id, "Paper order cancelled");
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(OrderError::NotFound {
                order_id: order_id.to_string(),
            }
            .into()),
        }
    }

    async fn adjust_order_candidate(&self, candidate: &OrderCandidate) -> Result<Decimal> {
        let notional = candidate.amount * candidate.price;
        if notional < self.config.min_notional {
            debug!(instrument = %candidate.instrument, %notional, "Below minimum notional");
            return Ok(Decimal::ZERO);
        }
        let margin = notional / Decimal::from(candidate.leverage.max(1));
        if margin > self.config.quote_balance {
            debug!(
                instrument = %candidate.instrument,
                %margin,
                balance = %self.config.quote_balance,
                "Insufficient paper balance"
            );
            return Ok(Decimal::ZERO);
        }
        Ok(candidate.amount)
    }

    fn register_listener(&self, instrument: &InstrumentId, sink: OrderEventSink) {
        self.state().listeners.insert(instrument.clone(), sink);
    }

    fn unregister_listener(&self, instrument: &InstrumentId) {
        self.state().listeners.remove(instrument);
    }
}
