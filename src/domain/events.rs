use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order lifecycle events delivered by the execution layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEvent {
    /// Exchange acknowledged the order
    Created { order_id: String },
    /// A (partial) fill; `fill_id` is the exchange trade id
    Filled {
        order_id: String,
        fill_id: String,
        amount: Decimal,
        price: Decimal,
        fee: Decimal,
    },
    /// Order failed or was rejected
    Failed { order_id: String, reason: String },
}

impl OrderEvent {
    pub fn order_id(&self) -> &str {
        match self {
            OrderEvent::Created { order_id }
            | OrderEvent::Filled { order_id, .. }
            | OrderEvent::Failed { order_id, .. } => order_id,
        }
    }
}

/// Everything an engine reacts to, serialized through one inbox
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Periodic control pass
    Tick,
    /// Execution layer feedback
    Order(OrderEvent),
    /// Controller-requested stop: cancel open orders, liquidate, drain
    EarlyStop,
    /// Controller-requested retirement of an idle engine; ignored while trading
    Refresh,
}
