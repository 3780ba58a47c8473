use crate::db::DbPool;
use crate::pool::engine::{
    ExerciseReceipt, LiquidityReceipt, PoolSnapshot, PurchaseReceipt, ReassignReceipt,
};
use crate::pool::{ManualPriceFeed, PoolHandle, PositionId};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

// ── Events OUT of the pool ──

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    Snapshot(PoolSnapshot),
    PriceUpdate {
        price: f64,
        timestamp: u64,
    },
    Purchase(PurchaseReceipt),
    Exercise(ExerciseReceipt),
    Reassign(ReassignReceipt),
    Deposit(LiquidityReceipt),
    Withdraw(LiquidityReceipt),
    Divestment {
        account: String,
        is_call: bool,
        timestamp: u64,
    },
    Approval {
        owner: String,
        operator: String,
        approved: bool,
    },
    Transfer {
        from: String,
        to: String,
        id: PositionId,
        amount: u128,
    },
    Expired {
        long_id: PositionId,
        settlements: Vec<ExerciseReceipt>,
    },
    Rejected {
        operation: &'static str,
        kind: &'static str,
        error: String,
    },
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "snapshot",
            Self::PriceUpdate { .. } => "price_update",
            Self::Purchase(_) => "purchase",
            Self::Exercise(_) => "exercise",
            Self::Reassign(_) => "reassign",
            Self::Deposit(_) => "deposit",
            Self::Withdraw(_) => "withdraw",
            Self::Divestment { .. } => "divestment",
            Self::Approval { .. } => "approval",
            Self::Transfer { .. } => "transfer",
            Self::Expired { .. } => "expired",
            Self::Rejected { .. } => "rejected",
        }
    }

    /// Account the event is filed under in the journal.
    pub fn account(&self) -> Option<&str> {
        match self {
            Self::Purchase(r) => Some(&r.buyer),
            Self::Exercise(r) => Some(&r.holder),
            Self::Reassign(r) => Some(&r.holder),
            Self::Deposit(r) | Self::Withdraw(r) => Some(&r.account),
            Self::Divestment { account, .. } => Some(account),
            Self::Approval { owner, .. } => Some(owner),
            Self::Transfer { from, .. } => Some(from),
            _ => None,
        }
    }
}

// ── DB Commands (sent to writer task via bounded channel) ──

#[derive(Debug)]
pub enum DbCommand {
    InsertEvent {
        id: String,
        kind: &'static str,
        account: Option<String>,
        payload: String,
        created_at: String,
    },
    InsertPrice {
        timestamp: i64,
        price: f64,
    },
}

// ── Performance Counters (lock-free) ──

#[derive(Default)]
pub struct PerfCounters {
    pub operations_applied: AtomicU64,
    pub operations_rejected: AtomicU64,
    pub prices_received: AtomicU64,
    pub expiries_processed: AtomicU64,
    pub ws_messages_sent: AtomicU64,
}

// ── Application shared state ──

pub struct AppState {
    pub db: DbPool,

    // The pool itself; every mutation goes through its lock
    pub pool: Arc<PoolHandle>,

    // Operator-set spot price read by the pool
    pub feed: ManualPriceFeed,

    // Pool -> Dashboard: event stream (broadcast for WS clients)
    pub ws_tx: broadcast::Sender<PoolEvent>,

    // Pool -> DB Writer: bounded command channel
    pub db_tx: mpsc::Sender<DbCommand>,

    pub counters: PerfCounters,
}

impl AppState {
    pub fn new(
        db: DbPool,
        pool: Arc<PoolHandle>,
        feed: ManualPriceFeed,
        db_tx: mpsc::Sender<DbCommand>,
    ) -> Arc<Self> {
        let (ws_tx, _) = broadcast::channel(2048);

        Arc::new(Self {
            db,
            pool,
            feed,
            ws_tx,
            db_tx,
            counters: PerfCounters::default(),
        })
    }

    #[inline]
    pub fn broadcast(&self, event: PoolEvent) {
        self.counters.ws_messages_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.ws_tx.send(event);
    }

    /// Journals the event, then broadcasts it.
    pub async fn publish(&self, event: PoolEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => {
                let cmd = DbCommand::InsertEvent {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: event.name(),
                    account: event.account().map(str::to_string),
                    payload,
                    created_at: chrono::Utc::now().to_rfc3339(),
                };
                if self.db_tx.send(cmd).await.is_err() {
                    tracing::warn!(event = event.name(), "db writer gone, event not journaled");
                }
            }
            Err(e) => tracing::error!(event = event.name(), "event serialization failed: {e}"),
        }
        self.broadcast(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let ev = PoolEvent::Divestment {
            account: "alice".into(),
            is_call: true,
            timestamp: 42,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "divestment");
        assert_eq!(json["account"], "alice");
        assert_eq!(ev.account(), Some("alice"));

        let ev = PoolEvent::PriceUpdate {
            price: 2_000.0,
            timestamp: 1,
        };
        assert_eq!(serde_json::to_value(&ev).unwrap()["type"], "price_update");
        assert_eq!(ev.account(), None);
    }
}
