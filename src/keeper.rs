use crate::state::{AppState, PoolEvent};
use portable_atomic::Ordering;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Periodically settles every expired long position that still has holders.
pub async fn run_expiry_keeper(state: Arc<AppState>, period_secs: u64) {
    tracing::info!(period_secs, "expiry keeper started");
    let mut ticker = interval(Duration::from_secs(period_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        sweep(&state, now).await;
    }
}

/// One keeper pass. Returns the number of positions settled.
pub async fn sweep(state: &AppState, now: u64) -> usize {
    let expired = match state.pool.read(|p| p.expired_long_positions(now)) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!("keeper cannot read pool: {e}");
            return 0;
        }
    };

    let mut settled = 0;
    for long_id in expired {
        match state.pool.transact(|p| p.process_expired(long_id, now)) {
            Ok(settlements) => {
                settled += 1;
                state.counters.expiries_processed.fetch_add(1, Ordering::Relaxed);
                state
                    .publish(PoolEvent::Expired {
                        long_id,
                        settlements,
                    })
                    .await;
            }
            // a missing settlement price stays pending until one is observed
            Err(e) => tracing::warn!(long_id = %long_id, kind = e.kind(), "expiry not processed: {e}"),
        }
    }
    settled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::db;
    use crate::math::Fixed64;
    use crate::pool::{ManualPriceFeed, Pool, PoolHandle};
    use tokio::sync::mpsc;

    const DAY: u64 = 86_400;
    const T0: u64 = 1_617_235_200;
    const ONE: u128 = 1_000_000_000_000_000_000;

    fn state_with(feed: ManualPriceFeed) -> Arc<AppState> {
        let pool = Pool::new(PoolConfig::default(), Arc::new(feed.clone())).unwrap();
        let db = db::init_memory_db().unwrap();
        let (db_tx, db_rx) = mpsc::channel(64);
        tokio::spawn(db::run_db_writer(db.clone(), db_rx));
        AppState::new(db, Arc::new(PoolHandle::new(pool)), feed, db_tx)
    }

    #[tokio::test]
    async fn test_sweep_settles_expired_positions() {
        let feed = ManualPriceFeed::new();
        feed.set_price(2_000.0).unwrap();
        let state = state_with(feed.clone());
        let maturity = T0 + 2 * DAY;

        state
            .pool
            .transact(|p| p.deposit("lp", 100 * ONE, true, T0))
            .unwrap();
        let receipt = state
            .pool
            .transact(|p| p.purchase("buyer", maturity, Fixed64::from_int(2_000), ONE, true, u128::MAX, T0 + 60))
            .unwrap();

        // nothing expired yet
        assert_eq!(sweep(&state, maturity).await, 0);

        feed.set_price(2_500.0).unwrap();
        assert_eq!(sweep(&state, maturity + 60).await, 1);
        assert_eq!(state.counters.expiries_processed.load(Ordering::Relaxed), 1);

        state
            .pool
            .read(|p| {
                assert_eq!(p.state.ledger.book.total_supply(receipt.long_id), 0);
                assert_eq!(p.state.ledger.call.locked_total, 0);
            })
            .unwrap();
        assert_eq!(sweep(&state, maturity + 120).await, 0);
    }
}
