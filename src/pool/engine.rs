use super::ledger::{Fills, LiquidityLedger, Releases};
use super::position::{PositionId, PositionKey, TokenType};
use super::prices::{PriceFeed, PriceHistory, PriceObservation, SECONDS_PER_DAY};
use crate::config::PoolConfig;
use crate::errors::{PoolError, PoolResult};
use crate::math::Fixed64;
use crate::models::black_scholes::OptionParams;
use crate::models::quote::{quote, QuoteArgs};
use crate::models::volatility::VolatilityEstimator;
use crate::models::VarianceModel;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

const SECONDS_PER_YEAR: u128 = 365 * SECONDS_PER_DAY as u128;
const MIN_MATURITY_SECS: u64 = SECONDS_PER_DAY;
const MAX_MATURITY_SECS: u64 = 28 * SECONDS_PER_DAY;

/// An option is live through its maturity second and expired after it.
#[inline]
fn has_expired(maturity: u64, now: u64) -> bool {
    maturity < now
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QuoteResult {
    /// Per-contract price in base units
    pub price: Fixed64,
    pub spot: Fixed64,
    pub variance: Fixed64,
    pub c_level: Fixed64,
    pub slippage_coefficient: Fixed64,
    pub collateral: u128,
    pub base_cost: u128,
    pub fee_cost: u128,
    pub cost: u128,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PurchaseReceipt {
    pub buyer: String,
    pub long_id: PositionId,
    pub short_id: PositionId,
    pub contracts: u128,
    pub base_cost: u128,
    pub fee_cost: u128,
    pub cost: u128,
    pub c_level: Fixed64,
    pub fills: Fills,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExerciseReceipt {
    pub holder: String,
    pub long_id: PositionId,
    pub contracts: u128,
    pub spot: Fixed64,
    pub value: u128,
    pub fee: u128,
    pub payout: u128,
    pub releases: Releases,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReassignReceipt {
    pub holder: String,
    pub short_id: PositionId,
    pub contracts: u128,
    pub released: u128,
    pub base_cost: u128,
    pub fee_cost: u128,
    pub amount_out: u128,
    pub fills: Fills,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LiquidityReceipt {
    pub account: String,
    pub is_call: bool,
    pub amount: u128,
    pub from_reserved: u128,
    pub from_free: u128,
    pub c_level: Fixed64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SideSnapshot {
    pub free_liquidity: u128,
    pub reserved_liquidity: u128,
    pub locked_collateral: u128,
    pub fees_collected: u128,
    pub reserves: u128,
    pub c_level: Fixed64,
    pub underwriters: Vec<String>,
    pub variance_model: &'static str,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolSnapshot {
    pub spot: Option<PriceObservation>,
    pub annualized_variance: Fixed64,
    pub volatility_samples: u64,
    pub call: SideSnapshot,
    pub put: SideSnapshot,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PositionView {
    pub id: PositionId,
    pub key: PositionKey,
    pub balance: u128,
}

/// Everything a transaction may mutate. Cloned before each transaction and
/// restored on failure.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub ledger: LiquidityLedger,
    pub estimator: VolatilityEstimator,
    pub history: PriceHistory,
    approvals: HashMap<String, HashSet<String>>,
}

pub struct Pool {
    config: PoolConfig,
    feed: Arc<dyn PriceFeed>,
    pub state: PoolState,
}

impl Pool {
    pub fn new(config: PoolConfig, feed: Arc<dyn PriceFeed>) -> PoolResult<Self> {
        let state = PoolState {
            ledger: LiquidityLedger::new(config.underlying_decimals, config.base_decimals),
            estimator: VolatilityEstimator::new(config.initial_variance)?,
            history: PriceHistory::default(),
            approvals: HashMap::new(),
        };
        Ok(Self { config, feed, state })
    }

    fn variance_model(&self, is_call: bool) -> &dyn VarianceModel {
        let surface = if is_call {
            self.config.call_surface.as_ref()
        } else {
            self.config.put_surface.as_ref()
        };
        match surface {
            Some(s) => s as &dyn VarianceModel,
            None => &self.state.estimator as &dyn VarianceModel,
        }
    }

    /// Pulls the feed at most once per timestamp, records the observation
    /// and advances the estimator. Returns the spot price.
    pub fn update(&mut self, now: u64) -> PoolResult<Fixed64> {
        if let Some(latest) = self.state.history.latest() {
            if latest.timestamp >= now {
                return Ok(latest.price);
            }
        }
        let price = self.feed.latest_price(now)?;
        self.state.history.record(PriceObservation {
            timestamp: now,
            price,
        });
        self.state.estimator.update(price, now)?;
        tracing::debug!(price = %price, timestamp = now, "price observed");
        Ok(price)
    }

    fn authorize(&self, caller: &str, holder: &str) -> PoolResult<()> {
        let approved = self
            .state
            .approvals
            .get(holder)
            .is_some_and(|ops| ops.contains(caller));
        if caller == holder || approved {
            Ok(())
        } else {
            Err(PoolError::Authorization(format!(
                "{caller} is not {holder} or an approved operator"
            )))
        }
    }

    /// Read-only quote against the feed's current price and the
    /// estimator's current state.
    pub fn quote(
        &self,
        buyer: &str,
        maturity: u64,
        strike: Fixed64,
        contracts: u128,
        is_call: bool,
        now: u64,
    ) -> PoolResult<QuoteResult> {
        if contracts == 0 {
            return Err(PoolError::Validation("size must be positive".into()));
        }
        if has_expired(maturity, now) {
            return Err(PoolError::ExpiryState("maturity has passed".into()));
        }
        let spot = self.feed.latest_price(now)?;
        self.price_option(buyer, maturity, strike, contracts, is_call, spot, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn price_option(
        &self,
        buyer: &str,
        maturity: u64,
        strike: Fixed64,
        contracts: u128,
        is_call: bool,
        spot: Fixed64,
        now: u64,
    ) -> PoolResult<QuoteResult> {
        if !strike.is_positive() {
            return Err(PoolError::Validation("strike must be positive".into()));
        }
        if maturity <= now {
            return Err(PoolError::Validation("no time left to maturity".into()));
        }
        let ledger = &self.state.ledger;
        let time_to_maturity = Fixed64::divu((maturity - now) as u128, SECONDS_PER_YEAR)?;
        let variance = self
            .variance_model(is_call)
            .annualized_variance(spot, strike, time_to_maturity)?;
        if !variance.is_positive() {
            return Err(PoolError::Validation("annualized variance is not positive".into()));
        }

        let collateral = ledger.collateral_amount(is_call, strike, contracts)?;
        if collateral == 0 {
            return Err(PoolError::Validation("size too small to collateralize".into()));
        }
        let available = ledger.free_liquidity(is_call) - ledger.free_balance(buyer, is_call);
        if available < collateral {
            return Err(PoolError::InsufficientLiquidity(format!(
                "needs {collateral}, {available} available"
            )));
        }

        let decimals = ledger.side(is_call).decimals;
        let old_liquidity = ledger.liquidity_fixed(is_call, Some(buyer))?;
        let new_liquidity = Fixed64::from_decimals(available - collateral, decimals)?;

        let q = quote(&QuoteArgs {
            option: OptionParams {
                variance,
                strike,
                spot,
                time_to_maturity,
                is_call,
            },
            old_c_level: ledger.side(is_call).c_level,
            old_liquidity,
            new_liquidity,
            steepness: self.config.steepness,
            min_apy: self.config.min_apy,
        })?;

        let base_cost = if is_call {
            q.price.checked_div(spot)?.mulu(contracts)?
        } else {
            ledger.to_base_decimals(q.price.mulu(contracts)?)?
        };
        let fee_cost = self.config.fee_rate.mulu(base_cost)?;

        Ok(QuoteResult {
            price: q.price,
            spot,
            variance,
            c_level: q.c_level,
            slippage_coefficient: q.slippage_coefficient,
            collateral,
            base_cost,
            fee_cost,
            cost: base_cost + fee_cost,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn purchase(
        &mut self,
        buyer: &str,
        maturity: u64,
        strike: Fixed64,
        contracts: u128,
        is_call: bool,
        max_cost: u128,
        now: u64,
    ) -> PoolResult<PurchaseReceipt> {
        if contracts == 0 {
            return Err(PoolError::Validation("size must be positive".into()));
        }
        if maturity % SECONDS_PER_DAY != 0 {
            return Err(PoolError::Validation("maturity must fall on a UTC day boundary".into()));
        }
        if maturity < now + MIN_MATURITY_SECS {
            return Err(PoolError::Validation("maturity less than 1 day away".into()));
        }
        if maturity >= now + MAX_MATURITY_SECS {
            return Err(PoolError::Validation("maturity 28 days or more away".into()));
        }

        let spot = self.update(now)?;
        if strike.checked_mul(Fixed64::TWO)? < spot || strike > spot.checked_mul(Fixed64::TWO)? {
            return Err(PoolError::Validation(format!(
                "strike {strike} outside [0.5, 2] x spot {spot}"
            )));
        }

        let q = self.price_option(buyer, maturity, strike, contracts, is_call, spot, now)?;
        if q.base_cost >= q.collateral {
            return Err(PoolError::Validation("premium is not below collateral".into()));
        }
        if q.cost > max_cost {
            return Err(PoolError::SlippageExceeded {
                cost: q.cost,
                max_cost,
            });
        }

        let short = PositionKey::option(TokenType::short(is_call), maturity, strike);
        let long_id = short.with_type(TokenType::long(is_call)).encode();
        let ledger = &mut self.state.ledger;

        ledger.book.mint(buyer, long_id, contracts)?;
        let side = ledger.side_mut(is_call);
        side.receive(q.cost)?;
        side.collect_fee(q.fee_cost)?;
        let fills = ledger.mint_short(buyer, short, contracts, q.collateral, q.base_cost, now)?;
        ledger.side_mut(is_call).set_c_level(q.c_level)?;

        tracing::info!(
            buyer = %buyer,
            is_call,
            maturity,
            strike = %strike,
            contracts,
            cost = q.cost,
            underwriters = fills.len(),
            "option purchased"
        );
        Ok(PurchaseReceipt {
            buyer: buyer.to_string(),
            long_id,
            short_id: short.encode(),
            contracts,
            base_cost: q.base_cost,
            fee_cost: q.fee_cost,
            cost: q.cost,
            c_level: q.c_level,
            fills,
        })
    }

    /// Exercises on behalf of `holder`. Before maturity only in-the-money
    /// options qualify and settle at spot; after maturity they settle at
    /// the first daily price observed at or after maturity.
    pub fn exercise_from(
        &mut self,
        caller: &str,
        holder: &str,
        long_id: PositionId,
        contracts: u128,
        now: u64,
    ) -> PoolResult<ExerciseReceipt> {
        self.authorize(caller, holder)?;
        let key = long_id.key()?;
        if !key.token_type.is_long() {
            return Err(PoolError::Validation("only long positions can be exercised".into()));
        }
        if contracts == 0 {
            return Err(PoolError::Validation("size must be positive".into()));
        }
        let held = self.state.ledger.book.balance_of(holder, long_id);
        if held < contracts {
            return Err(PoolError::InsufficientLiquidity(format!(
                "{holder} holds {held} of {long_id}"
            )));
        }

        let spot_now = self.update(now)?;
        let spot = if has_expired(key.maturity, now) {
            self.settlement_price(key.maturity)?
        } else {
            let in_the_money = if key.token_type.is_call_side() {
                spot_now > key.strike
            } else {
                key.strike > spot_now
            };
            if !in_the_money {
                return Err(PoolError::Validation("option is not in the money".into()));
            }
            spot_now
        };

        self.settle_long(holder, key, contracts, spot, now)
    }

    /// Settles every holder of an expired long position.
    pub fn process_expired(&mut self, long_id: PositionId, now: u64) -> PoolResult<Vec<ExerciseReceipt>> {
        let key = long_id.key()?;
        if !key.token_type.is_long() {
            return Err(PoolError::Validation("only long positions settle at expiry".into()));
        }
        if !has_expired(key.maturity, now) {
            return Err(PoolError::ExpiryState("option has not expired".into()));
        }
        self.update(now)?;
        let spot = self.settlement_price(key.maturity)?;

        let mut receipts = Vec::new();
        while let Some(holder) = self.state.ledger.book.last_holder(long_id).map(str::to_string) {
            let contracts = self.state.ledger.book.balance_of(&holder, long_id);
            receipts.push(self.settle_long(&holder, key, contracts, spot, now)?);
        }
        tracing::info!(long_id = %long_id, holders = receipts.len(), spot = %spot, "expired position processed");
        Ok(receipts)
    }

    fn settlement_price(&self, maturity: u64) -> PoolResult<Fixed64> {
        self.state
            .history
            .price_at_or_after(maturity)
            .map(|obs| obs.price)
            .ok_or_else(|| PoolError::ExternalDependency(format!("no price observed since maturity {maturity}")))
    }

    /// Value owed to the long side, in side tokens. Calls pay
    /// `(S - K) / S` underlying per contract, puts `K - S` base.
    fn exercise_value(&self, key: PositionKey, spot: Fixed64, contracts: u128) -> PoolResult<u128> {
        if key.token_type.is_call_side() {
            if spot <= key.strike {
                return Ok(0);
            }
            let per_contract = spot.checked_sub(key.strike)?.checked_div(spot)?;
            Ok(per_contract.mulu(contracts)?)
        } else {
            if key.strike <= spot {
                return Ok(0);
            }
            let per_contract = key.strike.checked_sub(spot)?;
            self.state.ledger.to_base_decimals(per_contract.mulu(contracts)?)
        }
    }

    fn settle_long(
        &mut self,
        holder: &str,
        key: PositionKey,
        contracts: u128,
        spot: Fixed64,
        now: u64,
    ) -> PoolResult<ExerciseReceipt> {
        let is_call = key.token_type.is_call_side();
        let long_id = key.encode();
        let short_id = key.with_type(TokenType::short(is_call)).encode();
        let value = self.exercise_value(key, spot, contracts)?;
        let fee_rate = self.config.fee_rate;
        let steepness = self.config.steepness;

        let ledger = &mut self.state.ledger;
        let old_free = ledger.free_liquidity(is_call);
        ledger.book.burn(holder, long_id, contracts)?;
        let (sourced, releases) = ledger.burn_short(short_id, contracts, value, now)?;

        let fee = fee_rate.mulu(sourced)?;
        let payout = sourced - fee;
        let side = ledger.side_mut(is_call);
        side.collect_fee(fee)?;
        side.pay_out(payout)?;
        ledger.rebase_c_level(is_call, old_free, steepness)?;

        tracing::info!(
            holder = %holder,
            long_id = %long_id,
            contracts,
            spot = %spot,
            payout,
            "long position settled"
        );
        Ok(ExerciseReceipt {
            holder: holder.to_string(),
            long_id,
            contracts,
            spot,
            value: sourced,
            fee,
            payout,
            releases,
        })
    }

    /// Hands `contracts` of the caller's short exposure to the next
    /// underwriters in queue order. The caller receives its released
    /// collateral minus the fresh premium and fee.
    pub fn reassign(&mut self, caller: &str, short_id: PositionId, contracts: u128, now: u64) -> PoolResult<ReassignReceipt> {
        let key = short_id.key()?;
        if !key.token_type.is_short() {
            return Err(PoolError::Validation("only short positions can be reassigned".into()));
        }
        if contracts == 0 {
            return Err(PoolError::Validation("size must be positive".into()));
        }
        if has_expired(key.maturity, now) {
            return Err(PoolError::ExpiryState("option has expired".into()));
        }
        let held = self.state.ledger.book.balance_of(caller, short_id);
        if held < contracts {
            return Err(PoolError::InsufficientLiquidity(format!(
                "{caller} holds {held} of {short_id}"
            )));
        }

        let is_call = key.token_type.is_call_side();
        let spot = self.update(now)?;
        let q = self.price_option(caller, key.maturity, key.strike, contracts, is_call, spot, now)?;

        let ledger = &mut self.state.ledger;
        let released = ledger.release_holder(caller, short_id, contracts)?;
        let amount_out = released
            .checked_sub(q.base_cost)
            .and_then(|v| v.checked_sub(q.fee_cost))
            .ok_or_else(|| PoolError::Validation("reassignment cost exceeds released collateral".into()))?;

        let side = ledger.side_mut(is_call);
        side.collect_fee(q.fee_cost)?;
        side.pay_out(amount_out)?;
        let fills = ledger.mint_short(caller, key, contracts, q.collateral, q.base_cost, now)?;
        ledger.side_mut(is_call).set_c_level(q.c_level)?;

        tracing::info!(
            holder = %caller,
            short_id = %short_id,
            contracts,
            amount_out,
            "short position reassigned"
        );
        Ok(ReassignReceipt {
            holder: caller.to_string(),
            short_id,
            contracts,
            released,
            base_cost: q.base_cost,
            fee_cost: q.fee_cost,
            amount_out,
            fills,
        })
    }

    pub fn deposit(&mut self, account: &str, amount: u128, is_call: bool, now: u64) -> PoolResult<LiquidityReceipt> {
        if amount == 0 {
            return Err(PoolError::Validation("amount must be positive".into()));
        }
        let ledger = &mut self.state.ledger;
        let old_free = ledger.free_liquidity(is_call);
        ledger.deposit(account, is_call, amount, now)?;
        let c_level = ledger.rebase_c_level(is_call, old_free, self.config.steepness)?;

        tracing::info!(account = %account, is_call, amount, c_level = %c_level, "liquidity deposited");
        Ok(LiquidityReceipt {
            account: account.to_string(),
            is_call,
            amount,
            from_reserved: 0,
            from_free: amount,
            c_level,
        })
    }

    pub fn withdraw(&mut self, account: &str, amount: u128, is_call: bool, now: u64) -> PoolResult<LiquidityReceipt> {
        if amount == 0 {
            return Err(PoolError::Validation("amount must be positive".into()));
        }
        let ledger = &mut self.state.ledger;
        let old_free = ledger.free_liquidity(is_call);
        let (from_reserved, from_free) = ledger.withdraw(account, is_call, amount, now)?;
        let c_level = ledger.rebase_c_level(is_call, old_free, self.config.steepness)?;

        tracing::info!(account = %account, is_call, amount, from_reserved, c_level = %c_level, "liquidity withdrawn");
        Ok(LiquidityReceipt {
            account: account.to_string(),
            is_call,
            amount,
            from_reserved,
            from_free,
            c_level,
        })
    }

    pub fn set_divestment_timestamp(&mut self, account: &str, timestamp: u64, is_call: bool) -> PoolResult<()> {
        self.state
            .ledger
            .set_divestment_timestamp(account, is_call, timestamp)?;
        tracing::info!(account = %account, is_call, timestamp, "divestment timestamp set");
        Ok(())
    }

    pub fn set_approval_for_all(&mut self, owner: &str, operator: &str, approved: bool) -> PoolResult<()> {
        if owner == operator {
            return Err(PoolError::Validation("cannot approve self".into()));
        }
        let ops = self.state.approvals.entry(owner.to_string()).or_default();
        if approved {
            ops.insert(operator.to_string());
        } else {
            ops.remove(operator);
        }
        Ok(())
    }

    pub fn transfer(
        &mut self,
        caller: &str,
        from: &str,
        to: &str,
        id: PositionId,
        amount: u128,
        now: u64,
    ) -> PoolResult<()> {
        self.authorize(caller, from)?;
        if from == to {
            return Err(PoolError::Validation("transfer to self".into()));
        }
        if amount == 0 {
            return Err(PoolError::Validation("amount must be positive".into()));
        }
        self.state.ledger.transfer(from, to, id, amount, now)?;
        tracing::info!(from = %from, to = %to, id = %id, amount, "position transferred");
        Ok(())
    }

    pub fn positions(&self, account: &str) -> Vec<PositionView> {
        self.state
            .ledger
            .book
            .positions_of(account)
            .into_iter()
            .filter_map(|(id, balance)| {
                id.key().ok().map(|key| PositionView { id, key, balance })
            })
            .collect()
    }

    /// Long positions past maturity that still have holders.
    pub fn expired_long_positions(&self, now: u64) -> Vec<PositionId> {
        let mut ids: Vec<PositionId> = self
            .state
            .ledger
            .book
            .live_ids()
            .filter(|id| {
                id.key()
                    .is_ok_and(|k| k.token_type.is_long() && has_expired(k.maturity, now))
            })
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> PoolResult<PoolSnapshot> {
        let ledger = &self.state.ledger;
        let side = |is_call: bool| {
            let s = ledger.side(is_call);
            SideSnapshot {
                free_liquidity: ledger.free_liquidity(is_call),
                reserved_liquidity: ledger.reserved_liquidity(is_call),
                locked_collateral: s.locked_total,
                fees_collected: s.fees_collected,
                reserves: s.reserves,
                c_level: s.c_level,
                underwriters: s.queue.iter().cloned().collect(),
                variance_model: self.variance_model(is_call).name(),
            }
        };
        Ok(PoolSnapshot {
            spot: self.state.history.latest(),
            annualized_variance: self.state.estimator.annualized_variance()?,
            volatility_samples: self.state.estimator.state.sample_count,
            call: side(true),
            put: side(false),
        })
    }
}

/// Per-pool exclusive lock. Every mutation runs as one transaction:
/// state is snapshotted, the operation runs, conservation is checked, and
/// any failure restores the snapshot.
pub struct PoolHandle {
    inner: Mutex<Pool>,
}

impl PoolHandle {
    pub fn new(pool: Pool) -> Self {
        Self {
            inner: Mutex::new(pool),
        }
    }

    pub fn transact<T>(&self, op: impl FnOnce(&mut Pool) -> PoolResult<T>) -> PoolResult<T> {
        let mut pool = self
            .inner
            .lock()
            .map_err(|_| PoolError::StateCorruption("pool lock poisoned".into()))?;
        let backup = pool.state.clone();

        let result = match op(&mut *pool) {
            Ok(value) => pool.state.ledger.check_conservation().map(|_| value),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            pool.state = backup;
            if matches!(e, PoolError::StateCorruption(_)) {
                tracing::error!(error = %e, "transaction rolled back on corrupted state");
            }
        }
        result
    }

    pub fn read<T>(&self, op: impl FnOnce(&Pool) -> T) -> PoolResult<T> {
        let pool = self
            .inner
            .lock()
            .map_err(|_| PoolError::StateCorruption("pool lock poisoned".into()))?;
        Ok(op(&*pool))
    }
}
