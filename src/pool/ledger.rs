use super::book::TokenBook;
use super::position::{PositionId, PositionKey, TokenType};
use super::queue::UnderwriterQueue;
use crate::errors::{MathError, PoolError, PoolResult};
use crate::math::{mul_div, Fixed64};
use crate::models::liquidity::calculate_c_level;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Minimum time between a deposit and withdrawing or transferring the
/// same free liquidity
pub const LIQUIDITY_LOCK_SECS: u64 = 86_400;

/// One underwriter's share of a newly written option.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Fill {
    pub underwriter: String,
    pub contracts: u128,
    pub collateral: u128,
    pub premium: u128,
}

/// One short holder's settlement when exposure is unwound.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Release {
    pub underwriter: String,
    pub contracts: u128,
    pub collateral: u128,
    pub value: u128,
    pub reinvested: bool,
}

pub type Fills = SmallVec<[Fill; 4]>;
pub type Releases = SmallVec<[Release; 4]>;

/// Per-side accounting. The call side is denominated in the underlying
/// token, the put side in the base token.
#[derive(Debug, Clone)]
pub struct SideLedger {
    pub is_call: bool,
    pub decimals: u8,
    pub queue: UnderwriterQueue<String>,
    pub c_level: Fixed64,
    /// Every token the side holds for anyone
    pub reserves: u128,
    pub fees_collected: u128,
    pub locked_total: u128,
    collateral: HashMap<PositionId, HashMap<String, u128>>,
    deposited_at: HashMap<String, u64>,
    divestment: HashMap<String, u64>,
}

impl SideLedger {
    pub fn new(is_call: bool, decimals: u8) -> Self {
        Self {
            is_call,
            decimals,
            queue: UnderwriterQueue::new(),
            c_level: Fixed64::ONE,
            reserves: 0,
            fees_collected: 0,
            locked_total: 0,
            collateral: HashMap::new(),
            deposited_at: HashMap::new(),
            divestment: HashMap::new(),
        }
    }

    pub fn deposited_at(&self, account: &str) -> u64 {
        self.deposited_at.get(account).copied().unwrap_or(0)
    }

    pub fn divestment_timestamp(&self, account: &str) -> u64 {
        self.divestment.get(account).copied().unwrap_or(0)
    }

    /// Freed liquidity goes back into the queue unless a divestment time
    /// has been set and reached.
    pub fn is_reinvesting(&self, account: &str, now: u64) -> bool {
        let ts = self.divestment_timestamp(account);
        ts == 0 || ts > now
    }

    pub fn collateral_of(&self, short_id: PositionId, account: &str) -> u128 {
        self.collateral
            .get(&short_id)
            .and_then(|m| m.get(account))
            .copied()
            .unwrap_or(0)
    }

    fn lock(&mut self, short_id: PositionId, account: &str, amount: u128) -> PoolResult<()> {
        *self
            .collateral
            .entry(short_id)
            .or_default()
            .entry(account.to_string())
            .or_insert(0) += amount;
        self.locked_total = self.locked_total.checked_add(amount).ok_or(MathError::Overflow)?;
        Ok(())
    }

    fn release(&mut self, short_id: PositionId, account: &str, amount: u128) -> PoolResult<()> {
        let held = self.collateral_of(short_id, account);
        let left = held.checked_sub(amount).ok_or_else(|| {
            PoolError::StateCorruption(format!("{account} releases {amount} of {held} locked"))
        })?;
        if let Some(m) = self.collateral.get_mut(&short_id) {
            if left == 0 {
                m.remove(account);
            } else {
                m.insert(account.to_string(), left);
            }
            if m.is_empty() {
                self.collateral.remove(&short_id);
            }
        }
        self.locked_total = self
            .locked_total
            .checked_sub(amount)
            .ok_or_else(|| PoolError::StateCorruption("locked total underflow".into()))?;
        Ok(())
    }

    pub fn collect_fee(&mut self, fee: u128) -> PoolResult<()> {
        self.fees_collected = self.fees_collected.checked_add(fee).ok_or(MathError::Overflow)?;
        Ok(())
    }

    pub fn receive(&mut self, amount: u128) -> PoolResult<()> {
        self.reserves = self.reserves.checked_add(amount).ok_or(MathError::Overflow)?;
        Ok(())
    }

    pub fn pay_out(&mut self, amount: u128) -> PoolResult<()> {
        self.reserves = self.reserves.checked_sub(amount).ok_or_else(|| {
            PoolError::StateCorruption(format!("payout {amount} exceeds reserves {}", self.reserves))
        })?;
        Ok(())
    }

    pub fn set_c_level(&mut self, c_level: Fixed64) -> PoolResult<()> {
        if !c_level.is_positive() {
            return Err(MathError::Underflow.into());
        }
        self.c_level = c_level;
        Ok(())
    }
}

/// Balances, underwriter queues and collateral for both sides of a pool.
#[derive(Debug, Clone)]
pub struct LiquidityLedger {
    pub book: TokenBook,
    pub call: SideLedger,
    pub put: SideLedger,
    underlying_decimals: u8,
    base_decimals: u8,
}

fn ratio(a: u128, b: u128, d: u128) -> PoolResult<u128> {
    mul_div(a, b, d).ok_or(PoolError::Arithmetic(MathError::Overflow))
}

impl LiquidityLedger {
    pub fn new(underlying_decimals: u8, base_decimals: u8) -> Self {
        Self {
            book: TokenBook::default(),
            call: SideLedger::new(true, underlying_decimals),
            put: SideLedger::new(false, base_decimals),
            underlying_decimals,
            base_decimals,
        }
    }

    #[inline]
    pub fn side(&self, is_call: bool) -> &SideLedger {
        if is_call {
            &self.call
        } else {
            &self.put
        }
    }

    #[inline]
    pub fn side_mut(&mut self, is_call: bool) -> &mut SideLedger {
        if is_call {
            &mut self.call
        } else {
            &mut self.put
        }
    }

    #[inline]
    fn free_id(is_call: bool) -> PositionId {
        PositionKey::liquidity(TokenType::free_liquidity(is_call)).encode()
    }

    #[inline]
    fn reserved_id(is_call: bool) -> PositionId {
        PositionKey::liquidity(TokenType::reserved_liquidity(is_call)).encode()
    }

    pub fn free_liquidity(&self, is_call: bool) -> u128 {
        self.book.total_supply(Self::free_id(is_call))
    }

    pub fn reserved_liquidity(&self, is_call: bool) -> u128 {
        self.book.total_supply(Self::reserved_id(is_call))
    }

    pub fn free_balance(&self, account: &str, is_call: bool) -> u128 {
        self.book.balance_of(account, Self::free_id(is_call))
    }

    pub fn reserved_balance(&self, account: &str, is_call: bool) -> u128 {
        self.book.balance_of(account, Self::reserved_id(is_call))
    }

    /// Free liquidity as 64.64 in whole tokens, optionally excluding one
    /// account's own balance.
    pub fn liquidity_fixed(&self, is_call: bool, excluding: Option<&str>) -> PoolResult<Fixed64> {
        let own = excluding.map_or(0, |a| self.free_balance(a, is_call));
        let free = self.free_liquidity(is_call) - own;
        Ok(Fixed64::from_decimals(free, self.side(is_call).decimals)?)
    }

    /// Converts an amount in underlying decimals to base decimals.
    pub fn to_base_decimals(&self, amount: u128) -> PoolResult<u128> {
        let scale = |d: u8| 10u128.checked_pow(d as u32).ok_or(MathError::Overflow);
        ratio(amount, scale(self.base_decimals)?, scale(self.underlying_decimals)?)
    }

    /// Tokens locked per `contracts` (underlying decimals): one underlying
    /// per call contract, `strike` base per put contract.
    pub fn collateral_amount(&self, is_call: bool, strike: Fixed64, contracts: u128) -> PoolResult<u128> {
        if is_call {
            Ok(contracts)
        } else {
            self.to_base_decimals(strike.mulu(contracts)?)
        }
    }

    fn mint_free(&mut self, account: &str, is_call: bool, amount: u128) -> PoolResult<()> {
        let before = self.book.mint(account, Self::free_id(is_call), amount)?;
        if before == 0 && amount > 0 {
            self.side_mut(is_call).queue.push_back(account.to_string());
        }
        Ok(())
    }

    fn burn_free(&mut self, account: &str, is_call: bool, amount: u128) -> PoolResult<()> {
        let after = self.book.burn(account, Self::free_id(is_call), amount)?;
        if after == 0 {
            self.side_mut(is_call).queue.remove(&account.to_string());
        }
        Ok(())
    }

    /// Routes returned liquidity to free (and the queue) or to reserved.
    fn credit_liquidity(&mut self, account: &str, is_call: bool, amount: u128, now: u64) -> PoolResult<bool> {
        let reinvest = self.side(is_call).is_reinvesting(account, now);
        if reinvest {
            self.mint_free(account, is_call, amount)?;
        } else {
            self.book.mint(account, Self::reserved_id(is_call), amount)?;
        }
        Ok(reinvest)
    }

    pub fn deposit(&mut self, account: &str, is_call: bool, amount: u128, now: u64) -> PoolResult<()> {
        self.mint_free(account, is_call, amount)?;
        let side = self.side_mut(is_call);
        side.receive(amount)?;
        side.deposited_at.insert(account.to_string(), now);
        side.divestment.remove(account);
        Ok(())
    }

    /// Draws reserved liquidity first, then free. Returns
    /// `(from_reserved, from_free)`.
    pub fn withdraw(&mut self, account: &str, is_call: bool, amount: u128, now: u64) -> PoolResult<(u128, u128)> {
        let from_reserved = self.reserved_balance(account, is_call).min(amount);
        let from_free = amount - from_reserved;

        if from_free > 0 {
            let unlocks_at = self.side(is_call).deposited_at(account) + LIQUIDITY_LOCK_SECS;
            if now < unlocks_at {
                return Err(PoolError::Validation(format!(
                    "liquidity locked until {unlocks_at}"
                )));
            }
            self.burn_free(account, is_call, from_free)?;
        }
        self.book.burn(account, Self::reserved_id(is_call), from_reserved)?;
        self.side_mut(is_call).pay_out(amount)?;
        Ok((from_reserved, from_free))
    }

    pub fn set_divestment_timestamp(&mut self, account: &str, is_call: bool, timestamp: u64) -> PoolResult<()> {
        let side = self.side_mut(is_call);
        let earliest = side.deposited_at(account) + LIQUIDITY_LOCK_SECS;
        if timestamp != 0 && timestamp < earliest {
            return Err(PoolError::Validation(format!(
                "divestment timestamp must be 0 or at least {earliest}"
            )));
        }
        if timestamp == 0 {
            side.divestment.remove(account);
        } else {
            side.divestment.insert(account.to_string(), timestamp);
        }
        Ok(())
    }

    /// Rebases the side's C-Level after free liquidity moved from
    /// `old_free` to its current value.
    pub fn rebase_c_level(&mut self, is_call: bool, old_free: u128, steepness: Fixed64) -> PoolResult<Fixed64> {
        let decimals = self.side(is_call).decimals;
        let old = Fixed64::from_decimals(old_free, decimals)?;
        let new = Fixed64::from_decimals(self.free_liquidity(is_call), decimals)?;
        let side = self.side_mut(is_call);
        let c_level = calculate_c_level(side.c_level, old, new, steepness)?;
        side.set_c_level(c_level)?;
        Ok(c_level)
    }

    /// Writes `contracts` of `short` against the underwriter queue.
    ///
    /// Each underwriter in queue order takes an interval of the remaining
    /// collateral sized by its free balance inflated by the unallocated
    /// premium, receives the matching share of contracts and premium
    /// (measured against the amount remaining before the interval), and
    /// burns `interval - premium` free liquidity. The final interval takes
    /// the exact remainders. Non-reinvesting
    /// underwriters are moved wholesale to reserved. The buyer's own entry
    /// is stepped over in place and keeps its queue position.
    pub fn mint_short(
        &mut self,
        buyer: &str,
        short: PositionKey,
        contracts: u128,
        collateral: u128,
        premium: u128,
        now: u64,
    ) -> PoolResult<Fills> {
        let is_call = short.token_type.is_call_side();
        let short_id = short.encode();
        let free_id = Self::free_id(is_call);

        let mut fills = Fills::new();
        let mut remaining_contracts = contracts;
        let mut remaining = collateral;
        let mut remaining_premium = premium;
        let mut buyer_passed = false;

        while remaining > 0 {
            let queue = &self.side(is_call).queue;
            let next = if buyer_passed {
                queue.next_after(&buyer.to_string())
            } else {
                queue.front()
            };
            let underwriter = next.cloned().ok_or_else(|| {
                PoolError::InsufficientLiquidity(if buyer_passed {
                    "no underwriters besides the buyer".into()
                } else {
                    "underwriter queue exhausted".into()
                })
            })?;

            if !self.side(is_call).is_reinvesting(&underwriter, now) {
                let balance = self.book.balance_of(&underwriter, free_id);
                self.burn_free(&underwriter, is_call, balance)?;
                self.book.mint(&underwriter, Self::reserved_id(is_call), balance)?;
                tracing::debug!(underwriter = %underwriter, amount = balance, "divested liquidity moved to reserved");
                continue;
            }

            if underwriter == buyer {
                buyer_passed = true;
                continue;
            }

            let balance = self.book.balance_of(&underwriter, free_id);
            if balance == 0 {
                self.burn_free(&underwriter, is_call, 0)?;
                continue;
            }
            let grossed = remaining.checked_add(remaining_premium).ok_or(MathError::Overflow)?;
            let interval = mul_div(balance, grossed, remaining).map_or(remaining, |c| c.min(remaining));

            // a partial interval always burns at least one free unit so
            // the loop makes progress
            let (taken, paid) = if interval == remaining {
                (remaining_contracts, remaining_premium)
            } else {
                (
                    ratio(remaining_contracts, interval, remaining)?,
                    ratio(remaining_premium, interval, remaining)?.min(interval - 1),
                )
            };
            let burned = interval.checked_sub(paid).ok_or_else(|| {
                PoolError::StateCorruption(format!("premium {paid} exceeds interval {interval}"))
            })?;

            self.burn_free(&underwriter, is_call, burned)?;
            self.book.mint(&underwriter, short_id, taken)?;
            self.side_mut(is_call).lock(short_id, &underwriter, interval)?;

            tracing::debug!(
                underwriter = %underwriter,
                contracts = taken,
                collateral = interval,
                premium = paid,
                "underwriting interval"
            );
            match fills.last_mut() {
                Some(last) if last.underwriter == underwriter => {
                    last.contracts += taken;
                    last.collateral += interval;
                    last.premium += paid;
                }
                _ => fills.push(Fill {
                    underwriter,
                    contracts: taken,
                    collateral: interval,
                    premium: paid,
                }),
            }

            remaining_contracts -= taken;
            remaining -= interval;
            remaining_premium -= paid;
        }

        Ok(fills)
    }

    /// Unwinds `contracts` of `short_id`, most recent holder first. Each
    /// holder's locked collateral is released pro rata, `value` is sourced
    /// from it pro rata (never more than that holder released), and the
    /// rest returns to the holder as free or reserved liquidity. Returns the
    /// total value sourced.
    pub fn burn_short(
        &mut self,
        short_id: PositionId,
        contracts: u128,
        value: u128,
        now: u64,
    ) -> PoolResult<(u128, Releases)> {
        let is_call = short_id.key()?.token_type.is_call_side();
        let mut releases = Releases::new();
        let mut remaining_contracts = contracts;
        let mut remaining_value = value;
        let mut sourced: u128 = 0;

        while remaining_contracts > 0 {
            let holder = self
                .book
                .last_holder(short_id)
                .map(str::to_string)
                .ok_or_else(|| PoolError::StateCorruption(format!("short supply of {short_id} exhausted")))?;

            let held = self.book.balance_of(&holder, short_id);
            let taken = held.min(remaining_contracts);
            let share = if taken == remaining_contracts {
                remaining_value
            } else {
                ratio(remaining_value, taken, remaining_contracts)?
            };
            let locked = self.side(is_call).collateral_of(short_id, &holder);
            let released = if taken == held {
                locked
            } else {
                ratio(locked, taken, held)?
            };
            let paid = share.min(released);

            self.book.burn(&holder, short_id, taken)?;
            self.side_mut(is_call).release(short_id, &holder, released)?;
            let reinvested = self.credit_liquidity(&holder, is_call, released - paid, now)?;

            releases.push(Release {
                underwriter: holder,
                contracts: taken,
                collateral: released,
                value: paid,
                reinvested,
            });
            sourced += paid;
            remaining_contracts -= taken;
            remaining_value -= share;
        }

        if self.book.total_supply(short_id) == 0 {
            self.sweep_collateral(short_id, is_call, now, &mut releases)?;
        }
        Ok((sourced, releases))
    }

    /// Returns collateral still locked against a fully burned short id.
    /// Only underwriters whose interval rounded to zero contracts hold any.
    fn sweep_collateral(
        &mut self,
        short_id: PositionId,
        is_call: bool,
        now: u64,
        releases: &mut Releases,
    ) -> PoolResult<()> {
        let leftovers: Vec<(String, u128)> = self
            .side(is_call)
            .collateral
            .get(&short_id)
            .map(|m| m.iter().map(|(a, v)| (a.clone(), *v)).collect())
            .unwrap_or_default();

        for (holder, amount) in leftovers {
            self.side_mut(is_call).release(short_id, &holder, amount)?;
            let reinvested = self.credit_liquidity(&holder, is_call, amount, now)?;
            releases.push(Release {
                underwriter: holder,
                contracts: 0,
                collateral: amount,
                value: 0,
                reinvested,
            });
        }
        Ok(())
    }

    /// Burns `contracts` of `holder`'s short position and unlocks the
    /// matching collateral without crediting it anywhere. Returns the
    /// unlocked amount.
    pub fn release_holder(&mut self, holder: &str, short_id: PositionId, contracts: u128) -> PoolResult<u128> {
        let is_call = short_id.key()?.token_type.is_call_side();
        let held = self.book.balance_of(holder, short_id);
        let locked = self.side(is_call).collateral_of(short_id, holder);
        let released = if contracts == held {
            locked
        } else {
            ratio(locked, contracts, held)?
        };
        self.book.burn(holder, short_id, contracts)?;
        self.side_mut(is_call).release(short_id, holder, released)?;
        Ok(released)
    }

    /// Moves tokens between accounts. Free liquidity respects the deposit
    /// lock and keeps both queues in sync; shorts carry their collateral.
    pub fn transfer(&mut self, from: &str, to: &str, id: PositionId, amount: u128, now: u64) -> PoolResult<()> {
        let key = id.key()?;
        let is_call = key.token_type.is_call_side();

        if key.token_type.is_free_liquidity() {
            let unlocks_at = self.side(is_call).deposited_at(from) + LIQUIDITY_LOCK_SECS;
            if now < unlocks_at {
                return Err(PoolError::Validation(format!(
                    "liquidity locked until {unlocks_at}"
                )));
            }
            self.burn_free(from, is_call, amount)?;
            self.mint_free(to, is_call, amount)?;
            return Ok(());
        }

        if key.token_type.is_short() {
            let held = self.book.balance_of(from, id);
            if amount > held {
                return Err(PoolError::InsufficientLiquidity(format!(
                    "{from} holds {held} of {id}, needs {amount}"
                )));
            }
            let moved = self.release_holder(from, id, amount)?;
            self.book.mint(to, id, amount)?;
            self.side_mut(is_call).lock(id, to, moved)?;
            return Ok(());
        }

        self.book.burn(from, id, amount)?;
        self.book.mint(to, id, amount)?;
        Ok(())
    }

    /// `free + reserved + locked + fees == reserves` per side, locked
    /// totals agree with per-holder collateral, and the queue holds
    /// exactly the free-liquidity holders.
    pub fn check_conservation(&self) -> PoolResult<()> {
        for side in [&self.call, &self.put] {
            let free = self.free_liquidity(side.is_call);
            let reserved = self.reserved_liquidity(side.is_call);
            let accounted = free
                .checked_add(reserved)
                .and_then(|v| v.checked_add(side.locked_total))
                .and_then(|v| v.checked_add(side.fees_collected))
                .ok_or(MathError::Overflow)?;
            if accounted != side.reserves {
                return Err(PoolError::StateCorruption(format!(
                    "{} side: free {free} + reserved {reserved} + locked {} + fees {} != reserves {}",
                    if side.is_call { "call" } else { "put" },
                    side.locked_total,
                    side.fees_collected,
                    side.reserves
                )));
            }

            let locked: u128 = side.collateral.values().flat_map(|m| m.values()).sum();
            if locked != side.locked_total {
                return Err(PoolError::StateCorruption(format!(
                    "locked total {} != per-holder collateral {locked}",
                    side.locked_total
                )));
            }

            let holders = self
                .book
                .holders(Self::free_id(side.is_call))
                .map_or(0, |h| h.len());
            if holders != side.queue.len() {
                return Err(PoolError::StateCorruption(format!(
                    "queue has {} underwriters, {holders} hold free liquidity",
                    side.queue.len()
                )));
            }
        }
        Ok(())
    }
}
