use super::position::PositionId;
use crate::errors::{PoolError, PoolResult};
use std::collections::{BTreeSet, HashMap};

/// Holders of one token id in enumeration order. Removal swaps the last
/// holder into the vacated slot, so `last()` is the most recently added
/// holder unless a removal reordered it.
#[derive(Debug, Clone, Default)]
pub struct HolderSet {
    items: Vec<String>,
    index: HashMap<String, usize>,
}

impl HolderSet {
    pub fn insert(&mut self, account: &str) -> bool {
        if self.index.contains_key(account) {
            return false;
        }
        self.index.insert(account.to_string(), self.items.len());
        self.items.push(account.to_string());
        true
    }

    pub fn remove(&mut self, account: &str) -> bool {
        let Some(i) = self.index.remove(account) else {
            return false;
        };
        self.items.swap_remove(i);
        if let Some(moved) = self.items.get(i) {
            self.index.insert(moved.clone(), i);
        }
        true
    }

    #[inline]
    pub fn last(&self) -> Option<&str> {
        self.items.last().map(String::as_str)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Multi-token balance book: per-id balances, supplies, holder sets, and
/// a reverse index of the ids each account holds.
#[derive(Debug, Clone, Default)]
pub struct TokenBook {
    balances: HashMap<PositionId, HashMap<String, u128>>,
    supply: HashMap<PositionId, u128>,
    holders: HashMap<PositionId, HolderSet>,
    by_account: HashMap<String, BTreeSet<PositionId>>,
}

impl TokenBook {
    pub fn balance_of(&self, account: &str, id: PositionId) -> u128 {
        self.balances
            .get(&id)
            .and_then(|m| m.get(account))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_supply(&self, id: PositionId) -> u128 {
        self.supply.get(&id).copied().unwrap_or(0)
    }

    pub fn holders(&self, id: PositionId) -> Option<&HolderSet> {
        self.holders.get(&id)
    }

    pub fn last_holder(&self, id: PositionId) -> Option<&str> {
        self.holders.get(&id).and_then(HolderSet::last)
    }

    /// Ids with a non-zero supply, for keeper scans.
    pub fn live_ids(&self) -> impl Iterator<Item = PositionId> + '_ {
        self.supply.iter().filter(|(_, s)| **s > 0).map(|(id, _)| *id)
    }

    pub fn positions_of(&self, account: &str) -> Vec<(PositionId, u128)> {
        self.by_account
            .get(account)
            .map(|ids| {
                ids.iter()
                    .map(|id| (*id, self.balance_of(account, *id)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Credits `amount`; returns the holder's balance before the mint.
    pub fn mint(&mut self, account: &str, id: PositionId, amount: u128) -> PoolResult<u128> {
        if amount == 0 {
            return Ok(self.balance_of(account, id));
        }
        let supply = self.supply.entry(id).or_insert(0);
        *supply = supply
            .checked_add(amount)
            .ok_or_else(|| PoolError::StateCorruption(format!("supply overflow on {id}")))?;

        let balance = self
            .balances
            .entry(id)
            .or_default()
            .entry(account.to_string())
            .or_insert(0);
        let before = *balance;
        *balance += amount;

        if before == 0 {
            self.holders.entry(id).or_default().insert(account);
            self.by_account
                .entry(account.to_string())
                .or_default()
                .insert(id);
        }
        Ok(before)
    }

    /// Debits `amount`; returns the holder's balance after the burn.
    pub fn burn(&mut self, account: &str, id: PositionId, amount: u128) -> PoolResult<u128> {
        let before = self.balance_of(account, id);
        if amount > before {
            return Err(PoolError::InsufficientLiquidity(format!(
                "{account} holds {before} of {id}, needs {amount}"
            )));
        }
        if amount == 0 {
            return Ok(before);
        }
        let after = before - amount;

        if let Some(m) = self.balances.get_mut(&id) {
            if after == 0 {
                m.remove(account);
            } else {
                m.insert(account.to_string(), after);
            }
        }
        if let Some(s) = self.supply.get_mut(&id) {
            *s -= amount;
        }
        if after == 0 {
            if let Some(h) = self.holders.get_mut(&id) {
                h.remove(account);
            }
            if let Some(ids) = self.by_account.get_mut(account) {
                ids.remove(&id);
            }
        }
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::position::{PositionKey, TokenType};

    fn id() -> PositionId {
        PositionKey::liquidity(TokenType::UnderlyingFreeLiquidity).encode()
    }

    #[test]
    fn test_mint_burn_tracks_supply_and_holders() {
        let mut book = TokenBook::default();
        assert_eq!(book.mint("alice", id(), 100).unwrap(), 0);
        assert_eq!(book.mint("bob", id(), 50).unwrap(), 0);
        assert_eq!(book.mint("alice", id(), 1).unwrap(), 100);
        assert_eq!(book.total_supply(id()), 151);
        assert_eq!(book.last_holder(id()), Some("bob"));

        assert_eq!(book.burn("bob", id(), 50).unwrap(), 0);
        assert_eq!(book.last_holder(id()), Some("alice"));
        assert!(book.positions_of("bob").is_empty());
        assert_eq!(book.positions_of("alice"), vec![(id(), 101)]);
    }

    #[test]
    fn test_overdraw_rejected() {
        let mut book = TokenBook::default();
        book.mint("alice", id(), 10).unwrap();
        let err = book.burn("alice", id(), 11).unwrap_err();
        assert_eq!(err.kind(), "insufficient_liquidity");
        assert_eq!(book.balance_of("alice", id()), 10);
    }

    #[test]
    fn test_holder_set_swap_remove() {
        let mut set = HolderSet::default();
        for a in ["a", "b", "c", "d"] {
            set.insert(a);
        }
        set.remove("b");
        // "d" moved into the vacated slot: [a, d, c]
        assert_eq!(set.last(), Some("c"));
        assert!(!set.remove("b"));
        assert_eq!(set.len(), 3);
        set.remove("c");
        assert_eq!(set.last(), Some("d"));
        set.remove("d");
        assert_eq!(set.last(), Some("a"));
    }
}
