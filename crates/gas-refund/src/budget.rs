//! Global and per-account refund budgets for one processing run
//!
//! The guardian is built per run and shared by handle. `charge` performs the
//! check, the clipping and the increment under a single lock, so two
//! transactions of the same address can never both see the pre-charge
//! remaining budget.

use alloy::primitives::Address;
use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::RefundError;
use crate::types::{one_token, round_base_units, PriceRate, RefundRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    /// Token base units across every account in the run
    pub max_token_global: Decimal,
    pub max_usd_per_account: Decimal,
}

#[derive(Debug, Default)]
struct BudgetState {
    token_spent: Decimal,
    usd_spent: HashMap<Address, Decimal>,
}

/// Increment actually applied by [`BudgetGuardian::charge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charge {
    pub token: Decimal,
    pub usd: Decimal,
    pub clipped: bool,
}

pub struct BudgetGuardian {
    limits: BudgetLimits,
    state: Mutex<BudgetState>,
}

impl BudgetGuardian {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(BudgetState::default()),
        }
    }

    /// Guardian starting from amounts already refunded in persisted aggregates
    pub fn seeded(limits: BudgetLimits, records: &[RefundRecord]) -> Self {
        let guardian = Self::new(limits);
        guardian.seed(records);
        guardian
    }

    /// Add the refunded amounts of persisted aggregates to the spent totals
    pub fn seed(&self, records: &[RefundRecord]) {
        let mut state = self.lock();
        for record in records {
            state.token_spent += record.refunded_amount_token;
            *state.usd_spent.entry(record.address).or_default() += record.refunded_amount_usd;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    pub fn remaining_account_budget(&self, address: Address) -> Decimal {
        let state = self.lock();
        self.limits.max_usd_per_account - spent(&state, address)
    }

    pub fn remaining_global_budget(&self) -> Decimal {
        self.limits.max_token_global - self.lock().token_spent
    }

    pub fn is_global_exhausted(&self) -> bool {
        self.remaining_global_budget() <= Decimal::ZERO
    }

    pub fn is_account_exhausted(&self, address: Address) -> bool {
        self.remaining_account_budget(address) <= Decimal::ZERO
    }

    pub fn token_spent(&self) -> Decimal {
        self.lock().token_spent
    }

    pub fn usd_spent(&self, address: Address) -> Decimal {
        spent(&self.lock(), address)
    }

    /// Record an increment as-is, without clipping
    pub fn consume(&self, address: Address, token: Decimal, usd: Decimal) {
        let mut state = self.lock();
        state.token_spent += token;
        *state.usd_spent.entry(address).or_default() += usd;
    }

    /// Clip a proposed refund to both caps and apply it atomically.
    ///
    /// Over the account cap, the USD increment becomes exactly the remaining
    /// budget and the token amount is recomputed from the price, in whole
    /// base units. The token amount is then clipped to the remaining global
    /// budget.
    pub fn charge(
        &self,
        address: Address,
        token: Decimal,
        usd: Decimal,
        rate: &PriceRate,
    ) -> Result<Charge> {
        let mut state = self.lock();
        let remaining_usd = self.limits.max_usd_per_account - spent(&state, address);
        if remaining_usd < Decimal::ZERO {
            return Err(RefundError::NegativeClippedIncrement {
                address,
                remaining_usd,
            }
            .into());
        }

        let mut charge = Charge {
            token,
            usd,
            clipped: false,
        };

        if charge.usd > remaining_usd {
            charge.usd = remaining_usd;
            charge.token = round_base_units(remaining_usd * one_token() / rate.token_usd);
            charge.clipped = true;
            warn!(%address, remaining_usd = %remaining_usd, "account budget reached, clipping refund");
        }

        let remaining_token = (self.limits.max_token_global - state.token_spent).max(Decimal::ZERO);
        if charge.token > remaining_token {
            charge.token = remaining_token;
            charge.usd = remaining_token * rate.token_usd / one_token();
            charge.clipped = true;
            warn!(%address, remaining_token = %remaining_token, "global budget reached, clipping refund");
        }

        state.token_spent += charge.token;
        *state.usd_spent.entry(address).or_default() += charge.usd;
        debug!(%address, token = %charge.token, usd = %charge.usd, "charged budget");
        Ok(charge)
    }

    /// Forget all spending, e.g. before processing another epoch
    pub fn reset(&self) {
        *self.lock() = BudgetState::default();
    }
}

fn spent(state: &BudgetState, address: Address) -> Decimal {
    state.usd_spent.get(&address).copied().unwrap_or(Decimal::ZERO)
}
