//! Account ledger: balance, margin arithmetic and the append-only balance
//! event log.
//!
//! Accounting model: `balance` is cash and moves only on deposits,
//! withdrawals, realized P&L and liquidation fees. Reserving margin locks
//! part of the account's equity (`margin_used` up, `free_margin` down)
//! without moving cash, so `MarginReserved`/`MarginReleased` events are
//! recorded cash-neutral (`amount = 0`, quantity in the reason and linked
//! position). This keeps the running ledger sum equal to the cash balance
//! at every instant, open positions included.
//!
//! Every mutation validates `balance_after = balance_before + amount`
//! before writing the event, then updates the aggregate, all in the same
//! transaction.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::models::{AccountBalance, AccountBalanceEvent};
use crate::store::StoreTxn;
use crate::txn::TransactionCoordinator;
use crate::types::{AccountId, BalanceEventType, ExecutionId, PositionId};

/// Post-hoc equation tolerance (1e-4); arithmetic itself is exact
fn equation_tolerance() -> Decimal {
    Decimal::new(1, 4)
}

/// Margin health snapshot for one account
#[derive(Debug, Clone, Serialize)]
pub struct MarginStatus {
    pub account_id: AccountId,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub free_margin: Decimal,
    /// `None` means infinite (no margin in use)
    pub margin_level: Option<Decimal>,
    pub is_margin_call: bool,
    pub is_liquidation: bool,
}

/// Ledger thresholds, split from the full engine config so the ledger can
/// be built standalone
#[derive(Debug, Clone, Copy)]
pub struct MarginThresholds {
    pub margin_call_level: Decimal,
    pub liquidation_level: Decimal,
}

impl Default for MarginThresholds {
    fn default() -> Self {
        MarginThresholds {
            margin_call_level: Decimal::new(5, 1),
            liquidation_level: Decimal::new(2, 1),
        }
    }
}

/// The ledger facade (C3). Single-operation entry points wrap one
/// transactional primitive in a coordinator transaction; composite flows
/// (fills, closures, liquidation) call the `*_tx` primitives inside their
/// own transaction instead.
#[derive(Clone)]
pub struct Ledger {
    coordinator: Arc<TransactionCoordinator>,
    thresholds: MarginThresholds,
}

impl Ledger {
    pub fn new(coordinator: Arc<TransactionCoordinator>, thresholds: MarginThresholds) -> Self {
        Self {
            coordinator,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> MarginThresholds {
        self.thresholds
    }

    /// Create the account aggregate if it does not exist yet
    pub async fn create_account(
        &self,
        account_id: &str,
        leverage: Decimal,
        is_paper: bool,
    ) -> EngineResult<AccountBalance> {
        let account_id = account_id.to_string();
        self.coordinator
            .run_default("ledger.create_account", move |mut txn| {
                let account_id = account_id.clone();
                Box::pin(async move {
                    let result = async {
                        if let Some(existing) = txn.account(&account_id, true).await? {
                            return Ok(existing);
                        }
                        let account =
                            AccountBalance::new(account_id.clone(), Decimal::ZERO, leverage, is_paper);
                        txn.upsert_account(&account).await?;
                        Ok(account)
                    }
                    .await;
                    (txn, result)
                })
            })
            .await
    }

    pub async fn deposit(
        &self,
        account_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> EngineResult<AccountBalanceEvent> {
        self.balance_change(account_id, BalanceEventType::Deposit, amount, reason)
            .await
    }

    pub async fn withdraw(
        &self,
        account_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> EngineResult<AccountBalanceEvent> {
        self.balance_change(account_id, BalanceEventType::Withdrawal, -amount, reason)
            .await
    }

    /// Generic signed balance update
    pub async fn update_balance(
        &self,
        account_id: &str,
        event_type: BalanceEventType,
        amount: Decimal,
        reason: &str,
    ) -> EngineResult<AccountBalanceEvent> {
        self.balance_change(account_id, event_type, amount, reason).await
    }

    async fn balance_change(
        &self,
        account_id: &str,
        event_type: BalanceEventType,
        amount: Decimal,
        reason: &str,
    ) -> EngineResult<AccountBalanceEvent> {
        let account_id = account_id.to_string();
        let reason = reason.to_string();
        self.coordinator
            .run_default("ledger.update_balance", move |mut txn| {
                let account_id = account_id.clone();
                let reason = reason.clone();
                Box::pin(async move {
                    let result =
                        update_balance_tx(&mut *txn, &account_id, event_type, amount, &reason, None, None)
                            .await;
                    (txn, result)
                })
            })
            .await
    }

    pub async fn reserve_margin(
        &self,
        account_id: &str,
        position_id: PositionId,
        amount: Decimal,
    ) -> EngineResult<AccountBalanceEvent> {
        let account_id = account_id.to_string();
        self.coordinator
            .run_default("ledger.reserve_margin", move |mut txn| {
                let account_id = account_id.clone();
                Box::pin(async move {
                    let result =
                        reserve_margin_tx(&mut *txn, &account_id, position_id, amount).await;
                    (txn, result)
                })
            })
            .await
    }

    pub async fn release_margin(
        &self,
        account_id: &str,
        position_id: PositionId,
        amount: Decimal,
    ) -> EngineResult<AccountBalanceEvent> {
        let account_id = account_id.to_string();
        self.coordinator
            .run_default("ledger.release_margin", move |mut txn| {
                let account_id = account_id.clone();
                Box::pin(async move {
                    let result =
                        release_margin_tx(&mut *txn, &account_id, position_id, amount).await;
                    (txn, result)
                })
            })
            .await
    }

    pub async fn realize_pnl(
        &self,
        account_id: &str,
        position_id: PositionId,
        amount: Decimal,
        reason: &str,
    ) -> EngineResult<AccountBalanceEvent> {
        let account_id = account_id.to_string();
        let reason = reason.to_string();
        self.coordinator
            .run_default("ledger.realize_pnl", move |mut txn| {
                let account_id = account_id.clone();
                let reason = reason.clone();
                Box::pin(async move {
                    let result = realize_pnl_tx(
                        &mut *txn,
                        &account_id,
                        position_id,
                        None,
                        amount,
                        &reason,
                    )
                    .await;
                    (txn, result)
                })
            })
            .await
    }

    /// Margin health for an account. `unrealized_pnl` is the caller's
    /// mark-to-market sum over the account's open positions; pass zero for
    /// a cash-only view.
    pub async fn margin_status(
        &self,
        account_id: &str,
        unrealized_pnl: Decimal,
    ) -> EngineResult<MarginStatus> {
        let account = self
            .coordinator
            .store()
            .account(account_id)
            .await?
            .ok_or_else(|| EngineError::AccountNotFound(account_id.to_string()))?;
        Ok(classify_margin(&account, unrealized_pnl, self.thresholds))
    }
}

/// Margin-call / liquidation classification:
/// `is_margin_call <=> liquidation <= level < call`;
/// `is_liquidation <=> level < liquidation`
pub fn classify_margin(
    account: &AccountBalance,
    unrealized_pnl: Decimal,
    thresholds: MarginThresholds,
) -> MarginStatus {
    let equity = account.balance + unrealized_pnl;
    let free_margin = equity - account.margin_used;
    let margin_level = if account.margin_used.is_zero() {
        None
    } else {
        Some(equity / account.margin_used)
    };
    let (is_margin_call, is_liquidation) = match margin_level {
        None => (false, false),
        Some(level) => (
            level >= thresholds.liquidation_level && level < thresholds.margin_call_level,
            level < thresholds.liquidation_level,
        ),
    };
    MarginStatus {
        account_id: account.account_id.clone(),
        balance: account.balance,
        equity,
        margin_used: account.margin_used,
        free_margin,
        margin_level,
        is_margin_call,
        is_liquidation,
    }
}

// ------------------------------------------------------------
// Transactional primitives
// ------------------------------------------------------------

async fn locked_account(txn: &mut dyn StoreTxn, account_id: &str) -> EngineResult<AccountBalance> {
    txn.account(account_id, true)
        .await?
        .ok_or_else(|| EngineError::AccountNotFound(account_id.to_string()))
}

/// Validate the balance equation, write the event, then the aggregate
async fn write_event_and_account(
    txn: &mut dyn StoreTxn,
    account: &mut AccountBalance,
    event: AccountBalanceEvent,
) -> EngineResult<AccountBalanceEvent> {
    if event.equation_error() > equation_tolerance() {
        return Err(EngineError::Integrity(format!(
            "balance equation broken before write: {} + {} != {}",
            event.balance_before, event.amount, event.balance_after
        )));
    }
    let persisted = txn.insert_balance_event(&event).await?;
    account.updated_at = event.created_at;
    txn.upsert_account(account).await?;
    Ok(persisted)
}

/// Reserve margin for a position. Fails with `InsufficientMargin` when the
/// account's free margin cannot cover it; cash does not move.
pub async fn reserve_margin_tx(
    txn: &mut dyn StoreTxn,
    account_id: &str,
    position_id: PositionId,
    amount: Decimal,
) -> EngineResult<AccountBalanceEvent> {
    let mut account = locked_account(txn, account_id).await?;
    if account.free_margin < amount {
        return Err(EngineError::InsufficientMargin {
            required: amount,
            free: account.free_margin,
        });
    }
    account.margin_used += amount;
    account.free_margin = account.equity - account.margin_used;

    let event = AccountBalanceEvent {
        id: 0,
        account_id: account_id.to_string(),
        event_type: BalanceEventType::MarginReserved,
        balance_before: account.balance,
        amount: Decimal::ZERO,
        balance_after: account.balance,
        reason: format!("reserved {amount} margin"),
        position_id: Some(position_id),
        execution_id: None,
        created_at: Utc::now(),
    };
    write_event_and_account(txn, &mut account, event).await
}

/// Release margin back to the account; the released quantity is floored so
/// `margin_used` never goes negative
pub async fn release_margin_tx(
    txn: &mut dyn StoreTxn,
    account_id: &str,
    position_id: PositionId,
    amount: Decimal,
) -> EngineResult<AccountBalanceEvent> {
    let mut account = locked_account(txn, account_id).await?;
    let released = amount.min(account.margin_used).max(Decimal::ZERO);
    account.margin_used -= released;
    account.free_margin = account.equity - account.margin_used;

    let event = AccountBalanceEvent {
        id: 0,
        account_id: account_id.to_string(),
        event_type: BalanceEventType::MarginReleased,
        balance_before: account.balance,
        amount: Decimal::ZERO,
        balance_after: account.balance,
        reason: format!("released {released} margin"),
        position_id: Some(position_id),
        execution_id: None,
        created_at: Utc::now(),
    };
    write_event_and_account(txn, &mut account, event).await
}

/// Move realized P&L into cash
pub async fn realize_pnl_tx(
    txn: &mut dyn StoreTxn,
    account_id: &str,
    position_id: PositionId,
    execution_id: Option<ExecutionId>,
    amount: Decimal,
    reason: &str,
) -> EngineResult<AccountBalanceEvent> {
    let mut account = locked_account(txn, account_id).await?;
    let balance_before = account.balance;
    account.balance += amount;
    account.equity += amount;
    account.free_margin = account.equity - account.margin_used;

    let event = AccountBalanceEvent {
        id: 0,
        account_id: account_id.to_string(),
        event_type: BalanceEventType::PnlRealized,
        balance_before,
        amount,
        balance_after: account.balance,
        reason: reason.to_string(),
        position_id: Some(position_id),
        execution_id,
        created_at: Utc::now(),
    };
    write_event_and_account(txn, &mut account, event).await
}

/// Generic signed cash update (deposits, withdrawals, liquidation fees)
pub async fn update_balance_tx(
    txn: &mut dyn StoreTxn,
    account_id: &str,
    event_type: BalanceEventType,
    amount: Decimal,
    reason: &str,
    position_id: Option<PositionId>,
    execution_id: Option<ExecutionId>,
) -> EngineResult<AccountBalanceEvent> {
    let mut account = locked_account(txn, account_id).await?;
    if event_type == BalanceEventType::Withdrawal && account.free_margin < -amount {
        return Err(EngineError::InsufficientMargin {
            required: -amount,
            free: account.free_margin,
        });
    }
    let balance_before = account.balance;
    account.balance += amount;
    account.equity += amount;
    account.free_margin = account.equity - account.margin_used;

    let event = AccountBalanceEvent {
        id: 0,
        account_id: account_id.to_string(),
        event_type,
        balance_before,
        amount,
        balance_after: account.balance,
        reason: reason.to_string(),
        position_id,
        execution_id,
        created_at: Utc::now(),
    };
    write_event_and_account(txn, &mut account, event).await
}
