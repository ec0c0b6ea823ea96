//! Store port — the transactional data store the import engine writes through.

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use super::entity::{
    Account, AccountId, Category, CategoryId, Recipient, RecipientId, Tag, TransactionId,
};
use super::money::Money;
use super::transaction::{NewTransaction, Transaction};

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Per-write behaviour the caller opts into. An import run passes
/// `bulk = true` and `defer_balance_maintenance = true` for every write and
/// recomputes balances itself afterwards; there is no process-wide mode to
/// set or restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub bulk: bool,
    pub defer_balance_maintenance: bool,
}

impl WriteOptions {
    pub fn bulk_import() -> Self {
        WriteOptions { bulk: true, defer_balance_maintenance: true }
    }
}

/// Database abstraction. Adapters provide the actual storage logic; the
/// import pipeline only ever talks to this trait.
#[async_trait]
pub trait Ledger: Send + Sync {
    // === Entities ===

    async fn accounts(&self) -> Result<Vec<Account>, LedgerError>;

    async fn recipients(&self) -> Result<Vec<Recipient>, LedgerError>;

    async fn categories(&self) -> Result<Vec<Category>, LedgerError>;

    async fn tags(&self) -> Result<Vec<Tag>, LedgerError>;

    async fn create_recipient(&self, name: &str) -> Result<Recipient, LedgerError>;

    async fn create_category(&self, name: &str) -> Result<Category, LedgerError>;

    async fn create_tag(&self, name: &str) -> Result<Tag, LedgerError>;

    // === Transactions ===

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>, LedgerError>;

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>, LedgerError>;

    async fn transactions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Transaction>, LedgerError>;

    async fn create_transaction(
        &self,
        tx: &NewTransaction,
        opts: WriteOptions,
    ) -> Result<Transaction, LedgerError>;

    /// Bulk insert. Either the whole batch is written or the call fails;
    /// callers fall back to per-item writes on failure.
    async fn create_transactions(
        &self,
        batch: &[NewTransaction],
        opts: WriteOptions,
    ) -> Result<Vec<Transaction>, LedgerError>;

    async fn set_transaction_category(
        &self,
        id: TransactionId,
        category_id: CategoryId,
    ) -> Result<(), LedgerError>;

    /// Creates both legs of an account-to-account transfer: a negative leg
    /// on `from` and a positive leg on `to`, cross-linked via
    /// `counterpart_id`. `amount` must be positive.
    #[allow(clippy::too_many_arguments)]
    async fn create_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Money,
        date: NaiveDate,
        value_date: NaiveDate,
        note: &str,
        opts: WriteOptions,
    ) -> Result<(Transaction, Transaction), LedgerError>;

    // === Balances ===

    /// Recomputes the running balance of `account_id` from its full
    /// transaction history and stores the result.
    async fn recompute_balance(&self, account_id: AccountId) -> Result<Money, LedgerError>;

    async fn balance(&self, account_id: AccountId) -> Result<Money, LedgerError>;

    /// Rebuilds the derived end-of-month balances for every account.
    async fn recompute_monthly_balances(&self) -> Result<(), LedgerError>;
}
