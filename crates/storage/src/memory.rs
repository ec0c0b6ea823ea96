//! In-memory `Ledger` for tests and ephemeral runs, with failure-injection
//! knobs so error paths in the import pipeline can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use tokio::sync::RwLock;

use collatio_core::{
    Account, AccountId, Category, CategoryId, Ledger, LedgerError, Money, NewTransaction,
    Recipient, RecipientId, Tag, TagId, Transaction, TransactionId, TransactionKind, WriteOptions,
};

#[derive(Default)]
struct Tables {
    accounts: Vec<Account>,
    recipients: Vec<Recipient>,
    categories: Vec<Category>,
    tags: Vec<Tag>,
    transactions: Vec<Transaction>,
    balances: HashMap<AccountId, Money>,
    monthly_balances: HashMap<(AccountId, i32, u32), Money>,
}

#[derive(Default)]
pub struct MemoryLedger {
    tables: RwLock<Tables>,
    next_id: AtomicI64,
    /// When set, `create_transactions` fails so callers hit the per-item
    /// fallback path.
    fail_bulk_writes: AtomicBool,
    /// When set, any single write whose note contains this marker fails.
    fail_note_marker: RwLock<Option<String>>,
    /// When set, `recompute_balance` fails for this account only.
    fail_balance_for: RwLock<Option<AccountId>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        MemoryLedger {
            next_id: AtomicI64::new(1),
            ..MemoryLedger::default()
        }
    }

    fn fresh_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    // === Seeding ===

    pub async fn add_account(&self, name: &str) -> AccountId {
        let id = AccountId(self.fresh_id());
        let mut tables = self.tables.write().await;
        tables.accounts.push(Account { id, name: name.to_string(), active: true });
        id
    }

    pub async fn add_recipient(&self, name: &str) -> RecipientId {
        let id = RecipientId(self.fresh_id());
        let mut tables = self.tables.write().await;
        tables.recipients.push(Recipient { id, name: name.to_string() });
        id
    }

    pub async fn add_category(&self, name: &str) -> CategoryId {
        let id = CategoryId(self.fresh_id());
        let mut tables = self.tables.write().await;
        tables.categories.push(Category { id, name: name.to_string() });
        id
    }

    pub async fn add_tag(&self, name: &str) -> TagId {
        let id = TagId(self.fresh_id());
        let mut tables = self.tables.write().await;
        tables.tags.push(Tag { id, name: name.to_string() });
        id
    }

    /// Inserts a fully-formed transaction, bypassing `WriteOptions`.
    pub async fn seed_transaction(&self, new: &NewTransaction) -> Transaction {
        let tx = self.build_transaction(new).await;
        self.tables.write().await.transactions.push(tx.clone());
        tx
    }

    /// Seeds a persisted transfer pair between two accounts.
    pub async fn seed_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Money,
        date: NaiveDate,
    ) -> (Transaction, Transaction) {
        self.create_transfer(from, to, amount, date, date, "", WriteOptions::default())
            .await
            .expect("seed transfer")
    }

    // === Failure knobs ===

    pub fn fail_bulk_writes(&self, fail: bool) {
        self.fail_bulk_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn fail_writes_with_note(&self, marker: Option<&str>) {
        *self.fail_note_marker.write().await = marker.map(str::to_string);
    }

    pub async fn fail_balance_for(&self, account: Option<AccountId>) {
        *self.fail_balance_for.write().await = account;
    }

    async fn build_transaction(&self, new: &NewTransaction) -> Transaction {
        Transaction {
            id: TransactionId(self.fresh_id()),
            account_id: new.account_id,
            date: new.date,
            value_date: new.value_date,
            amount: new.amount,
            note: new.note.clone(),
            recipient_id: new.recipient_id,
            category_id: new.category_id,
            tag_ids: new.tag_ids.clone(),
            kind: new.kind,
            counterpart_id: None,
        }
    }

    async fn check_note_marker(&self, note: &str) -> Result<(), LedgerError> {
        if let Some(marker) = self.fail_note_marker.read().await.as_deref() {
            if note.contains(marker) {
                return Err(LedgerError::Backend(format!(
                    "simulated write failure for note '{note}'"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn accounts(&self) -> Result<Vec<Account>, LedgerError> {
        Ok(self.tables.read().await.accounts.clone())
    }

    async fn recipients(&self) -> Result<Vec<Recipient>, LedgerError> {
        Ok(self.tables.read().await.recipients.clone())
    }

    async fn categories(&self) -> Result<Vec<Category>, LedgerError> {
        Ok(self.tables.read().await.categories.clone())
    }

    async fn tags(&self) -> Result<Vec<Tag>, LedgerError> {
        Ok(self.tables.read().await.tags.clone())
    }

    async fn create_recipient(&self, name: &str) -> Result<Recipient, LedgerError> {
        let recipient = Recipient { id: RecipientId(self.fresh_id()), name: name.to_string() };
        self.tables.write().await.recipients.push(recipient.clone());
        Ok(recipient)
    }

    async fn create_category(&self, name: &str) -> Result<Category, LedgerError> {
        let category = Category { id: CategoryId(self.fresh_id()), name: name.to_string() };
        self.tables.write().await.categories.push(category.clone());
        Ok(category)
    }

    async fn create_tag(&self, name: &str) -> Result<Tag, LedgerError> {
        let tag = Tag { id: TagId(self.fresh_id()), name: name.to_string() };
        self.tables.write().await.tags.push(tag.clone());
        Ok(tag)
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>, LedgerError> {
        Ok(self
            .tables
            .read()
            .await
            .transactions
            .iter()
            .find(|tx| tx.id == id)
            .cloned())
    }

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self
            .tables
            .read()
            .await
            .transactions
            .iter()
            .filter(|tx| tx.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn transactions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self
            .tables
            .read()
            .await
            .transactions
            .iter()
            .filter(|tx| tx.date >= start && tx.date <= end)
            .cloned()
            .collect())
    }

    async fn create_transaction(
        &self,
        new: &NewTransaction,
        opts: WriteOptions,
    ) -> Result<Transaction, LedgerError> {
        self.check_note_marker(&new.note).await?;
        let tx = self.build_transaction(new).await;
        let mut tables = self.tables.write().await;
        if !opts.defer_balance_maintenance {
            let balance = tables.balances.entry(new.account_id).or_insert_with(Money::zero);
            *balance = *balance + new.amount;
        }
        tables.transactions.push(tx.clone());
        Ok(tx)
    }

    async fn create_transactions(
        &self,
        batch: &[NewTransaction],
        opts: WriteOptions,
    ) -> Result<Vec<Transaction>, LedgerError> {
        if self.fail_bulk_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Backend("simulated bulk write failure".to_string()));
        }
        let mut created = Vec::with_capacity(batch.len());
        for new in batch {
            created.push(self.create_transaction(new, opts).await?);
        }
        Ok(created)
    }

    async fn set_transaction_category(
        &self,
        id: TransactionId,
        category_id: CategoryId,
    ) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        let tx = tables
            .transactions
            .iter_mut()
            .find(|tx| tx.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {id}")))?;
        tx.category_id = Some(category_id);
        Ok(())
    }

    async fn create_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Money,
        date: NaiveDate,
        value_date: NaiveDate,
        note: &str,
        _opts: WriteOptions,
    ) -> Result<(Transaction, Transaction), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::Conflict("transfer amount must be positive".to_string()));
        }
        self.check_note_marker(note).await?;

        let mut from_leg = Transaction {
            id: TransactionId(self.fresh_id()),
            account_id: from,
            date,
            value_date,
            amount: -amount,
            note: note.to_string(),
            recipient_id: None,
            category_id: None,
            tag_ids: Vec::new(),
            kind: TransactionKind::Transfer,
            counterpart_id: None,
        };
        let mut to_leg = Transaction {
            id: TransactionId(self.fresh_id()),
            account_id: to,
            date,
            value_date,
            amount,
            note: note.to_string(),
            recipient_id: None,
            category_id: None,
            tag_ids: Vec::new(),
            kind: TransactionKind::Transfer,
            counterpart_id: None,
        };
        from_leg.counterpart_id = Some(to_leg.id);
        to_leg.counterpart_id = Some(from_leg.id);

        let mut tables = self.tables.write().await;
        tables.transactions.push(from_leg.clone());
        tables.transactions.push(to_leg.clone());
        Ok((from_leg, to_leg))
    }

    async fn recompute_balance(&self, account_id: AccountId) -> Result<Money, LedgerError> {
        if *self.fail_balance_for.read().await == Some(account_id) {
            return Err(LedgerError::Backend(format!(
                "simulated balance failure for account {account_id}"
            )));
        }
        let mut tables = self.tables.write().await;
        let total = tables
            .transactions
            .iter()
            .filter(|tx| tx.account_id == account_id)
            .map(|tx| tx.amount)
            .fold(Money::zero(), |a, b| a + b);
        tables.balances.insert(account_id, total);
        Ok(total)
    }

    async fn balance(&self, account_id: AccountId) -> Result<Money, LedgerError> {
        Ok(self
            .tables
            .read()
            .await
            .balances
            .get(&account_id)
            .copied()
            .unwrap_or_else(Money::zero))
    }

    async fn recompute_monthly_balances(&self) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        let mut per_month: HashMap<(AccountId, i32, u32), Money> = HashMap::new();
        for tx in &tables.transactions {
            let key = (tx.account_id, tx.date.year(), tx.date.month());
            let entry = per_month.entry(key).or_insert_with(Money::zero);
            *entry = *entry + tx.amount;
        }

        // Running end-of-month totals per account.
        let mut keys: Vec<_> = per_month.keys().copied().collect();
        keys.sort();
        let mut running: HashMap<AccountId, Money> = HashMap::new();
        let mut monthly = HashMap::new();
        for key in keys {
            let acc = running.entry(key.0).or_insert_with(Money::zero);
            *acc = *acc + per_month[&key];
            monthly.insert(key, *acc);
        }
        tables.monthly_balances = monthly;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn recompute_balance_sums_history() {
        let ledger = MemoryLedger::new();
        let account = ledger.add_account("Checking").await;
        let opts = WriteOptions::bulk_import();
        for cents in [-5000, 12000, -300] {
            let new = NewTransaction::standard(account, date(2024, 1, 10), Money::from_cents(cents));
            ledger.create_transaction(&new, opts).await.unwrap();
        }
        let balance = ledger.recompute_balance(account).await.unwrap();
        assert_eq!(balance.to_cents(), 6700);
        assert_eq!(ledger.balance(account).await.unwrap().to_cents(), 6700);
    }

    #[tokio::test]
    async fn transfer_legs_are_cross_linked() {
        let ledger = MemoryLedger::new();
        let a = ledger.add_account("Checking").await;
        let b = ledger.add_account("Savings").await;
        let (from_leg, to_leg) = ledger
            .create_transfer(
                a,
                b,
                Money::from_cents(5000),
                date(2024, 1, 5),
                date(2024, 1, 5),
                "move",
                WriteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(from_leg.amount.to_cents(), -5000);
        assert_eq!(to_leg.amount.to_cents(), 5000);
        assert_eq!(from_leg.counterpart_id, Some(to_leg.id));
        assert_eq!(to_leg.counterpart_id, Some(from_leg.id));
        assert_eq!(from_leg.kind, TransactionKind::Transfer);
    }

    #[tokio::test]
    async fn negative_transfer_amount_rejected() {
        let ledger = MemoryLedger::new();
        let a = ledger.add_account("A").await;
        let b = ledger.add_account("B").await;
        let result = ledger
            .create_transfer(
                a,
                b,
                Money::from_cents(-100),
                date(2024, 1, 5),
                date(2024, 1, 5),
                "",
                WriteOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(LedgerError::Conflict(_))));
    }

    #[tokio::test]
    async fn bulk_failure_knob() {
        let ledger = MemoryLedger::new();
        let account = ledger.add_account("Checking").await;
        ledger.fail_bulk_writes(true);
        let batch = vec![NewTransaction::standard(
            account,
            date(2024, 1, 5),
            Money::from_cents(-100),
        )];
        let result = ledger.create_transactions(&batch, WriteOptions::default()).await;
        assert!(matches!(result, Err(LedgerError::Backend(_))));
        // Single writes still work.
        assert!(ledger.create_transaction(&batch[0], WriteOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn note_marker_fails_single_write() {
        let ledger = MemoryLedger::new();
        let account = ledger.add_account("Checking").await;
        ledger.fail_writes_with_note(Some("poison")).await;
        let mut new = NewTransaction::standard(account, date(2024, 1, 5), Money::from_cents(-100));
        new.note = "poison pill".to_string();
        assert!(ledger.create_transaction(&new, WriteOptions::default()).await.is_err());
        new.note = "fine".to_string();
        assert!(ledger.create_transaction(&new, WriteOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn range_query_is_inclusive() {
        let ledger = MemoryLedger::new();
        let account = ledger.add_account("Checking").await;
        for day in [1, 5, 9] {
            let new = NewTransaction::standard(account, date(2024, 1, day), Money::from_cents(-100));
            ledger.create_transaction(&new, WriteOptions::default()).await.unwrap();
        }
        let txs = ledger
            .transactions_in_range(date(2024, 1, 1), date(2024, 1, 5))
            .await
            .unwrap();
        assert_eq!(txs.len(), 2);
    }
}
