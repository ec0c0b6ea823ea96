use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

use collatio_core::{
    Account, AccountId, Category, CategoryId, Ledger, LedgerError, Money, NewTransaction,
    Recipient, RecipientId, Tag, TagId, Transaction, TransactionId, TransactionKind, WriteOptions,
};

pub type DbPool = Pool<Sqlite>;

fn backend(e: sqlx::Error) -> LedgerError {
    LedgerError::Backend(e.to_string())
}

/// sqlite-backed `Ledger`. One writer connection, WAL journal.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: DbPool,
}

impl SqliteLedger {
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(backend)?;

        for pragma in [
            "PRAGMA journal_mode = WAL",
            "PRAGMA foreign_keys = ON",
            "PRAGMA synchronous = NORMAL",
            "PRAGMA busy_timeout = 5000",
            "PRAGMA cache_size = -32000",
        ] {
            sqlx::query(pragma).execute(&pool).await.map_err(backend)?;
        }

        run_migrations(&pool).await.map_err(backend)?;
        info!(path = %path.display(), "ledger database ready");
        Ok(SqliteLedger { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn create_account(&self, name: &str) -> Result<Account, LedgerError> {
        let result = sqlx::query("INSERT INTO accounts (name, active) VALUES (?, 1)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(Account {
            id: AccountId(result.last_insert_rowid()),
            name: name.to_string(),
            active: true,
        })
    }

    pub async fn account_by_name(&self, name: &str) -> Result<Option<Account>, LedgerError> {
        let row = sqlx::query_as::<_, (i64, String, i64)>(
            "SELECT id, name, active FROM accounts WHERE name = ? COLLATE NOCASE",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(|r| Account { id: AccountId(r.0), name: r.1, active: r.2 != 0 }))
    }

    async fn load_transaction_row(
        &self,
        row: (i64, i64, NaiveDate, NaiveDate, i64, String, Option<i64>, Option<i64>, String, Option<i64>),
    ) -> Result<Transaction, LedgerError> {
        let tag_ids = sqlx::query_as::<_, (i64,)>(
            "SELECT tag_id FROM transaction_tags WHERE transaction_id = ? ORDER BY tag_id",
        )
        .bind(row.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .into_iter()
        .map(|(id,)| TagId(id))
        .collect();

        Ok(Transaction {
            id: TransactionId(row.0),
            account_id: AccountId(row.1),
            date: row.2,
            value_date: row.3,
            amount: Money::from_cents(row.4),
            note: row.5,
            recipient_id: row.6.map(RecipientId),
            category_id: row.7.map(CategoryId),
            tag_ids,
            kind: TransactionKind::from_str(&row.8)
                .map_err(|_| LedgerError::Backend(format!("bad kind '{}'", row.8)))?,
            counterpart_id: row.9.map(TransactionId),
        })
    }

    async fn load_transactions(
        &self,
        rows: Vec<(i64, i64, NaiveDate, NaiveDate, i64, String, Option<i64>, Option<i64>, String, Option<i64>)>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.load_transaction_row(row).await?);
        }
        Ok(out)
    }

    async fn insert_transaction(
        &self,
        new: &NewTransaction,
        counterpart_id: Option<TransactionId>,
        opts: WriteOptions,
    ) -> Result<Transaction, LedgerError> {
        let result = sqlx::query(
            "INSERT INTO transactions \
             (account_id, date, value_date, amount_cents, note, recipient_id, category_id, kind, counterpart_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.account_id.0)
        .bind(new.date)
        .bind(new.value_date)
        .bind(new.amount.to_cents())
        .bind(&new.note)
        .bind(new.recipient_id.map(|r| r.0))
        .bind(new.category_id.map(|c| c.0))
        .bind(new.kind.as_str())
        .bind(counterpart_id.map(|c| c.0))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let id = TransactionId(result.last_insert_rowid());
        for tag in &new.tag_ids {
            sqlx::query("INSERT OR IGNORE INTO transaction_tags (transaction_id, tag_id) VALUES (?, ?)")
                .bind(id.0)
                .bind(tag.0)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }

        if !opts.defer_balance_maintenance {
            sqlx::query("UPDATE accounts SET balance_cents = balance_cents + ? WHERE id = ?")
                .bind(new.amount.to_cents())
                .bind(new.account_id.0)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }

        Ok(Transaction {
            id,
            account_id: new.account_id,
            date: new.date,
            value_date: new.value_date,
            amount: new.amount,
            note: new.note.clone(),
            recipient_id: new.recipient_id,
            category_id: new.category_id,
            tag_ids: new.tag_ids.clone(),
            kind: new.kind,
            counterpart_id,
        })
    }
}

const SELECT_TX: &str = "SELECT id, account_id, date, value_date, amount_cents, note, \
     recipient_id, category_id, kind, counterpart_id FROM transactions";

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            balance_cents INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recipients (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            value_date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            note TEXT NOT NULL DEFAULT '',
            recipient_id INTEGER,
            category_id INTEGER,
            kind TEXT NOT NULL DEFAULT 'standard',
            counterpart_id INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (account_id) REFERENCES accounts(id),
            FOREIGN KEY (recipient_id) REFERENCES recipients(id),
            FOREIGN KEY (category_id) REFERENCES categories(id),
            FOREIGN KEY (counterpart_id) REFERENCES transactions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transaction_tags (
            transaction_id INTEGER NOT NULL,
            tag_id INTEGER NOT NULL,
            PRIMARY KEY (transaction_id, tag_id),
            FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE,
            FOREIGN KEY (tag_id) REFERENCES tags(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS monthly_balances (
            account_id INTEGER NOT NULL,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            balance_cents INTEGER NOT NULL,
            PRIMARY KEY (account_id, year, month),
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let rows = sqlx::query_as::<_, (i64, String, i64)>(
            "SELECT id, name, active FROM accounts ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|r| Account { id: AccountId(r.0), name: r.1, active: r.2 != 0 })
            .collect())
    }

    async fn recipients(&self) -> Result<Vec<Recipient>, LedgerError> {
        let rows =
            sqlx::query_as::<_, (i64, String)>("SELECT id, name FROM recipients ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|r| Recipient { id: RecipientId(r.0), name: r.1 })
            .collect())
    }

    async fn categories(&self) -> Result<Vec<Category>, LedgerError> {
        let rows =
            sqlx::query_as::<_, (i64, String)>("SELECT id, name FROM categories ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|r| Category { id: CategoryId(r.0), name: r.1 })
            .collect())
    }

    async fn tags(&self) -> Result<Vec<Tag>, LedgerError> {
        let rows = sqlx::query_as::<_, (i64, String)>("SELECT id, name FROM tags ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(|r| Tag { id: TagId(r.0), name: r.1 }).collect())
    }

    async fn create_recipient(&self, name: &str) -> Result<Recipient, LedgerError> {
        let result = sqlx::query("INSERT INTO recipients (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(Recipient { id: RecipientId(result.last_insert_rowid()), name: name.to_string() })
    }

    async fn create_category(&self, name: &str) -> Result<Category, LedgerError> {
        let result = sqlx::query("INSERT INTO categories (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(Category { id: CategoryId(result.last_insert_rowid()), name: name.to_string() })
    }

    async fn create_tag(&self, name: &str) -> Result<Tag, LedgerError> {
        let result = sqlx::query("INSERT INTO tags (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(Tag { id: TagId(result.last_insert_rowid()), name: name.to_string() })
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>, LedgerError> {
        let row = sqlx::query_as(&format!("{SELECT_TX} WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => Ok(Some(self.load_transaction_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let rows = sqlx::query_as(&format!("{SELECT_TX} WHERE account_id = ? ORDER BY date, id"))
            .bind(account_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        self.load_transactions(rows).await
    }

    async fn transactions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let rows = sqlx::query_as(&format!(
            "{SELECT_TX} WHERE date >= ? AND date <= ? ORDER BY date, id"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        self.load_transactions(rows).await
    }

    async fn create_transaction(
        &self,
        new: &NewTransaction,
        opts: WriteOptions,
    ) -> Result<Transaction, LedgerError> {
        self.insert_transaction(new, None, opts).await
    }

    async fn create_transactions(
        &self,
        batch: &[NewTransaction],
        opts: WriteOptions,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let mut db_tx = self.pool.begin().await.map_err(backend)?;
        let mut created = Vec::with_capacity(batch.len());

        for new in batch {
            let result = sqlx::query(
                "INSERT INTO transactions \
                 (account_id, date, value_date, amount_cents, note, recipient_id, category_id, kind) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(new.account_id.0)
            .bind(new.date)
            .bind(new.value_date)
            .bind(new.amount.to_cents())
            .bind(&new.note)
            .bind(new.recipient_id.map(|r| r.0))
            .bind(new.category_id.map(|c| c.0))
            .bind(new.kind.as_str())
            .execute(&mut *db_tx)
            .await
            .map_err(backend)?;

            let id = TransactionId(result.last_insert_rowid());
            for tag in &new.tag_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO transaction_tags (transaction_id, tag_id) VALUES (?, ?)",
                )
                .bind(id.0)
                .bind(tag.0)
                .execute(&mut *db_tx)
                .await
                .map_err(backend)?;
            }

            if !opts.defer_balance_maintenance {
                sqlx::query("UPDATE accounts SET balance_cents = balance_cents + ? WHERE id = ?")
                    .bind(new.amount.to_cents())
                    .bind(new.account_id.0)
                    .execute(&mut *db_tx)
                    .await
                    .map_err(backend)?;
            }

            created.push(Transaction {
                id,
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
            });
        }

        db_tx.commit().await.map_err(backend)?;
        Ok(created)
    }

    async fn set_transaction_category(
        &self,
        id: TransactionId,
        category_id: CategoryId,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE transactions SET category_id = ? WHERE id = ?")
            .bind(category_id.0)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("transaction {id}")));
        }
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
        opts: WriteOptions,
    ) -> Result<(Transaction, Transaction), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::Conflict("transfer amount must be positive".to_string()));
        }

        let mut from_new = NewTransaction::standard(from, date, -amount);
        from_new.value_date = value_date;
        from_new.note = note.to_string();
        from_new.kind = TransactionKind::Transfer;
        let mut to_new = NewTransaction::standard(to, date, amount);
        to_new.value_date = value_date;
        to_new.note = note.to_string();
        to_new.kind = TransactionKind::Transfer;

        let mut from_leg = self.insert_transaction(&from_new, None, opts).await?;
        let to_leg = self.insert_transaction(&to_new, Some(from_leg.id), opts).await?;
        sqlx::query("UPDATE transactions SET counterpart_id = ? WHERE id = ?")
            .bind(to_leg.id.0)
            .bind(from_leg.id.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        from_leg.counterpart_id = Some(to_leg.id);

        Ok((from_leg, to_leg))
    }

    async fn recompute_balance(&self, account_id: AccountId) -> Result<Money, LedgerError> {
        let (total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount_cents), 0) FROM transactions WHERE account_id = ?",
        )
        .bind(account_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let result = sqlx::query("UPDATE accounts SET balance_cents = ? WHERE id = ?")
            .bind(total)
            .bind(account_id.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("account {account_id}")));
        }
        Ok(Money::from_cents(total))
    }

    async fn balance(&self, account_id: AccountId) -> Result<Money, LedgerError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT balance_cents FROM accounts WHERE id = ?")
                .bind(account_id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        match row {
            Some((cents,)) => Ok(Money::from_cents(cents)),
            None => Err(LedgerError::NotFound(format!("account {account_id}"))),
        }
    }

    async fn recompute_monthly_balances(&self) -> Result<(), LedgerError> {
        let mut db_tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query("DELETE FROM monthly_balances")
            .execute(&mut *db_tx)
            .await
            .map_err(backend)?;
        // Running end-of-month balance per account.
        sqlx::query(
            r#"
            INSERT INTO monthly_balances (account_id, year, month, balance_cents)
            SELECT account_id,
                   CAST(strftime('%Y', date) AS INTEGER),
                   CAST(strftime('%m', date) AS INTEGER),
                   SUM(SUM(amount_cents)) OVER (
                       PARTITION BY account_id
                       ORDER BY strftime('%Y-%m', date)
                   )
            FROM transactions
            GROUP BY account_id, strftime('%Y-%m', date)
            "#,
        )
        .execute(&mut *db_tx)
        .await
        .map_err(backend)?;
        db_tx.commit().await.map_err(backend)?;
        Ok(())
    }
}
