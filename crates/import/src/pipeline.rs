use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use collatio_core::{
    AccountId, CategoryId, Ledger, LedgerError, Money, NewTransaction, RecipientId, TagId,
    Transaction, TransactionKind, WriteOptions,
};

use crate::dialect::Dialect;
use crate::duplicates::{DuplicateDetector, ExistingTransaction};
use crate::mapper::{infer_mapping, ColumnMapping, MappedColumns};
use crate::matcher::EntityMatcher;
use crate::parser::{parse_rows, ImportRow, ParseError, ParsedFile, Resolution};
use crate::rules::{RuleEngine, RuleError, RuleStage};
use crate::similarity::similarity;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
    #[error("rule application failed: {0}")]
    Rules(#[from] RuleError),
    #[error("store error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("unknown account: {0}")]
    UnknownAccount(AccountId),
    #[error("no parsed file in this session")]
    NotParsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Parsing,
    Mapped,
    Importing,
    Success,
    Error,
}

/// A row normalised into the shape the store expects, plus the free-text
/// fields the rule engine inspects. `payee` always carries the raw mapped
/// recipient column text, matched or not — rules depend on that.
#[derive(Debug, Clone)]
pub struct PreparedTransaction {
    pub row_identity: String,
    pub source_index: usize,
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub value_date: NaiveDate,
    pub amount: Money,
    pub note: String,
    pub payee: String,
    pub original_category: String,
    pub recipient: Resolution<RecipientId>,
    pub category: Resolution<CategoryId>,
    pub tag_ids: Vec<TagId>,
    pub tag_names: Vec<String>,
    pub skip_auto_match: bool,
    pub is_transfer: bool,
}

/// One half of a not-yet-persisted account transfer. Two candidates with
/// the same (date, |amount|) and a reversed account pair are the same
/// real-world transfer and collapse to one persisted pair.
#[derive(Debug, Clone)]
pub struct AccountTransferCandidate {
    pub from_account: AccountId,
    pub to_account: AccountId,
    /// The payee-named account, i.e. the non-owning side of the pair.
    /// Persisted opposite legs live on this account whichever way the
    /// money flows.
    pub target_account: AccountId,
    pub amount: Money,
    pub date: NaiveDate,
    pub value_date: NaiveDate,
    pub note: String,
    pub source_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    /// Transactions written, both transfer legs included.
    pub imported: usize,
    pub transfers_created: usize,
    pub rows_selected: usize,
    pub rows_dropped: usize,
    pub duplicates_flagged: usize,
    /// The created records, for caller-side display.
    pub transactions: Vec<Transaction>,
}

/// Result of a completed run. The monthly-balance refresh runs detached;
/// callers may await the handle or drop it.
pub struct ImportOutcome {
    pub summary: ImportSummary,
    pub monthly_refresh: JoinHandle<()>,
}

/// One file's import from raw text to committed batch. States move strictly
/// forward per run: idle → parsing → mapped → importing → success | error.
/// At most one run may be active at a time; the session is single-threaded.
pub struct ImportSession {
    ledger: Arc<dyn Ledger>,
    rules: Arc<dyn RuleEngine>,
    pub dialect: Dialect,
    pub matcher: EntityMatcher,
    pub detector: DuplicateDetector,
    state: SessionState,
    parsed: Option<ParsedFile>,
    mapping: ColumnMapping,
    dialect_pinned: bool,
}

impl ImportSession {
    pub fn new(ledger: Arc<dyn Ledger>, rules: Arc<dyn RuleEngine>) -> Self {
        ImportSession {
            ledger,
            rules,
            dialect: Dialect::default(),
            matcher: EntityMatcher::default(),
            detector: DuplicateDetector::default(),
            state: SessionState::Idle,
            parsed: None,
            mapping: ColumnMapping::default(),
            dialect_pinned: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn headers(&self) -> &[String] {
        self.parsed.as_ref().map(|p| p.headers.as_slice()).unwrap_or(&[])
    }

    pub fn rows(&self) -> &[ImportRow] {
        self.parsed.as_ref().map(|p| p.rows.as_slice()).unwrap_or(&[])
    }

    /// Mutable row access for selection toggles and manual resolution.
    pub fn rows_mut(&mut self) -> &mut [ImportRow] {
        self.parsed.as_mut().map(|p| p.rows.as_mut_slice()).unwrap_or(&mut [])
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    /// Caller override of the inferred mapping.
    pub fn set_mapping(&mut self, mapping: ColumnMapping) {
        self.mapping = mapping;
    }

    /// Caller override of the dialect. Pinned; `parse` skips detection.
    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = dialect;
        self.dialect_pinned = true;
    }

    /// Ready for a new file.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.parsed = None;
        self.mapping = ColumnMapping::default();
        self.dialect = Dialect::default();
        self.dialect_pinned = false;
    }

    /// Detects the dialect, parses rows, infers the column mapping and runs
    /// the matching and duplicate passes. Leaves the session `Mapped`.
    pub async fn parse(&mut self, text: &str) -> Result<(), ImportError> {
        self.state = SessionState::Parsing;
        match self.parse_inner(text).await {
            Ok(()) => {
                self.state = SessionState::Mapped;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Error;
                Err(e)
            }
        }
    }

    async fn parse_inner(&mut self, text: &str) -> Result<(), ImportError> {
        if !self.dialect_pinned {
            self.dialect.detect(text);
        }
        let mut parsed = parse_rows(text, &self.dialect)?;
        self.mapping = infer_mapping(&parsed.headers, &parsed.rows);
        let cols = self.mapping.resolve(&parsed.headers);

        let accounts = self.ledger.accounts().await?;
        let recipients = self.ledger.recipients().await?;
        let categories = self.ledger.categories().await?;

        for row in &mut parsed.rows {
            self.matcher.match_row(row, &cols, &accounts, &recipients, &categories);
        }

        let existing = self.existing_snapshot(&parsed.rows, &cols, &recipients).await?;
        self.detector
            .flag_rows(&mut parsed.rows, &cols, self.dialect.date_format, &existing);

        info!(
            rows = parsed.rows.len(),
            duplicates = parsed.rows.iter().filter(|r| r.meta.duplicate.is_some()).count(),
            "parsed and mapped import file"
        );
        self.parsed = Some(parsed);
        Ok(())
    }

    /// Fetches persisted transactions covering the batch's date range plus
    /// the detector window, with recipient names resolved. One fetch for
    /// the whole batch.
    async fn existing_snapshot(
        &self,
        rows: &[ImportRow],
        cols: &MappedColumns,
        recipients: &[collatio_core::Recipient],
    ) -> Result<Vec<ExistingTransaction>, ImportError> {
        let Some(date_index) = cols.date else {
            return Ok(Vec::new());
        };
        let dates: Vec<NaiveDate> = rows
            .iter()
            .filter_map(|r| self.dialect.date_format.parse_date(r.value(date_index)))
            .collect();
        let (Some(&min), Some(&max)) = (dates.iter().min(), dates.iter().max()) else {
            return Ok(Vec::new());
        };

        let window = Duration::days(self.detector.date_window_days);
        let transactions = self
            .ledger
            .transactions_in_range(min - window, max + window)
            .await?;

        let names: HashMap<RecipientId, &str> = recipients
            .iter()
            .map(|r| (r.id, r.name.as_str()))
            .collect();

        Ok(transactions
            .iter()
            .map(|tx| {
                let name = tx
                    .recipient_id
                    .and_then(|id| names.get(&id))
                    .map(|n| n.to_string());
                ExistingTransaction::from_transaction(tx, name)
            })
            .collect())
    }

    /// Runs the import of the current batch into `account_id`. Consumes the
    /// parsed rows; the session ends `Success` (or `Error` with the cause
    /// propagated). Writes already committed when a later step fails are
    /// not rolled back.
    pub async fn start_import(
        &mut self,
        account_id: AccountId,
    ) -> Result<ImportOutcome, ImportError> {
        if self.state != SessionState::Mapped || self.parsed.is_none() {
            return Err(ImportError::NotParsed);
        }
        self.state = SessionState::Importing;

        match self.import_inner(account_id).await {
            Ok(outcome) => {
                self.state = SessionState::Success;
                self.parsed = None;
                self.mapping = ColumnMapping::default();
                Ok(outcome)
            }
            Err(e) => {
                self.state = SessionState::Error;
                Err(e)
            }
        }
    }

    async fn import_inner(&mut self, account_id: AccountId) -> Result<ImportOutcome, ImportError> {
        let opts = WriteOptions::bulk_import();
        let accounts = self.ledger.accounts().await?;
        if !accounts.iter().any(|a| a.id == account_id) {
            return Err(ImportError::UnknownAccount(account_id));
        }

        let parsed = self.parsed.take().ok_or(ImportError::NotParsed)?;
        let cols = self.mapping.resolve(&parsed.headers);

        // Step 1: selected rows with a parseable date and amount become the
        // batch; the rest are counted, not reported.
        let rows_selected = parsed.rows.iter().filter(|r| r.meta.selected).count();
        let duplicates_flagged = parsed
            .rows
            .iter()
            .filter(|r| r.meta.selected && r.meta.duplicate.is_some())
            .count();
        let mut batch = self.prepare_batch(&parsed, &cols, account_id);
        let rows_dropped = rows_selected - batch.len();
        if rows_dropped > 0 {
            info!(rows_dropped, "rows excluded for missing date or amount");
        }

        // Steps 2–3: resolve tag names batch-wide, each created at most
        // once, then attach ids.
        let mut tag_memo = self.load_tag_memo().await?;
        self.attach_tags(&mut batch, &mut tag_memo).await?;

        // Step 4: PRE and DEFAULT rules over the full batch.
        let mut batch = self.rules.apply(RuleStage::Pre, batch).await?;
        batch = self.rules.apply(RuleStage::Default, batch).await?;
        // Rules may have added tags; resolve those through the same memo.
        self.attach_tags(&mut batch, &mut tag_memo).await?;

        // Step 5: resolve or create entities for what the rules left open,
        // splitting off account-transfer candidates.
        let candidates = self
            .resolve_entities(&mut batch, &accounts, account_id)
            .await?;

        // Step 6: collapse duplicate transfers, persist the valid pairs,
        // drop their source transactions from the normal batch.
        let (transfer_legs, transfers_created) =
            self.create_transfers(&mut batch, candidates, opts).await?;

        // Step 7: bulk write with per-item fallback.
        let mut created = self.persist_batch(&batch, opts).await;
        created.extend(transfer_legs);

        // Step 8: full recompute for every account touched.
        let touched: HashSet<AccountId> = created.iter().map(|tx| tx.account_id).collect();
        for &touched_account in &touched {
            if let Err(e) = self.ledger.recompute_balance(touched_account).await {
                warn!(account = %touched_account, error = %e, "balance recompute failed");
            }
        }

        // Step 9: POST rules, non-fatal.
        let ids: Vec<_> = created.iter().map(|tx| tx.id).collect();
        if let Err(e) = self.rules.apply_post(&ids).await {
            warn!(error = %e, "post-stage rules failed");
        }

        // Step 11: derived monthly balances refresh, detached.
        let ledger = Arc::clone(&self.ledger);
        let monthly_refresh = tokio::spawn(async move {
            if let Err(e) = ledger.recompute_monthly_balances().await {
                warn!(error = %e, "monthly balance refresh failed");
            }
        });

        let summary = ImportSummary {
            imported: created.len(),
            transfers_created,
            rows_selected,
            rows_dropped,
            duplicates_flagged,
            transactions: created,
        };
        info!(
            imported = summary.imported,
            transfers = summary.transfers_created,
            dropped = summary.rows_dropped,
            "import committed"
        );

        Ok(ImportOutcome { summary, monthly_refresh })
    }

    fn prepare_batch(
        &self,
        parsed: &ParsedFile,
        cols: &MappedColumns,
        account_id: AccountId,
    ) -> Vec<PreparedTransaction> {
        let value = |row: &ImportRow, index: Option<usize>| {
            index.map(|i| row.value(i).to_string()).unwrap_or_default()
        };

        parsed
            .rows
            .iter()
            .filter(|row| row.meta.selected)
            .filter_map(|row| {
                let date = self
                    .dialect
                    .date_format
                    .parse_date(&value(row, cols.date))?;
                let amount = Money::parse_str(&value(row, cols.amount))?;
                Some(PreparedTransaction {
                    row_identity: row.identity.clone(),
                    source_index: row.index,
                    account_id,
                    date,
                    value_date: date,
                    amount,
                    note: value(row, cols.notes),
                    payee: value(row, cols.recipient),
                    original_category: value(row, cols.category),
                    recipient: row.meta.recipient,
                    category: row.meta.category,
                    tag_ids: Vec::new(),
                    tag_names: row.meta.tags.clone(),
                    skip_auto_match: false,
                    is_transfer: false,
                })
            })
            .collect()
    }

    async fn load_tag_memo(&self) -> Result<HashMap<String, TagId>, ImportError> {
        Ok(self
            .ledger
            .tags()
            .await?
            .into_iter()
            .map(|t| (t.name.to_lowercase(), t.id))
            .collect())
    }

    /// Resolves every tag name in the batch to an id, creating missing tags
    /// exactly once per run via the memo.
    async fn attach_tags(
        &self,
        batch: &mut [PreparedTransaction],
        memo: &mut HashMap<String, TagId>,
    ) -> Result<(), ImportError> {
        for tx in batch.iter_mut() {
            let mut ids = Vec::with_capacity(tx.tag_names.len());
            for name in &tx.tag_names {
                let key = name.to_lowercase();
                let id = match memo.get(&key) {
                    Some(&id) => id,
                    None => {
                        let tag = self.ledger.create_tag(name).await?;
                        memo.insert(key, tag.id);
                        tag.id
                    }
                };
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            tx.tag_ids = ids;
        }
        Ok(())
    }

    /// Step 5: for transactions the rules left unresolved, re-run the
    /// account-name check (synthesizing transfer candidates), then direct
    /// and fuzzy recipient matching, and finally create-by-name with a
    /// per-run memo so each new name is created once. Categories get the
    /// same treatment independently.
    async fn resolve_entities(
        &self,
        batch: &mut [PreparedTransaction],
        accounts: &[collatio_core::Account],
        owning_account: AccountId,
    ) -> Result<Vec<AccountTransferCandidate>, ImportError> {
        let recipients = self.ledger.recipients().await?;
        let categories = self.ledger.categories().await?;
        let mut recipient_memo: HashMap<String, RecipientId> = HashMap::new();
        let mut category_memo: HashMap<String, CategoryId> = HashMap::new();
        let mut candidates = Vec::new();

        for (index, tx) in batch.iter_mut().enumerate() {
            if tx.recipient.is_pending() && !tx.skip_auto_match && !tx.payee.is_empty() {
                let payee_lower = tx.payee.to_lowercase();
                let transfer_target = accounts
                    .iter()
                    .find(|a| a.id != owning_account && a.name.to_lowercase() == payee_lower);

                if let Some(target) = transfer_target {
                    let (from, to) = if tx.amount.is_negative() {
                        (owning_account, target.id)
                    } else {
                        (target.id, owning_account)
                    };
                    candidates.push(AccountTransferCandidate {
                        from_account: from,
                        to_account: to,
                        target_account: target.id,
                        amount: tx.amount.abs(),
                        date: tx.date,
                        value_date: tx.value_date,
                        note: tx.note.clone(),
                        source_index: index,
                    });
                    tx.is_transfer = true;
                } else {
                    tx.recipient = Resolution::Matched(
                        self.resolve_or_create_recipient(&tx.payee, &recipients, &mut recipient_memo)
                            .await?,
                    );
                }
            }

            if tx.category.is_pending() && !tx.skip_auto_match && !tx.original_category.is_empty() {
                tx.category = Resolution::Matched(
                    self.resolve_or_create_category(
                        &tx.original_category,
                        &categories,
                        &mut category_memo,
                    )
                    .await?,
                );
            }
        }

        Ok(candidates)
    }

    async fn resolve_or_create_recipient(
        &self,
        name: &str,
        known: &[collatio_core::Recipient],
        memo: &mut HashMap<String, RecipientId>,
    ) -> Result<RecipientId, ImportError> {
        let key = name.to_lowercase();
        if let Some(&id) = memo.get(&key) {
            return Ok(id);
        }
        if let Some(id) = best_entity_match(
            name,
            known.iter().map(|r| (r.id, r.name.as_str())),
            self.matcher.auto_assign_threshold,
        ) {
            memo.insert(key, id);
            return Ok(id);
        }
        let created = self.ledger.create_recipient(name).await?;
        info!(recipient = name, "created recipient during import");
        memo.insert(key, created.id);
        Ok(created.id)
    }

    async fn resolve_or_create_category(
        &self,
        name: &str,
        known: &[collatio_core::Category],
        memo: &mut HashMap<String, CategoryId>,
    ) -> Result<CategoryId, ImportError> {
        let key = name.to_lowercase();
        if let Some(&id) = memo.get(&key) {
            return Ok(id);
        }
        if let Some(id) = best_entity_match(
            name,
            known.iter().map(|c| (c.id, c.name.as_str())),
            self.matcher.auto_assign_threshold,
        ) {
            memo.insert(key, id);
            return Ok(id);
        }
        let created = self.ledger.create_category(name).await?;
        info!(category = name, "created category during import");
        memo.insert(key, created.id);
        Ok(created.id)
    }

    /// Step 6: two in-batch candidates with matching (date, |amount|) and a
    /// reversed account pair are one transfer; likewise a candidate whose
    /// opposite leg is already persisted. The survivors are written as
    /// FROM/TO pairs; every candidate's source transaction leaves the
    /// normal batch either way.
    async fn create_transfers(
        &self,
        batch: &mut Vec<PreparedTransaction>,
        candidates: Vec<AccountTransferCandidate>,
        opts: WriteOptions,
    ) -> Result<(Vec<Transaction>, usize), ImportError> {
        let mut legs = Vec::new();
        let mut transfers_created = 0;

        if !candidates.is_empty() {
            let min = candidates.iter().map(|c| c.date).min().unwrap();
            let max = candidates.iter().map(|c| c.date).max().unwrap();
            let window = Duration::days(self.detector.date_window_days);
            let persisted = self
                .ledger
                .transactions_in_range(min - window, max + window)
                .await?;

            let mut kept: Vec<&AccountTransferCandidate> = Vec::new();
            for candidate in &candidates {
                let in_batch_duplicate = kept.iter().any(|earlier| {
                    earlier.date == candidate.date
                        && earlier.amount.approx_eq(candidate.amount, self.detector.amount_tolerance)
                        && earlier.from_account == candidate.to_account
                        && earlier.to_account == candidate.from_account
                });
                let persisted_duplicate = persisted.iter().any(|tx| {
                    tx.kind == TransactionKind::Transfer
                        && tx.account_id == candidate.target_account
                        && (tx.date - candidate.date).num_days().abs()
                            <= self.detector.date_window_days
                        && tx.amount.abs().approx_eq(candidate.amount, self.detector.amount_tolerance)
                });

                if in_batch_duplicate || persisted_duplicate {
                    info!(
                        from = %candidate.from_account,
                        to = %candidate.to_account,
                        date = %candidate.date,
                        "suppressing duplicate transfer leg"
                    );
                    continue;
                }
                kept.push(candidate);
            }

            for candidate in kept {
                let (from_leg, to_leg) = self
                    .ledger
                    .create_transfer(
                        candidate.from_account,
                        candidate.to_account,
                        candidate.amount,
                        candidate.date,
                        candidate.value_date,
                        &candidate.note,
                        opts,
                    )
                    .await?;
                legs.push(from_leg);
                legs.push(to_leg);
                transfers_created += 1;
            }
        }

        batch.retain(|tx| !tx.is_transfer);
        Ok((legs, transfers_created))
    }

    /// Step 7: one bulk write; on failure, per-item writes. Rules already
    /// ran and transfers are already split out, so the fallback sees only
    /// the non-transfer remainder. Item failures are logged and skipped.
    async fn persist_batch(
        &self,
        batch: &[PreparedTransaction],
        opts: WriteOptions,
    ) -> Vec<Transaction> {
        if batch.is_empty() {
            return Vec::new();
        }
        let inserts: Vec<NewTransaction> = batch.iter().map(to_new_transaction).collect();

        match self.ledger.create_transactions(&inserts, opts).await {
            Ok(created) => created,
            Err(e) => {
                warn!(error = %e, "bulk write failed, falling back to per-item writes");
                let mut created = Vec::new();
                for insert in &inserts {
                    match self.ledger.create_transaction(insert, opts).await {
                        Ok(tx) => created.push(tx),
                        Err(e) => {
                            warn!(date = %insert.date, error = %e, "skipping failed transaction")
                        }
                    }
                }
                created
            }
        }
    }
}

fn to_new_transaction(tx: &PreparedTransaction) -> NewTransaction {
    NewTransaction {
        account_id: tx.account_id,
        date: tx.date,
        value_date: tx.value_date,
        amount: tx.amount,
        note: tx.note.clone(),
        recipient_id: tx.recipient.matched(),
        category_id: tx.category.matched(),
        tag_ids: tx.tag_ids.clone(),
        kind: TransactionKind::Standard,
    }
}

/// Direct or fuzzy entity match used at import time: exact case-insensitive
/// name equality first, else the best similarity above `threshold`.
fn best_entity_match<'a, T: Copy>(
    name: &str,
    known: impl Iterator<Item = (T, &'a str)>,
    threshold: f64,
) -> Option<T> {
    let needle = name.to_lowercase();
    let mut best: Option<(T, f64)> = None;
    for (id, candidate) in known {
        if candidate.to_lowercase() == needle {
            return Some(id);
        }
        let score = similarity(name, candidate);
        if score > threshold && best.map_or(true, |(_, b)| score > b) {
            best = Some((id, score));
        }
    }
    best.map(|(id, _)| id)
}
