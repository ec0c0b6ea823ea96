use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;

use collatio_core::Ledger;
use collatio_import::{
    infer_mapping, parse_rows, DateFormat, Delimiter, Dialect, DuplicateKind, ImportRow,
    ImportSession, NoRules, PersistedRuleEngine, RuleEngine, StageRuleEngine, TransferDirection,
};
use collatio_storage::SqliteLedger;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DateFormatArg {
    Ymd,
    Dmy,
    DmyShort,
    Mdy,
    MdyShort,
}

impl From<DateFormatArg> for DateFormat {
    fn from(arg: DateFormatArg) -> Self {
        match arg {
            DateFormatArg::Ymd => DateFormat::YearMonthDay,
            DateFormatArg::Dmy => DateFormat::DayMonthYear,
            DateFormatArg::DmyShort => DateFormat::DayMonthYearShort,
            DateFormatArg::Mdy => DateFormat::MonthDayYear,
            DateFormatArg::MdyShort => DateFormat::MonthDayYearShort,
        }
    }
}

fn parse_delimiter(s: &str) -> Delimiter {
    match s {
        "," => Delimiter::Comma,
        ";" => Delimiter::Semicolon,
        "\t" | "tab" => Delimiter::Tab,
        other => Delimiter::Custom(other.to_string()),
    }
}

fn delimiter_name(d: &Delimiter) -> String {
    match d {
        Delimiter::Comma => "comma".to_string(),
        Delimiter::Semicolon => "semicolon".to_string(),
        Delimiter::Tab => "tab".to_string(),
        Delimiter::Custom(s) => format!("custom ({s:?})"),
    }
}

async fn open_ledger(db: Option<PathBuf>) -> Result<SqliteLedger> {
    let path = match db {
        Some(path) => path,
        None => {
            let dirs = directories::ProjectDirs::from("com", "anomalyco", "Collatio")
                .context("could not determine the platform data directory")?;
            let data_dir = dirs.data_dir().to_path_buf();
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("creating {}", data_dir.display()))?;
            data_dir.join("ledger.db")
        }
    };
    let ledger = SqliteLedger::open(&path)
        .await
        .with_context(|| format!("opening ledger at {}", path.display()))?;
    Ok(ledger)
}

pub async fn accounts_add(db: Option<PathBuf>, name: &str) -> Result<()> {
    let ledger = open_ledger(db).await?;
    if ledger.account_by_name(name).await?.is_some() {
        bail!("account '{name}' already exists");
    }
    let account = ledger.create_account(name).await?;
    println!("created account '{}' (id {})", account.name, account.id);
    Ok(())
}

pub async fn accounts_list(db: Option<PathBuf>) -> Result<()> {
    let ledger = open_ledger(db).await?;
    let accounts = ledger.accounts().await?;
    if accounts.is_empty() {
        println!("no accounts yet; create one with `collatio accounts add <name>`");
        return Ok(());
    }
    for account in accounts {
        let balance = ledger.balance(account.id).await?;
        let marker = if account.active { "" } else { " (inactive)" };
        println!("{:>4}  {:<30} {:>12}{marker}", account.id, account.name, balance.to_string());
    }
    Ok(())
}

pub async fn detect(file: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let mut dialect = Dialect::default();
    dialect.detect(&text);
    let parsed = parse_rows(&text, &dialect)?;
    let mapping = infer_mapping(&parsed.headers, &parsed.rows);

    println!("delimiter:   {}", delimiter_name(&dialect.delimiter));
    println!("date format: {:?}", dialect.date_format);
    println!("header row:  {}", dialect.has_header_row);
    println!("rows:        {}", parsed.rows.len());
    println!();
    println!("inferred mapping:");
    for (slot, column) in [
        ("date", &mapping.date),
        ("amount", &mapping.amount),
        ("notes", &mapping.notes),
        ("recipient", &mapping.recipient),
        ("category", &mapping.category),
    ] {
        match column {
            Some(name) => println!("  {slot:<10} -> {name}"),
            None => println!("  {slot:<10} -> (unmapped)"),
        }
    }

    println!();
    println!("sample:");
    println!("  {}", parsed.headers.join(" | "));
    for row in parsed.rows.iter().take(5) {
        println!("  {}", row.values.join(" | "));
    }
    Ok(())
}

pub struct ImportArgs {
    pub db: Option<PathBuf>,
    pub file: PathBuf,
    pub account: String,
    pub delimiter: Option<String>,
    pub no_header: bool,
    pub date_format: Option<DateFormatArg>,
    pub rules: Option<PathBuf>,
    pub dry_run: bool,
}

pub async fn import(args: ImportArgs) -> Result<()> {
    let ledger = open_ledger(args.db).await?;
    let account = ledger
        .account_by_name(&args.account)
        .await?
        .with_context(|| format!("no account named '{}'", args.account))?;

    let text = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;

    let shared: Arc<dyn Ledger> = Arc::new(ledger.clone());
    let rules: Arc<dyn RuleEngine> = match &args.rules {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let engine = StageRuleEngine::from_toml(&content)
                .with_context(|| format!("parsing rules in {}", path.display()))?;
            Arc::new(PersistedRuleEngine::new(engine, shared.clone()))
        }
        None => Arc::new(NoRules),
    };

    let mut session = ImportSession::new(shared, rules);
    if args.delimiter.is_some() || args.no_header || args.date_format.is_some() {
        let mut dialect = Dialect::default();
        dialect.detect(&text);
        if let Some(d) = &args.delimiter {
            dialect.delimiter = parse_delimiter(d);
        }
        if args.no_header {
            dialect.has_header_row = false;
        }
        if let Some(f) = args.date_format {
            dialect.date_format = f.into();
        }
        session.set_dialect(dialect);
    }

    session.parse(&text).await?;

    if args.dry_run {
        print_preview(&session);
        return Ok(());
    }

    let outcome = session.start_import(account.id).await?;
    let summary = &outcome.summary;
    println!(
        "{} imported, {} transfers created, {} rows skipped, {} duplicates flagged",
        summary.imported, summary.transfers_created, summary.rows_dropped, summary.duplicates_flagged
    );
    // Let the detached balance refresh finish before the process exits.
    let _ = outcome.monthly_refresh.await;
    Ok(())
}

fn print_preview(session: &ImportSession) {
    println!("delimiter:   {}", delimiter_name(&session.dialect.delimiter));
    println!("date format: {:?}", session.dialect.date_format);
    println!();
    for row in session.rows() {
        println!("  {:>4}  {}", row.index + 1, row.values.join(" | "));
        for note in row_annotations(row) {
            println!("        ^ {note}");
        }
    }
    let flagged = session.rows().iter().filter(|r| r.meta.duplicate.is_some()).count();
    println!();
    println!("{} rows, {} flagged as likely duplicates (dry run, nothing written)", session.rows().len(), flagged);
}

fn row_annotations(row: &ImportRow) -> Vec<String> {
    let mut notes = Vec::new();
    if let Some(hint) = &row.meta.transfer {
        let direction = match hint.direction {
            TransferDirection::Outgoing => "to",
            TransferDirection::Incoming => "from",
        };
        notes.push(format!("transfer {direction} own account '{}'", hint.account_name));
    }
    if let Some(flag) = &row.meta.duplicate {
        let kind = match flag.kind {
            DuplicateKind::Standard => "duplicate",
            DuplicateKind::AccountTransfer => "transfer duplicate",
        };
        notes.push(format!(
            "likely {kind} of transaction {} ({:.0}% confidence)",
            flag.transaction_id,
            flag.confidence * 100.0
        ));
    }
    if !row.meta.tags.is_empty() {
        notes.push(format!("tags: {}", row.meta.tags.join(", ")));
    }
    if !row.meta.selected {
        notes.push("deselected".to_string());
    }
    notes
}
