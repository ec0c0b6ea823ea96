use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use collatio_core::{CategoryId, Ledger, LedgerError, Money, RecipientId, TransactionId};

use crate::parser::Resolution;
use crate::pipeline::PreparedTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStage {
    Pre,
    Default,
    Post,
}

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("invalid rule file: {0}")]
    InvalidFile(String),
    #[error("invalid pattern in rule '{rule}': {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// The rule-application collaborator the orchestrator drives. PRE and
/// DEFAULT stages rewrite the in-memory batch before persistence; POST runs
/// against the already-persisted transaction ids.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn apply(
        &self,
        stage: RuleStage,
        batch: Vec<PreparedTransaction>,
    ) -> Result<Vec<PreparedTransaction>, RuleError>;

    async fn apply_post(&self, ids: &[TransactionId]) -> Result<(), RuleError>;
}

/// No-op engine for imports without a rule file.
pub struct NoRules;

#[async_trait]
impl RuleEngine for NoRules {
    async fn apply(
        &self,
        _stage: RuleStage,
        batch: Vec<PreparedTransaction>,
    ) -> Result<Vec<PreparedTransaction>, RuleError> {
        Ok(batch)
    }

    async fn apply_post(&self, _ids: &[TransactionId]) -> Result<(), RuleError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Payee,
    Note,
    OriginalCategory,
    Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Contains,
    Equals,
    Matches,
    AtLeast,
    AtMost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: ConditionField,
    pub op: ConditionOp,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SetRecipient(RecipientId),
    SetCategory(CategoryId),
    AddTag(String),
    SkipAutoMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRule {
    pub name: String,
    pub stage: RuleStage,
    #[serde(default)]
    pub priority: i32,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<ImportRule>,
}

/// One condition with its pattern/amount operand resolved up front.
struct CompiledCondition {
    condition: Condition,
    pattern: Option<regex::Regex>,
    amount: Option<Money>,
}

struct CompiledRule {
    rule: ImportRule,
    conditions: Vec<CompiledCondition>,
}

/// User-defined condition/action rules, applied per pipeline stage in
/// priority order (highest first). All conditions of a rule must hold.
pub struct StageRuleEngine {
    rules: Vec<CompiledRule>,
}

impl StageRuleEngine {
    pub fn new(rules: Vec<ImportRule>) -> Result<Self, RuleError> {
        let mut compiled = rules
            .into_iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?;
        // Highest priority first; stable for equal priorities.
        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Ok(StageRuleEngine { rules: compiled })
    }

    pub fn from_toml(content: &str) -> Result<Self, RuleError> {
        let file: RuleFile =
            toml::from_str(content).map_err(|e| RuleError::InvalidFile(e.to_string()))?;
        Self::new(file.rules)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn apply_stage(&self, stage: RuleStage, tx: &mut PreparedTransaction) {
        for compiled in self.rules.iter().filter(|r| r.rule.stage == stage) {
            if compiled.conditions.iter().all(|c| condition_holds(c, tx)) {
                debug!(rule = %compiled.rule.name, row = %tx.row_identity, "rule matched");
                for action in &compiled.rule.actions {
                    apply_action(action, tx);
                }
            }
        }
    }
}

#[async_trait]
impl RuleEngine for StageRuleEngine {
    async fn apply(
        &self,
        stage: RuleStage,
        mut batch: Vec<PreparedTransaction>,
    ) -> Result<Vec<PreparedTransaction>, RuleError> {
        for tx in &mut batch {
            self.apply_stage(stage, tx);
        }
        Ok(batch)
    }

    async fn apply_post(&self, _ids: &[TransactionId]) -> Result<(), RuleError> {
        Ok(())
    }
}

/// POST-stage wrapper that can write category assignments back to the
/// store. Matching post-persistence sees only the note and amount; payee
/// and original category are import-time text that is not stored verbatim.
pub struct PersistedRuleEngine {
    engine: StageRuleEngine,
    ledger: std::sync::Arc<dyn Ledger>,
}

impl PersistedRuleEngine {
    pub fn new(engine: StageRuleEngine, ledger: std::sync::Arc<dyn Ledger>) -> Self {
        PersistedRuleEngine { engine, ledger }
    }
}

#[async_trait]
impl RuleEngine for PersistedRuleEngine {
    async fn apply(
        &self,
        stage: RuleStage,
        batch: Vec<PreparedTransaction>,
    ) -> Result<Vec<PreparedTransaction>, RuleError> {
        self.engine.apply(stage, batch).await
    }

    async fn apply_post(&self, ids: &[TransactionId]) -> Result<(), RuleError> {
        let post_rules: Vec<&CompiledRule> = self
            .engine
            .rules
            .iter()
            .filter(|r| r.rule.stage == RuleStage::Post)
            .collect();
        if post_rules.is_empty() {
            return Ok(());
        }

        for &id in ids {
            let Some(tx) = self.ledger.transaction(id).await? else {
                continue;
            };
            for compiled in &post_rules {
                let holds = compiled
                    .conditions
                    .iter()
                    .all(|c| persisted_condition_holds(c, &tx.note, tx.amount));
                if !holds {
                    continue;
                }
                for action in &compiled.rule.actions {
                    if let Action::SetCategory(category_id) = action {
                        self.ledger.set_transaction_category(id, *category_id).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn compile_rule(rule: ImportRule) -> Result<CompiledRule, RuleError> {
    let conditions = rule
        .conditions
        .iter()
        .map(|condition| {
            let pattern = if condition.op == ConditionOp::Matches {
                let re = regex::RegexBuilder::new(&condition.value)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| RuleError::InvalidPattern {
                        rule: rule.name.clone(),
                        source,
                    })?;
                Some(re)
            } else {
                None
            };
            let amount = if condition.field == ConditionField::Amount {
                Money::parse_str(&condition.value)
            } else {
                None
            };
            Ok(CompiledCondition { condition: condition.clone(), pattern, amount })
        })
        .collect::<Result<Vec<_>, RuleError>>()?;
    Ok(CompiledRule { rule, conditions })
}

fn condition_holds(compiled: &CompiledCondition, tx: &PreparedTransaction) -> bool {
    match compiled.condition.field {
        ConditionField::Payee => text_op_holds(compiled, &tx.payee),
        ConditionField::Note => text_op_holds(compiled, &tx.note),
        ConditionField::OriginalCategory => text_op_holds(compiled, &tx.original_category),
        ConditionField::Amount => amount_op_holds(compiled, tx.amount),
    }
}

fn persisted_condition_holds(compiled: &CompiledCondition, note: &str, amount: Money) -> bool {
    match compiled.condition.field {
        ConditionField::Note => text_op_holds(compiled, note),
        ConditionField::Amount => amount_op_holds(compiled, amount),
        _ => false,
    }
}

fn text_op_holds(compiled: &CompiledCondition, text: &str) -> bool {
    let haystack = text.to_lowercase();
    let needle = compiled.condition.value.to_lowercase();
    match compiled.condition.op {
        ConditionOp::Contains => haystack.contains(&needle),
        ConditionOp::Equals => haystack == needle,
        ConditionOp::Matches => compiled
            .pattern
            .as_ref()
            .is_some_and(|re| re.is_match(text)),
        ConditionOp::AtLeast | ConditionOp::AtMost => false,
    }
}

fn amount_op_holds(compiled: &CompiledCondition, amount: Money) -> bool {
    let Some(value) = compiled.amount else {
        return false;
    };
    match compiled.condition.op {
        ConditionOp::Equals => amount == value,
        ConditionOp::AtLeast => amount >= value,
        ConditionOp::AtMost => amount <= value,
        ConditionOp::Contains | ConditionOp::Matches => false,
    }
}

fn apply_action(action: &Action, tx: &mut PreparedTransaction) {
    match action {
        Action::SetRecipient(id) => tx.recipient = Resolution::Matched(*id),
        Action::SetCategory(id) => tx.category = Resolution::Matched(*id),
        Action::AddTag(name) => {
            if !tx.tag_names.iter().any(|t| t.eq_ignore_ascii_case(name)) {
                tx.tag_names.push(name.clone());
            }
        }
        Action::SkipAutoMatch => tx.skip_auto_match = true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use collatio_core::AccountId;

    fn prepared(payee: &str, note: &str, cents: i64) -> PreparedTransaction {
        PreparedTransaction {
            row_identity: format!("{payee}|{cents}"),
            source_index: 0,
            account_id: AccountId(1),
            date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            value_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            amount: Money::from_cents(cents),
            note: note.to_string(),
            payee: payee.to_string(),
            original_category: String::new(),
            recipient: Resolution::Pending,
            category: Resolution::Pending,
            tag_ids: Vec::new(),
            tag_names: Vec::new(),
            skip_auto_match: false,
            is_transfer: false,
        }
    }

    fn rule(name: &str, stage: RuleStage, priority: i32, conditions: Vec<Condition>, actions: Vec<Action>) -> ImportRule {
        ImportRule { name: name.to_string(), stage, priority, conditions, actions }
    }

    fn contains(field: ConditionField, value: &str) -> Condition {
        Condition { field, op: ConditionOp::Contains, value: value.to_string() }
    }

    async fn run(engine: &StageRuleEngine, stage: RuleStage, tx: PreparedTransaction) -> PreparedTransaction {
        engine.apply(stage, vec![tx]).await.unwrap().into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn contains_is_case_insensitive() {
        let engine = StageRuleEngine::new(vec![rule(
            "groceries",
            RuleStage::Default,
            0,
            vec![contains(ConditionField::Payee, "rewe")],
            vec![Action::SetCategory(CategoryId(20))],
        )])
        .unwrap();
        let tx = run(&engine, RuleStage::Default, prepared("REWE Markt", "", -5000)).await;
        assert_eq!(tx.category, Resolution::Matched(CategoryId(20)));
    }

    #[tokio::test]
    async fn rule_only_fires_in_its_stage() {
        let engine = StageRuleEngine::new(vec![rule(
            "pre only",
            RuleStage::Pre,
            0,
            vec![contains(ConditionField::Payee, "acme")],
            vec![Action::SkipAutoMatch],
        )])
        .unwrap();
        let tx = run(&engine, RuleStage::Default, prepared("ACME Corp", "", -5000)).await;
        assert!(!tx.skip_auto_match);
        let tx = run(&engine, RuleStage::Pre, prepared("ACME Corp", "", -5000)).await;
        assert!(tx.skip_auto_match);
    }

    #[tokio::test]
    async fn all_conditions_must_hold() {
        let engine = StageRuleEngine::new(vec![rule(
            "big acme",
            RuleStage::Default,
            0,
            vec![
                contains(ConditionField::Payee, "acme"),
                Condition {
                    field: ConditionField::Amount,
                    op: ConditionOp::AtMost,
                    value: "-100.00".to_string(),
                },
            ],
            vec![Action::SetRecipient(RecipientId(7))],
        )])
        .unwrap();
        let small = run(&engine, RuleStage::Default, prepared("ACME", "", -5000)).await;
        assert!(small.recipient.is_pending());
        let big = run(&engine, RuleStage::Default, prepared("ACME", "", -15000)).await;
        assert_eq!(big.recipient, Resolution::Matched(RecipientId(7)));
    }

    #[tokio::test]
    async fn regex_condition_precompiled() {
        let engine = StageRuleEngine::new(vec![rule(
            "amazon",
            RuleStage::Default,
            0,
            vec![Condition {
                field: ConditionField::Payee,
                op: ConditionOp::Matches,
                value: r"^(amzn|amazon)".to_string(),
            }],
            vec![Action::AddTag("online".to_string())],
        )])
        .unwrap();
        let tx = run(&engine, RuleStage::Default, prepared("AMZN*PRIME", "", -1399)).await;
        assert_eq!(tx.tag_names, vec!["online"]);
        let tx = run(&engine, RuleStage::Default, prepared("WHOLE FOODS", "", -1399)).await;
        assert!(tx.tag_names.is_empty());
    }

    #[tokio::test]
    async fn priority_ordering_highest_first() {
        let engine = StageRuleEngine::new(vec![
            rule(
                "low",
                RuleStage::Default,
                1,
                vec![contains(ConditionField::Payee, "acme")],
                vec![Action::SetCategory(CategoryId(1))],
            ),
            rule(
                "high",
                RuleStage::Default,
                10,
                vec![contains(ConditionField::Payee, "acme")],
                vec![Action::SetCategory(CategoryId(2))],
            ),
        ])
        .unwrap();
        // Both fire; the lower-priority rule runs later and wins the slot,
        // so the high-priority rule must come first in application order.
        let tx = run(&engine, RuleStage::Default, prepared("ACME", "", -100)).await;
        assert_eq!(tx.category, Resolution::Matched(CategoryId(1)));
    }

    #[tokio::test]
    async fn add_tag_dedupes() {
        let engine = StageRuleEngine::new(vec![
            rule(
                "a",
                RuleStage::Default,
                0,
                vec![contains(ConditionField::Note, "#food")],
                vec![Action::AddTag("food".to_string())],
            ),
        ])
        .unwrap();
        let mut tx = prepared("REWE", "groceries #food", -5000);
        tx.tag_names.push("food".to_string());
        let tx = run(&engine, RuleStage::Default, tx).await;
        assert_eq!(tx.tag_names, vec!["food"]);
    }

    #[test]
    fn invalid_regex_is_rejected_at_construction() {
        let result = StageRuleEngine::new(vec![rule(
            "broken",
            RuleStage::Default,
            0,
            vec![Condition {
                field: ConditionField::Payee,
                op: ConditionOp::Matches,
                value: "([unclosed".to_string(),
            }],
            vec![],
        )]);
        assert!(matches!(result, Err(RuleError::InvalidPattern { .. })));
    }

    #[test]
    fn loads_from_toml() {
        let content = r#"
            [[rules]]
            name = "salary"
            stage = "pre"
            priority = 5
            conditions = [
                { field = "payee", op = "contains", value = "employer gmbh" },
                { field = "amount", op = "at_least", value = "1000.00" },
            ]
            actions = [
                { set_category = 42 },
                "skip_auto_match",
            ]
        "#;
        let engine = StageRuleEngine::from_toml(content).unwrap();
        assert!(!engine.is_empty());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            StageRuleEngine::from_toml("rules = 3"),
            Err(RuleError::InvalidFile(_))
        ));
    }
}
