pub mod dialect;
pub mod duplicates;
pub mod mapper;
pub mod matcher;
pub mod parser;
pub mod pipeline;
pub mod rules;
pub mod similarity;

pub use dialect::{DateFormat, Delimiter, Dialect};
pub use duplicates::{DuplicateDetector, ExistingTransaction};
pub use mapper::{infer_mapping, ColumnMapping, MappedColumns};
pub use matcher::EntityMatcher;
pub use parser::{
    parse_rows, DuplicateFlag, DuplicateKind, ImportRow, MatchCandidate, ParseError, ParsedFile,
    Resolution, RowMeta, TransferDirection, TransferHint,
};
pub use pipeline::{
    AccountTransferCandidate, ImportError, ImportOutcome, ImportSession, ImportSummary,
    PreparedTransaction, SessionState,
};
pub use rules::{
    Action, Condition, ConditionField, ConditionOp, ImportRule, NoRules, PersistedRuleEngine,
    RuleEngine, RuleError, RuleStage, StageRuleEngine,
};
pub use similarity::similarity;
