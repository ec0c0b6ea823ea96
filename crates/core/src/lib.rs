pub mod entity;
pub mod ledger;
pub mod money;
pub mod transaction;

pub use entity::{
    Account, AccountId, Category, CategoryId, Recipient, RecipientId, Tag, TagId, TransactionId,
};
pub use ledger::{Ledger, LedgerError, WriteOptions};
pub use money::Money;
pub use transaction::{NewTransaction, Transaction, TransactionKind};
