use regex::Regex;
use std::sync::LazyLock;

use collatio_core::{Account, Category, Money, Recipient};

use crate::mapper::MappedColumns;
use crate::parser::{ImportRow, MatchCandidate, Resolution, TransferDirection, TransferHint};
use crate::similarity::similarity;

static TAG_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#([^\s#]+)").unwrap());

/// Fuzzy entity matching thresholds. Matches scoring above
/// `retain_threshold` are kept as candidates for a manual step; only a top
/// match above `auto_assign_threshold` resolves the row on its own.
#[derive(Debug, Clone, Copy)]
pub struct EntityMatcher {
    pub retain_threshold: f64,
    pub auto_assign_threshold: f64,
}

impl Default for EntityMatcher {
    fn default() -> Self {
        EntityMatcher {
            retain_threshold: 0.6,
            auto_assign_threshold: 0.8,
        }
    }
}

impl EntityMatcher {
    /// Runs the per-row matching passes in order: account-name transfer
    /// shortcut, recipient matching (skipped for transfer rows), category
    /// matching (always), tag extraction from the notes text.
    pub fn match_row(
        &self,
        row: &mut ImportRow,
        cols: &MappedColumns,
        accounts: &[Account],
        recipients: &[Recipient],
        categories: &[Category],
    ) {
        let recipient_text = cols.recipient.map(|i| row.value(i)).unwrap_or("").to_string();

        // A payee naming one of the user's own accounts is a transfer leg,
        // not a recipient. Takes precedence over recipient matching.
        let transfer = self.transfer_shortcut(row, cols, &recipient_text, accounts);
        match transfer {
            Some(hint) => row.meta.transfer = Some(hint),
            None if !recipient_text.is_empty() => {
                let (resolution, candidates) = self.match_entity(
                    &recipient_text,
                    recipients.iter().map(|r| (r.id, r.name.as_str())),
                );
                row.meta.recipient = resolution;
                row.meta.recipient_candidates = candidates;
            }
            None => {}
        }

        if let Some(category_index) = cols.category {
            let category_text = row.value(category_index).to_string();
            if !category_text.is_empty() {
                let (resolution, candidates) = self.match_entity(
                    &category_text,
                    categories.iter().map(|c| (c.id, c.name.as_str())),
                );
                row.meta.category = resolution;
                row.meta.category_candidates = candidates;
            }
        }

        if let Some(notes_index) = cols.notes {
            row.meta.tags = extract_tags(row.value(notes_index));
        }
    }

    fn transfer_shortcut(
        &self,
        row: &ImportRow,
        cols: &MappedColumns,
        recipient_text: &str,
        accounts: &[Account],
    ) -> Option<TransferHint> {
        if recipient_text.is_empty() {
            return None;
        }
        let needle = recipient_text.to_lowercase();
        let account = accounts
            .iter()
            .find(|a| a.name.to_lowercase() == needle)?;

        let amount = cols
            .amount
            .and_then(|i| Money::parse_str(row.value(i)))
            .unwrap_or_else(Money::zero);
        let direction = if amount.is_negative() {
            TransferDirection::Outgoing
        } else {
            TransferDirection::Incoming
        };

        Some(TransferHint {
            account_id: account.id,
            account_name: account.name.clone(),
            amount,
            direction,
        })
    }

    /// Exact case-insensitive match wins outright; otherwise fuzzy
    /// candidates are retained sorted by score descending and the top one
    /// auto-assigns only above the auto threshold.
    fn match_entity<'a, T: Copy>(
        &self,
        text: &str,
        known: impl Iterator<Item = (T, &'a str)>,
    ) -> (Resolution<T>, Vec<MatchCandidate<T>>) {
        let needle = text.to_lowercase();
        let mut candidates: Vec<MatchCandidate<T>> = Vec::new();

        for (id, name) in known {
            if name.to_lowercase() == needle {
                let exact = MatchCandidate { id, name: name.to_string(), score: 1.0 };
                return (Resolution::Matched(id), vec![exact]);
            }
            let score = similarity(text, name);
            if score > self.retain_threshold {
                candidates.push(MatchCandidate { id, name: name.to_string(), score });
            }
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let resolution = match candidates.first() {
            Some(top) if top.score > self.auto_assign_threshold => Resolution::Matched(top.id),
            _ => Resolution::Pending,
        };
        (resolution, candidates)
    }
}

/// Collects `#tag` tokens from free text: unique names in first-appearance
/// order, `#` terminated by whitespace or another `#`.
pub fn extract_tags(notes: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for capture in TAG_TOKEN.captures_iter(notes) {
        let name = capture[1].to_string();
        if !tags.contains(&name) {
            tags.push(name);
        }
    }
    tags
}
