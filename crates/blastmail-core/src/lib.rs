//! Core domain model for the Blastmail bulk import engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "blastmail-core";

/// One spreadsheet-derived row, already keyed by the four canonical fields.
///
/// Ephemeral: built by the ingestor for the duration of a single import call.
/// `source_index` is the row's position in the original payload so skips can
/// point back at the spreadsheet row that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub source_index: usize,
    pub category_name: String,
    pub category_description: String,
    pub recipient_name: String,
    pub recipient_email: String,
}

/// Canonical dedup key for a category name: trimmed and lower-cased.
///
/// Two names that differ only by case or surrounding whitespace produce equal
/// keys and must resolve to the same persisted category.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CategoryKey(String);

impl CategoryKey {
    pub fn normalize(name: &str) -> Self {
        Self(name.trim().to_lowercase())
    }

    /// A key that normalized to nothing cannot anchor a category.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted category. At most one per `(user_id, CategoryKey(name))`;
/// first-seen name and description win and are never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted recipient. Email is unique across the whole store, not per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub category_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Insertion draft handed to the persistence gateway by the batch builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecipient {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub category_id: Uuid,
}

/// Why a row was left out of the insert batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Row shape could not be read, or the email is not structurally an email.
    MalformedRow,
    /// Recipient name or email was empty after trimming.
    MissingField,
    /// Category name was blank, or its reconciliation failed.
    NoCategory,
    /// The store already holds a recipient with this email.
    DuplicateEmail,
}

/// A reported skip, attributed to the source row that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSkip {
    pub row_index: usize,
    pub reason: SkipReason,
}

impl RowSkip {
    pub fn new(row_index: usize, reason: SkipReason) -> Self {
        Self { row_index, reason }
    }
}

/// Pipeline stage an isolated failure was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportStage {
    Ingest,
    Reconcile,
    Insert,
}

/// Non-fatal failure recorded into the result instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportError {
    pub stage: ImportStage,
    pub message: String,
}

impl ImportError {
    pub fn new(stage: ImportStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Summary returned to the caller for one import invocation. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub categories_created: usize,
    pub categories_reused: usize,
    pub recipients_inserted: usize,
    pub rows_skipped: Vec<RowSkip>,
    pub errors: Vec<ImportError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_folds_case_and_whitespace() {
        let a = CategoryKey::normalize("Sales");
        let b = CategoryKey::normalize(" sales ");
        let c = CategoryKey::normalize("SALES");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.as_str(), "sales");
    }

    #[test]
    fn blank_names_normalize_to_the_empty_key() {
        assert!(CategoryKey::normalize("").is_empty());
        assert!(CategoryKey::normalize("   \t ").is_empty());
        assert!(!CategoryKey::normalize(" x ").is_empty());
    }

    #[test]
    fn result_serializes_with_wire_keys() {
        let result = ImportResult {
            categories_created: 2,
            categories_reused: 1,
            recipients_inserted: 5,
            rows_skipped: vec![RowSkip::new(3, SkipReason::MissingField)],
            errors: vec![ImportError::new(ImportStage::Reconcile, "boom")],
        };
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["categoriesCreated"], 2);
        assert_eq!(value["categoriesReused"], 1);
        assert_eq!(value["recipientsInserted"], 5);
        assert_eq!(value["rowsSkipped"][0]["rowIndex"], 3);
        assert_eq!(value["rowsSkipped"][0]["reason"], "MissingField");
        assert_eq!(value["errors"][0]["stage"], "Reconcile");
    }
}
