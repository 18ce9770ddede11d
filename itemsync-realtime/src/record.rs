//! Record model: the user-owned items that sessions mutate and observe.
//!
//! Records serialize in camelCase with timestamps as unix milliseconds,
//! which is the shape every outbound mutation event carries.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Maximum characters in an item's text.
pub const MAX_TEXT_LEN: usize = 200;
/// Minimum characters in an item's text.
pub const MIN_TEXT_LEN: usize = 3;
/// Maximum characters in a list search string.
pub const MAX_SEARCH_LEN: usize = 100;
/// Upper bound for `ListQuery::limit`.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Owner identity, as encoded in bearer tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A to-do item owned by exactly one user.
///
/// `version` starts at 1 and grows by exactly one per accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub user_id: UserId,
    pub text: String,
    pub completed: bool,
    pub version: u64,
    #[serde(with = "unix_millis")]
    pub created_at: SystemTime,
    #[serde(with = "unix_millis")]
    pub updated_at: SystemTime,
}

/// Fields supplied when creating an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub text: Option<String>,
    pub completed: Option<bool>,
}

impl NewRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            completed: None,
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        let mut errors = Vec::new();
        match &self.text {
            Some(text) => validate_text(text, &mut errors),
            None => errors.push("Text is required".to_string()),
        }
        into_result(errors)
    }
}

/// Partial update. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub text: Option<String>,
    pub completed: Option<bool>,
}

impl RecordPatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            completed: None,
        }
    }

    pub fn completed(completed: bool) -> Self {
        Self {
            text: None,
            completed: Some(completed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.completed.is_none()
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.is_empty() {
            return Err(SyncError::Validation("Nothing to update".into()));
        }
        let mut errors = Vec::new();
        if let Some(text) = &self.text {
            validate_text(text, &mut errors);
        }
        into_result(errors)
    }

    /// Copies the present fields onto `record`. Does not touch `version`.
    pub(crate) fn apply_to(&self, record: &mut Record) {
        if let Some(text) = &self.text {
            record.text = text.clone();
        }
        if let Some(completed) = self.completed {
            record.completed = completed;
        }
    }
}

fn validate_text(text: &str, errors: &mut Vec<String>) {
    let len = text.chars().count();
    if text.trim().is_empty() {
        errors.push("Text cannot be empty".to_string());
    } else if len > MAX_TEXT_LEN {
        errors.push(format!("Text must be less than {MAX_TEXT_LEN} characters"));
    } else if len < MIN_TEXT_LEN {
        errors.push(format!("Text must be at least {MIN_TEXT_LEN} characters"));
    }
}

fn into_result(errors: Vec<String>) -> SyncResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(SyncError::Validation(errors.join(", ")))
    }
}

/// Filtering and pagination for listing a user's items.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    /// Case-insensitive substring match on `text`.
    pub text: Option<String>,
    pub completed: Option<bool>,
    pub page: u32,
    pub limit: u32,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            text: None,
            completed: None,
            page: 1,
            limit: 10,
        }
    }
}

impl ListQuery {
    pub fn validate(&self) -> SyncResult<()> {
        let mut errors = Vec::new();
        if self.page < 1 {
            errors.push("Page must be a positive integer".to_string());
        }
        if self.limit < 1 || self.limit > MAX_PAGE_LIMIT {
            errors.push(format!("Limit must be between 1 and {MAX_PAGE_LIMIT}"));
        }
        if let Some(text) = &self.text {
            if text.chars().count() > MAX_SEARCH_LEN {
                errors.push(format!("Search text must be less than {MAX_SEARCH_LEN} characters"));
            }
        }
        into_result(errors)
    }

    /// True when `record` passes every filter that is set.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(needle) = &self.text {
            if !record.text.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        self.completed.map_or(true, |c| record.completed == c)
    }

    /// Orders newest first and cuts out the requested page.
    pub fn paginate(&self, mut records: Vec<Record>) -> Page {
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = records.len();
        let limit = self.limit.max(1) as usize;
        let offset = (self.page.max(1) as usize - 1) * limit;
        let items = records.into_iter().skip(offset).take(limit).collect();

        Page {
            items,
            total,
            page: self.page,
            limit: self.limit,
            total_pages: total.div_ceil(limit),
        }
    }
}

/// One page of list results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Record>,
    pub total: usize,
    pub page: u32,
    pub limit: u32,
    pub total_pages: usize,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod unix_millis {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}
