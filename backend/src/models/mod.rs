//! Domain models for the onboarding pipeline.
//!
//! - [`RawRow`] - one header-keyed line of the upload
//! - [`CleanedRow`] - a normalized row plus its field errors
//! - [`Member`], [`User`], [`Role`], [`UserRole`] - persisted entities
//! - [`ImportResult`] - the outcome of one row

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// Raw Rows
// =============================================================================

/// A data line from the upload, zipped against the header.
///
/// Values are padded or truncated to the header width by the parser; when
/// that happens `structural_warning` says so.
#[derive(Debug, Clone)]
pub struct RawRow {
    /// 1-based line in the source file (header is line 1).
    pub line: usize,
    headers: Arc<Vec<String>>,
    values: Vec<String>,
    /// Set when the line had fewer or more values than the header.
    pub structural_warning: Option<String>,
}

impl RawRow {
    pub fn new(line: usize, headers: Arc<Vec<String>>, values: Vec<String>) -> Self {
        Self {
            line,
            headers,
            values,
            structural_warning: None,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.structural_warning = Some(warning.into());
        self
    }

    /// Value of a column, if the header has it.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|h| h == column)
            .and_then(|idx| self.values.get(idx))
            .map(String::as_str)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Column/value pairs in header order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }
}

// =============================================================================
// Employment Status
// =============================================================================

/// Employment status of an affiliate member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    Active,
    OnLeave,
    Retired,
    Terminated,
}

impl EmploymentStatus {
    pub const ALL: [EmploymentStatus; 4] = [
        Self::Active,
        Self::OnLeave,
        Self::Retired,
        Self::Terminated,
    ];

    /// Parse a spreadsheet value, accepting common aliases.
    pub fn from_raw(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "active" | "employed" | "current" => Some(Self::Active),
            "on_leave" | "leave" | "leave_of_absence" => Some(Self::OnLeave),
            "retired" | "retiree" => Some(Self::Retired),
            "terminated" | "inactive" | "former" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::OnLeave => "on_leave",
            Self::Retired => "retired",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for EmploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Cleaned Rows
// =============================================================================

/// Whether a field error stops the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A problem with one field of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl FieldError {
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A row after normalization.
///
/// Fields that failed validation are `None` and have a matching entry in
/// `errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanedRow {
    pub line: usize,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub work_email: Option<String>,
    pub work_phone: Option<String>,
    pub employment_status: Option<EmploymentStatus>,
    pub affiliate_id: Option<Uuid>,
    pub position: Option<String>,
    pub errors: Vec<FieldError>,
}

impl CleanedRow {
    pub fn has_blocking_errors(&self) -> bool {
        self.errors.iter().any(FieldError::is_blocking)
    }

    pub fn blocking_errors(&self) -> Vec<FieldError> {
        self.errors
            .iter()
            .filter(|e| e.is_blocking())
            .cloned()
            .collect()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &FieldError> {
        self.errors.iter().filter(|e| !e.is_blocking())
    }

    /// Domain part of the work email.
    pub fn email_domain(&self) -> Option<&str> {
        self.work_email
            .as_deref()
            .and_then(|e| e.rsplit_once('@'))
            .map(|(_, domain)| domain)
    }
}

// =============================================================================
// Persisted Entities
// =============================================================================

/// The canonical affiliate-person record, unique on `(affiliate_id, work_email)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub work_email: String,
    pub work_phone: Option<String>,
    pub employment_status: EmploymentStatus,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data for inserting a member.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMember {
    pub affiliate_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub work_email: String,
    pub work_phone: Option<String>,
    pub employment_status: EmploymentStatus,
}

/// Account state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    /// Provisioned by an import, credential not yet set.
    Invited,
    Active,
    Disabled,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invited => "invited",
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "invited" => Some(Self::Invited),
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// A login account, unique on `email`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub status: UserStatus,
    /// Empty until the invitee sets a password.
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub invite_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Data for inserting a user.
#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub invite_token: String,
}

/// A named capability bucket. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
}

/// Assignment of a role to a user, unique on `(user_id, role_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub granted_at: DateTime<Utc>,
}

// =============================================================================
// Import Results
// =============================================================================

/// Outcome category of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Created,
    Updated,
    Skipped,
    Failed,
}

/// The outcome of importing one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResult {
    pub line: usize,
    pub status: ImportStatus,
    pub member_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub error: Option<String>,
}

impl ImportResult {
    pub fn failed(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            status: ImportStatus::Failed,
            member_id: None,
            user_id: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(headers: &[&str], values: &[&str]) -> RawRow {
        RawRow::new(
            2,
            Arc::new(headers.iter().map(|s| s.to_string()).collect()),
            values.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_raw_row_lookup_by_column() {
        let r = row(&["first_name", "work_email"], &["Jane", "jane@acme.com"]);
        assert_eq!(r.get("work_email"), Some("jane@acme.com"));
        assert_eq!(r.get("work_phone"), None);
        assert_eq!(r.iter().count(), 2);
    }

    #[test]
    fn test_employment_status_aliases() {
        assert_eq!(EmploymentStatus::from_raw(" Active "), Some(EmploymentStatus::Active));
        assert_eq!(EmploymentStatus::from_raw("On Leave"), Some(EmploymentStatus::OnLeave));
        assert_eq!(EmploymentStatus::from_raw("on-leave"), Some(EmploymentStatus::OnLeave));
        assert_eq!(EmploymentStatus::from_raw("INACTIVE"), Some(EmploymentStatus::Terminated));
        assert_eq!(EmploymentStatus::from_raw("contractor"), None);
    }

    #[test]
    fn test_cleaned_row_blocking_errors() {
        let mut cleaned = CleanedRow {
            work_email: Some("jane@acme.com".into()),
            ..Default::default()
        };
        cleaned.errors.push(FieldError::warning("row", "padded"));
        assert!(!cleaned.has_blocking_errors());
        assert_eq!(cleaned.email_domain(), Some("acme.com"));

        cleaned.errors.push(FieldError::error("work_phone", "bad"));
        assert!(cleaned.has_blocking_errors());
        assert_eq!(cleaned.blocking_errors().len(), 1);
        assert_eq!(cleaned.warnings().count(), 1);
    }
}
