//! Row normalization and validation.
//!
//! [`DataCleaner::clean`] never fails: every problem is recorded as a
//! [`FieldError`] on the returned [`CleanedRow`] and the caller decides what
//! to do with it. Only `work_email` is required.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{CleanedRow, EmploymentStatus, FieldError, RawRow};

/// Column holding the member's work email. Required in every upload.
pub const WORK_EMAIL: &str = "work_email";
pub const FIRST_NAME: &str = "first_name";
pub const LAST_NAME: &str = "last_name";
pub const WORK_PHONE: &str = "work_phone";
pub const EMPLOYMENT_STATUS: &str = "employment_status";
pub const AFFILIATE_ID: &str = "affiliate_id";
pub const POSITION: &str = "position";

/// Maximum email length per RFC 5321.
const MAX_EMAIL_LENGTH: usize = 254;

const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

static PHONE_EXTENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:x|ext\.?|extension)\s*\d+\s*$").expect("extension pattern is valid")
});

// =============================================================================
// Domain Blacklist
// =============================================================================

/// Decides whether an email domain may be onboarded.
pub trait DomainValidator: Send + Sync {
    fn is_blacklisted(&self, domain: &str) -> bool;
}

/// A fixed set of disallowed domains. Subdomains of a listed domain are
/// disallowed too.
#[derive(Debug, Clone, Default)]
pub struct DomainBlacklist {
    domains: HashSet<String>,
}

impl DomainBlacklist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().trim_start_matches('@').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }
}

impl DomainValidator for DomainBlacklist {
    fn is_blacklisted(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        let mut candidate = domain.as_str();
        loop {
            if self.domains.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent,
                _ => return false,
            }
        }
    }
}

// =============================================================================
// Field Normalizers
// =============================================================================

/// Trim, collapse inner whitespace and title-case a personal name.
///
/// Letters following a space, hyphen or apostrophe are capitalised:
/// `"mary-jane  o'neil"` becomes `"Mary-Jane O'Neil"`.
pub fn title_case_name(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    let mut out = String::with_capacity(collapsed.len());
    let mut capitalize = true;
    for c in collapsed.chars() {
        if capitalize {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        capitalize = matches!(c, ' ' | '-' | '\'');
    }
    Some(out)
}

/// Validate an email address format.
///
/// A practical check, not full RFC 5322: exactly one `@`, non-empty local
/// part, a dotted domain that does not start or end with `.` or `-`, no
/// whitespace, at most 254 characters.
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.is_empty() {
        return Err("Email is empty".to_string());
    }
    if email.len() > MAX_EMAIL_LENGTH {
        return Err(format!(
            "Email exceeds maximum length of {MAX_EMAIL_LENGTH} characters"
        ));
    }
    if email.contains(char::is_whitespace) {
        return Err("Email contains whitespace".to_string());
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err("Email must contain exactly one '@'".to_string());
    };
    if domain.contains('@') {
        return Err("Email must contain exactly one '@'".to_string());
    }
    if local.is_empty() {
        return Err("Email local part is empty".to_string());
    }
    if domain.is_empty() {
        return Err("Email domain is empty".to_string());
    }
    if !domain.contains('.') {
        return Err("Email domain must contain at least one '.'".to_string());
    }
    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return Err("Email domain has an empty label".to_string());
    }
    if domain.starts_with('-') || domain.ends_with('-') {
        return Err("Email domain cannot start or end with '-'".to_string());
    }
    Ok(())
}

/// Reduce a phone number to its canonical form: digits only, with a
/// leading `+` kept when present. Extensions are dropped.
pub fn normalize_phone(raw: &str) -> Result<Option<String>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let without_ext = PHONE_EXTENSION.replace(trimmed, "");
    let without_ext = without_ext.trim();

    let international = without_ext.starts_with('+');
    let body = without_ext.strip_prefix('+').unwrap_or(without_ext);

    if let Some(bad) = body
        .chars()
        .find(|c| !(c.is_ascii_digit() || matches!(*c, ' ' | '-' | '.' | '(' | ')')))
    {
        return Err(format!("Phone number contains invalid character '{bad}'"));
    }

    let digits: String = body.chars().filter(char::is_ascii_digit).collect();
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return Err(format!(
            "Phone number must have {MIN_PHONE_DIGITS} to {MAX_PHONE_DIGITS} digits, found {}",
            digits.len()
        ));
    }

    Ok(Some(if international {
        format!("+{digits}")
    } else {
        digits
    }))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// =============================================================================
// Data Cleaner
// =============================================================================

/// Turns [`RawRow`]s into [`CleanedRow`]s.
#[derive(Clone)]
pub struct DataCleaner {
    domains: Arc<dyn DomainValidator>,
    default_affiliate_id: Uuid,
}

impl DataCleaner {
    pub fn new(domains: Arc<dyn DomainValidator>, default_affiliate_id: Uuid) -> Self {
        Self {
            domains,
            default_affiliate_id,
        }
    }

    /// The validator consulted for email domains.
    pub fn domain_validator(&self) -> &Arc<dyn DomainValidator> {
        &self.domains
    }

    pub fn clean(&self, row: &RawRow) -> CleanedRow {
        let mut cleaned = CleanedRow {
            line: row.line,
            ..Default::default()
        };

        if let Some(warning) = &row.structural_warning {
            cleaned.errors.push(FieldError::warning("row", warning.clone()));
        }

        cleaned.first_name = row.get(FIRST_NAME).and_then(title_case_name);
        cleaned.last_name = row.get(LAST_NAME).and_then(title_case_name);
        cleaned.position = non_empty(row.get(POSITION)).map(str::to_string);

        self.clean_email(row, &mut cleaned);

        match normalize_phone(row.get(WORK_PHONE).unwrap_or_default()) {
            Ok(phone) => cleaned.work_phone = phone,
            Err(msg) => cleaned.errors.push(FieldError::error(WORK_PHONE, msg)),
        }

        match non_empty(row.get(EMPLOYMENT_STATUS)) {
            None => cleaned.employment_status = Some(EmploymentStatus::Active),
            Some(raw) => match EmploymentStatus::from_raw(raw) {
                Some(status) => cleaned.employment_status = Some(status),
                None => cleaned.errors.push(FieldError::error(
                    EMPLOYMENT_STATUS,
                    format!(
                        "Unknown employment status '{raw}', expected one of: {}",
                        EmploymentStatus::ALL.map(|s| s.as_str()).join(", ")
                    ),
                )),
            },
        }

        match non_empty(row.get(AFFILIATE_ID)) {
            None => cleaned.affiliate_id = Some(self.default_affiliate_id),
            Some(raw) => match Uuid::parse_str(raw) {
                Ok(id) => cleaned.affiliate_id = Some(id),
                Err(_) => cleaned.errors.push(FieldError::error(
                    AFFILIATE_ID,
                    format!("Affiliate reference '{raw}' is not a valid UUID"),
                )),
            },
        }

        cleaned
    }

    fn clean_email(&self, row: &RawRow, cleaned: &mut CleanedRow) {
        let email = row
            .get(WORK_EMAIL)
            .map(|e| e.trim().to_lowercase())
            .unwrap_or_default();

        if let Err(msg) = validate_email(&email) {
            cleaned.errors.push(FieldError::error(WORK_EMAIL, msg));
            return;
        }

        let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();
        if self.domains.is_blacklisted(domain) {
            cleaned.errors.push(FieldError::error(
                WORK_EMAIL,
                format!("Email domain '{domain}' is not allowed"),
            ));
            return;
        }

        cleaned.work_email = Some(email);
    }
}

impl std::fmt::Debug for DataCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCleaner")
            .field("default_affiliate_id", &self.default_affiliate_id)
            .finish_non_exhaustive()
    }
}
