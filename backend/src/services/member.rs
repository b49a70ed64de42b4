//! Member upsert keyed by `(affiliate_id, work_email)`.

use std::sync::Arc;

use crate::cleaner::DomainValidator;
use crate::error::{RowError, RowResult, StoreError};
use crate::models::{CleanedRow, FieldError, Member, NewMember};
use crate::retry::RetryPolicy;
use crate::store::MemberRepository;

/// Attempts at the insert-or-update race before giving up.
pub const MAX_CONFLICT_ATTEMPTS: u32 = 3;

/// What the upsert did to the stored member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOutcome {
    Created,
    Updated,
    /// The stored member already matched the row.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct MemberUpsert {
    pub member: Member,
    pub outcome: MemberOutcome,
}

impl MemberUpsert {
    pub fn was_created(&self) -> bool {
        self.outcome == MemberOutcome::Created
    }
}

/// Creates or updates the canonical member for a cleaned row.
#[derive(Clone)]
pub struct MemberService {
    members: Arc<dyn MemberRepository>,
    domains: Arc<dyn DomainValidator>,
    retry: RetryPolicy,
}

impl MemberService {
    pub fn new(
        members: Arc<dyn MemberRepository>,
        domains: Arc<dyn DomainValidator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            members,
            domains,
            retry,
        }
    }

    /// Insert the member, or apply the row's changed fields to the existing one.
    ///
    /// A unique violation on insert means another writer got there first;
    /// the member is re-fetched and the update path taken, at most
    /// [`MAX_CONFLICT_ATTEMPTS`] times.
    pub async fn upsert(&self, row: &CleanedRow) -> RowResult<MemberUpsert> {
        if row.has_blocking_errors() {
            return Err(RowError::Validation(row.blocking_errors()));
        }
        let (Some(affiliate_id), Some(email), Some(status)) =
            (row.affiliate_id, row.work_email.as_deref(), row.employment_status)
        else {
            return Err(RowError::Validation(vec![FieldError::error(
                "row",
                "Row is missing affiliate, email or employment status after cleaning",
            )]));
        };

        // The blacklist may have changed since the row was cleaned.
        if let Some(domain) = row.email_domain() {
            if self.domains.is_blacklisted(domain) {
                return Err(RowError::BlacklistedDomain(domain.to_string()));
            }
        }

        let repo = self.members.as_ref();
        let new_member = NewMember {
            affiliate_id,
            first_name: row.first_name.clone(),
            last_name: row.last_name.clone(),
            work_email: email.to_string(),
            work_phone: row.work_phone.clone(),
            employment_status: status,
        };
        let new_ref = &new_member;

        for attempt in 1..=MAX_CONFLICT_ATTEMPTS {
            let existing = self
                .retry
                .run(move || repo.find_by_key(affiliate_id, email))
                .await?;

            let result = match existing {
                Some(member) => self.apply_changes(member, row).await,
                None => self
                    .retry
                    .run(move || repo.insert(new_ref))
                    .await
                    .map(|member| MemberUpsert {
                        member,
                        outcome: MemberOutcome::Created,
                    }),
            };

            match result {
                Ok(upsert) => return Ok(upsert),
                Err(StoreError::UniqueViolation { .. } | StoreError::NotFound(_)) => {
                    tracing::warn!(
                        line = row.line,
                        email,
                        attempt,
                        "member write raced with another writer, re-fetching"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(RowError::Conflict {
            attempts: MAX_CONFLICT_ATTEMPTS,
        })
    }

    async fn apply_changes(
        &self,
        mut member: Member,
        row: &CleanedRow,
    ) -> Result<MemberUpsert, StoreError> {
        let mut changed = false;
        changed |= overwrite(&mut member.first_name, &row.first_name);
        changed |= overwrite(&mut member.last_name, &row.last_name);
        changed |= overwrite(&mut member.work_phone, &row.work_phone);
        if let Some(status) = row.employment_status {
            if member.employment_status != status {
                member.employment_status = status;
                changed = true;
            }
        }

        if !changed {
            return Ok(MemberUpsert {
                member,
                outcome: MemberOutcome::Unchanged,
            });
        }

        let repo = self.members.as_ref();
        let member_ref = &member;
        let member = self.retry.run(move || repo.update(member_ref)).await?;
        Ok(MemberUpsert {
            member,
            outcome: MemberOutcome::Updated,
        })
    }
}

/// Replace `stored` with `incoming` when the row has a different value.
/// Blank cells never erase stored data.
fn overwrite(stored: &mut Option<String>, incoming: &Option<String>) -> bool {
    match incoming {
        Some(value) if stored.as_ref() != Some(value) => {
            *stored = Some(value.clone());
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::DomainBlacklist;
    use crate::models::EmploymentStatus;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn service(store: &Arc<MemoryStore>, blacklist: &[&str]) -> MemberService {
        MemberService::new(
            store.clone(),
            Arc::new(DomainBlacklist::new(blacklist.iter().copied())),
            RetryPolicy::immediate(3),
        )
    }

    fn row(first: &str, email: &str, phone: Option<&str>) -> CleanedRow {
        CleanedRow {
            line: 2,
            first_name: Some(first.into()),
            last_name: Some("Doe".into()),
            work_email: Some(email.into()),
            work_phone: phone.map(str::to_string),
            employment_status: Some(EmploymentStatus::Active),
            affiliate_id: Some(Uuid::nil()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_update_then_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(&store, &[]);

        let first = svc.upsert(&row("Jane", "jane@acme.com", Some("5550100"))).await.unwrap();
        assert!(first.was_created());

        let second = svc.upsert(&row("Janet", "jane@acme.com", None)).await.unwrap();
        assert_eq!(second.outcome, MemberOutcome::Updated);
        assert_eq!(second.member.id, first.member.id);
        assert_eq!(second.member.first_name.as_deref(), Some("Janet"));
        // blank phone keeps the stored value
        assert_eq!(second.member.work_phone.as_deref(), Some("5550100"));

        let third = svc.upsert(&row("Janet", "jane@acme.com", None)).await.unwrap();
        assert_eq!(third.outcome, MemberOutcome::Unchanged);
        assert_eq!(store.members().len(), 1);
    }

    #[tokio::test]
    async fn test_blacklist_rechecked_at_write_time() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(&store, &["acme.com"]);

        let err = svc.upsert(&row("Jane", "jane@acme.com", None)).await.unwrap_err();
        assert!(matches!(err, RowError::BlacklistedDomain(ref d) if d == "acme.com"));
        assert!(store.members().is_empty());
    }

    #[tokio::test]
    async fn test_insert_race_takes_update_path() {
        let store = Arc::new(MemoryStore::new());
        store.race_next_member_insert(NewMember {
            affiliate_id: Uuid::nil(),
            first_name: Some("Other".into()),
            last_name: None,
            work_email: "jane@acme.com".into(),
            work_phone: None,
            employment_status: EmploymentStatus::Active,
        });
        let svc = service(&store, &[]);

        let upsert = svc.upsert(&row("Jane", "jane@acme.com", None)).await.unwrap();
        assert_eq!(upsert.outcome, MemberOutcome::Updated);
        assert_eq!(upsert.member.first_name.as_deref(), Some("Jane"));
        assert_eq!(store.members().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_conflict_gives_up() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..MAX_CONFLICT_ATTEMPTS {
            store.fail_next_member_insert_with(StoreError::UniqueViolation {
                constraint: "members_affiliate_id_work_email_key".into(),
            });
        }
        let svc = service(&store, &[]);

        let err = svc.upsert(&row("Jane", "jane@acme.com", None)).await.unwrap_err();
        assert!(matches!(err, RowError::Conflict { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_transient_insert_error_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_member_insert_with(StoreError::Transient("deadlock".into()));
        let svc = service(&store, &[]);

        let upsert = svc.upsert(&row("Jane", "jane@acme.com", None)).await.unwrap();
        assert!(upsert.was_created());
    }

    #[tokio::test]
    async fn test_rejects_row_with_blocking_errors() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(&store, &[]);
        let mut bad = row("Jane", "jane@acme.com", None);
        bad.errors.push(FieldError::error("work_phone", "bad"));

        assert!(matches!(svc.upsert(&bad).await, Err(RowError::Validation(_))));
        assert!(store.members().is_empty());
    }
}
