//! Sequential processing of one chunk of rows.

use crate::cleaner::DataCleaner;
use crate::error::{ImportError, JobResult, RowResult};
use crate::models::{CleanedRow, ImportResult, ImportStatus, RawRow};
use crate::services::{
    MemberOutcome, MemberService, RoleAssignmentService, UserImportService, UserOutcome,
};

/// Runs clean → member → user → roles for each row of a chunk, in order.
///
/// A failing row becomes a `failed` result and the chunk moves on. Only a
/// lost database connection stops the chunk.
#[derive(Clone)]
pub struct ChunkProcessor {
    cleaner: DataCleaner,
    members: MemberService,
    users: UserImportService,
    roles: RoleAssignmentService,
}

impl ChunkProcessor {
    pub fn new(
        cleaner: DataCleaner,
        members: MemberService,
        users: UserImportService,
        roles: RoleAssignmentService,
    ) -> Self {
        Self {
            cleaner,
            members,
            users,
            roles,
        }
    }

    /// One result per row, in row order.
    pub async fn process_chunk(&self, rows: Vec<RawRow>) -> JobResult<Vec<ImportResult>> {
        let mut results = Vec::with_capacity(rows.len());
        for raw in &rows {
            results.push(self.process_row(raw).await?);
        }
        Ok(results)
    }

    async fn process_row(&self, raw: &RawRow) -> JobResult<ImportResult> {
        let row = self.cleaner.clean(raw);
        for warning in row.warnings() {
            tracing::debug!(line = row.line, %warning, "row warning");
        }

        let mut result = ImportResult {
            line: raw.line,
            status: ImportStatus::Failed,
            member_id: None,
            user_id: None,
            error: None,
        };

        match self.import_row(&row, &mut result).await {
            Ok(status) => result.status = status,
            Err(err) if err.is_fatal() => {
                tracing::error!(line = row.line, error = %err, "lost database connectivity");
                return Err(ImportError::Connectivity(err.to_string()));
            }
            Err(err) => {
                tracing::warn!(line = row.line, error = %err, "row failed");
                result.status = ImportStatus::Failed;
                result.error = Some(err.to_string());
            }
        }
        Ok(result)
    }

    /// Ids are written into `result` as soon as they exist, so a row that
    /// fails at the user or role step still reports what was persisted.
    async fn import_row(
        &self,
        row: &CleanedRow,
        result: &mut ImportResult,
    ) -> RowResult<ImportStatus> {
        let upsert = self.members.upsert(row).await?;
        result.member_id = Some(upsert.member.id);

        let link = self.users.create_or_link_user(&upsert.member, row).await?;
        result.user_id = Some(link.user.id);

        let grant = self.roles.assign_default_roles(&link.user, row).await?;

        let status = match upsert.outcome {
            MemberOutcome::Created => ImportStatus::Created,
            MemberOutcome::Updated => ImportStatus::Updated,
            MemberOutcome::Unchanged
                if link.outcome != UserOutcome::AlreadyLinked
                    || !grant.newly_granted.is_empty() =>
            {
                ImportStatus::Updated
            }
            MemberOutcome::Unchanged => ImportStatus::Skipped,
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::DomainBlacklist;
    use crate::error::StoreError;
    use crate::retry::RetryPolicy;
    use crate::services::RoleMap;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use uuid::Uuid;

    fn processor(store: &Arc<MemoryStore>) -> ChunkProcessor {
        let domains = Arc::new(DomainBlacklist::new(["spam.test"]));
        let retry = RetryPolicy::immediate(2);
        ChunkProcessor::new(
            DataCleaner::new(domains.clone(), Uuid::nil()),
            MemberService::new(store.clone(), domains, retry),
            UserImportService::new(store.clone(), store.clone(), retry),
            RoleAssignmentService::new(store.clone(), RoleMap::default(), retry),
        )
    }

    fn rows(lines: &[(&str, &str)]) -> Vec<RawRow> {
        let headers = Arc::new(vec!["first_name".to_string(), "work_email".to_string()]);
        lines
            .iter()
            .enumerate()
            .map(|(idx, (name, email))| {
                RawRow::new(
                    idx + 2,
                    headers.clone(),
                    vec![name.to_string(), email.to_string()],
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_bad_row_does_not_stop_chunk() {
        let store = Arc::new(MemoryStore::with_roles(["member", "retiree"]));
        let results = processor(&store)
            .process_chunk(rows(&[
                ("jane", "jane@acme.com"),
                ("spam", "x@spam.test"),
                ("john", "john@acme.com"),
            ]))
            .await
            .unwrap();

        let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ImportStatus::Created,
                ImportStatus::Failed,
                ImportStatus::Created
            ]
        );
        assert_eq!(results[1].line, 3);
        assert!(results[1].error.as_deref().unwrap().contains("spam.test"));
        assert_eq!(store.members().len(), 2);
        assert_eq!(store.role_names_for(results[0].user_id.unwrap()), vec!["member"]);
    }

    #[tokio::test]
    async fn test_role_failure_keeps_written_ids() {
        // no roles seeded, so "member" is unknown
        let store = Arc::new(MemoryStore::new());
        let results = processor(&store)
            .process_chunk(rows(&[("jane", "jane@acme.com")]))
            .await
            .unwrap();

        assert_eq!(results[0].status, ImportStatus::Failed);
        assert!(results[0].member_id.is_some());
        assert!(results[0].user_id.is_some());
        assert_eq!(results[0].error.as_deref(), Some("Role 'member' does not exist"));
    }

    #[tokio::test]
    async fn test_unavailable_store_aborts_chunk() {
        let store = Arc::new(MemoryStore::with_roles(["member"]));
        store.fail_next_member_insert_with(StoreError::Unavailable("connection reset".into()));

        let err = processor(&store)
            .process_chunk(rows(&[("jane", "jane@acme.com"), ("john", "john@acme.com")]))
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::Connectivity(_)));
        assert!(store.members().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_is_skipped() {
        let store = Arc::new(MemoryStore::with_roles(["member"]));
        let processor = processor(&store);
        processor
            .process_chunk(rows(&[("jane", "jane@acme.com")]))
            .await
            .unwrap();

        let again = processor
            .process_chunk(rows(&[("jane", "jane@acme.com")]))
            .await
            .unwrap();
        assert_eq!(again[0].status, ImportStatus::Skipped);
    }
}
