//! Default role assignment.
//!
//! Roles come from a [`RoleMap`] supplied with the configuration. Grants
//! are a set union with what the user already holds; nothing is revoked.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{RowError, RowResult};
use crate::models::{CleanedRow, EmploymentStatus, Role, User};
use crate::retry::RetryPolicy;
use crate::store::RoleRepository;

/// Employment status (and optionally position) to role names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleMap {
    pub by_status: BTreeMap<EmploymentStatus, BTreeSet<String>>,
    /// Extra roles keyed by lower-cased position title.
    pub by_position: BTreeMap<String, BTreeSet<String>>,
}

impl Default for RoleMap {
    fn default() -> Self {
        fn set(names: &[&str]) -> BTreeSet<String> {
            names.iter().map(|n| n.to_string()).collect()
        }
        Self {
            by_status: BTreeMap::from([
                (EmploymentStatus::Active, set(&["member"])),
                (EmploymentStatus::OnLeave, set(&["member"])),
                (EmploymentStatus::Retired, set(&["member", "retiree"])),
                (EmploymentStatus::Terminated, BTreeSet::new()),
            ]),
            by_position: BTreeMap::new(),
        }
    }
}

impl RoleMap {
    /// Role names for a row's status and position.
    pub fn roles_for(
        &self,
        status: Option<EmploymentStatus>,
        position: Option<&str>,
    ) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        if let Some(by_status) = status.and_then(|s| self.by_status.get(&s)) {
            names.extend(by_status.iter().cloned());
        }
        let position = position.map(|p| p.trim().to_lowercase());
        if let Some(by_position) = position.and_then(|p| self.by_position.get(&p)) {
            names.extend(by_position.iter().cloned());
        }
        names
    }

    /// Every role name the map can hand out.
    pub fn all_role_names(&self) -> BTreeSet<String> {
        self.by_status
            .values()
            .chain(self.by_position.values())
            .flatten()
            .cloned()
            .collect()
    }
}

/// Roles the mapping grants a user after assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleGrant {
    /// Every mapped role, whether granted now or earlier.
    pub roles: BTreeSet<Role>,
    /// Names of roles added by this call.
    pub newly_granted: Vec<String>,
}

#[derive(Clone)]
pub struct RoleAssignmentService {
    roles: Arc<dyn RoleRepository>,
    map: RoleMap,
    retry: RetryPolicy,
}

impl RoleAssignmentService {
    pub fn new(roles: Arc<dyn RoleRepository>, map: RoleMap, retry: RetryPolicy) -> Self {
        Self { roles, map, retry }
    }

    pub async fn assign_default_roles(
        &self,
        user: &User,
        row: &CleanedRow,
    ) -> RowResult<RoleGrant> {
        let wanted: Vec<String> = self
            .map
            .roles_for(row.employment_status, row.position.as_deref())
            .into_iter()
            .collect();
        if wanted.is_empty() {
            return Ok(RoleGrant::default());
        }

        let repo = self.roles.as_ref();
        let wanted_ref = wanted.as_slice();
        let mut found = self.retry.run(move || repo.find_by_names(wanted_ref)).await?;
        found.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(missing) = wanted
            .iter()
            .find(|name| !found.iter().any(|r| &r.name == *name))
        {
            return Err(RowError::UnknownRole(missing.clone()));
        }

        let user_id = user.id;
        let held: BTreeSet<Role> = self
            .retry
            .run(move || repo.roles_for_user(user_id))
            .await?
            .into_iter()
            .collect();

        let mut grant = RoleGrant::default();
        for role in found {
            if !held.contains(&role) {
                let role_id = role.id;
                if self.retry.run(move || repo.grant(user_id, role_id)).await? {
                    grant.newly_granted.push(role.name.clone());
                }
            }
            grant.roles.insert(role);
        }

        if !grant.newly_granted.is_empty() {
            tracing::debug!(%user_id, roles = ?grant.newly_granted, "granted roles");
        }
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn row(status: EmploymentStatus, position: Option<&str>) -> CleanedRow {
        CleanedRow {
            employment_status: Some(status),
            position: position.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_map() {
        let map = RoleMap::default();
        assert_eq!(
            map.roles_for(Some(EmploymentStatus::Retired), None),
            BTreeSet::from(["member".to_string(), "retiree".to_string()])
        );
        assert!(map.roles_for(Some(EmploymentStatus::Terminated), None).is_empty());
        assert_eq!(
            map.all_role_names(),
            BTreeSet::from(["member".to_string(), "retiree".to_string()])
        );
    }

    #[test]
    fn test_role_map_from_json() {
        let map: RoleMap = serde_json::from_str(
            r#"{ "by_status": { "active": ["member"] }, "by_position": { "steward": ["steward"] } }"#,
        )
        .unwrap();
        assert_eq!(
            map.roles_for(Some(EmploymentStatus::Active), Some(" Steward ")),
            BTreeSet::from(["member".to_string(), "steward".to_string()])
        );
    }

    #[tokio::test]
    async fn test_assignment_is_additive_and_idempotent() {
        let store = Arc::new(MemoryStore::with_roles(["member", "retiree", "admin"]));
        let user = store.seed_user("jane@acme.com");
        let admin = store
            .find_by_names(&["admin".to_string()])
            .await
            .unwrap()
            .remove(0);
        store.grant(user.id, admin.id).await.unwrap();

        let svc = RoleAssignmentService::new(
            store.clone(),
            RoleMap::default(),
            RetryPolicy::immediate(3),
        );

        let grant = svc
            .assign_default_roles(&user, &row(EmploymentStatus::Retired, None))
            .await
            .unwrap();
        assert_eq!(grant.newly_granted, vec!["member".to_string(), "retiree".to_string()]);

        let again = svc
            .assign_default_roles(&user, &row(EmploymentStatus::Retired, None))
            .await
            .unwrap();
        assert!(again.newly_granted.is_empty());
        assert_eq!(again.roles.len(), 2);

        // status change never revokes
        svc.assign_default_roles(&user, &row(EmploymentStatus::Terminated, None))
            .await
            .unwrap();
        assert_eq!(store.role_names_for(user.id), vec!["admin", "member", "retiree"]);
    }

    #[tokio::test]
    async fn test_unknown_role_fails() {
        let store = Arc::new(MemoryStore::new());
        let user = store.seed_user("jane@acme.com");
        let svc = RoleAssignmentService::new(
            store.clone(),
            RoleMap::default(),
            RetryPolicy::immediate(3),
        );

        let err = svc
            .assign_default_roles(&user, &row(EmploymentStatus::Active, None))
            .await
            .unwrap_err();
        assert!(matches!(err, RowError::UnknownRole(ref name) if name == "member"));
    }
}
