//! In-memory store used by tests and `onboard import --in-memory`.
//!
//! Enforces the same unique constraints as the Postgres schema and exposes
//! a few hooks to inject write races and outages.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{MemberRepository, RoleRepository, UserRepository};
use crate::error::{StoreError, StoreResult};
use crate::models::{Member, NewMember, NewUser, Role, User, UserRole, UserStatus};

#[derive(Debug, Default)]
struct State {
    members: HashMap<Uuid, Member>,
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, Role>,
    user_roles: Vec<UserRole>,

    /// Errors returned by the next member inserts, in order.
    member_insert_faults: VecDeque<MemberInsertFault>,
    /// Member writes allowed before the store reports itself unavailable.
    writes_until_outage: Option<usize>,
    unavailable: bool,
}

#[derive(Debug)]
enum MemberInsertFault {
    Fail(StoreError),
    /// Another writer inserts this member first, then our insert collides.
    Race(NewMember),
}

/// A thread-safe store holding every table in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with the given role names.
    pub fn with_roles<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for name in names {
            store.seed_role(name);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-write.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(state: &State) -> StoreResult<()> {
        if state.unavailable {
            return Err(StoreError::Unavailable("in-memory store is offline".into()));
        }
        Ok(())
    }

    fn count_member_write(state: &mut State) -> StoreResult<()> {
        Self::check_available(state)?;
        if let Some(remaining) = state.writes_until_outage.as_mut() {
            if *remaining == 0 {
                state.unavailable = true;
                return Self::check_available(state);
            }
            *remaining -= 1;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Seeding and inspection
    // -------------------------------------------------------------------------

    pub fn seed_role(&self, name: impl Into<String>) -> Role {
        let role = Role {
            id: Uuid::new_v4(),
            name: name.into(),
        };
        self.lock().roles.insert(role.id, role.clone());
        role
    }

    /// Insert a user directly, bypassing the pipeline.
    pub fn seed_user(&self, email: &str) -> User {
        let user = new_user_record(&NewUser {
            email: email.to_string(),
            first_name: None,
            last_name: None,
            invite_token: String::new(),
        });
        self.lock().users.insert(user.id, user.clone());
        user
    }

    /// Insert a member directly, bypassing the pipeline.
    pub fn seed_member(&self, member: &NewMember, user_id: Option<Uuid>) -> Member {
        let mut record = new_member_record(member);
        record.user_id = user_id;
        self.lock().members.insert(record.id, record.clone());
        record
    }

    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.lock().members.values().cloned().collect();
        members.sort_by(|a, b| a.work_email.cmp(&b.work_email));
        members
    }

    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.lock().users.values().cloned().collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        users
    }

    /// Role names granted to a user, sorted.
    pub fn role_names_for(&self, user_id: Uuid) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .user_roles
            .iter()
            .filter(|ur| ur.user_id == user_id)
            .filter_map(|ur| state.roles.get(&ur.role_id))
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Make the next member insert fail with `err`.
    pub fn fail_next_member_insert_with(&self, err: StoreError) {
        self.lock()
            .member_insert_faults
            .push_back(MemberInsertFault::Fail(err));
    }

    /// Simulate a concurrent writer inserting `member` just before our next insert.
    pub fn race_next_member_insert(&self, member: NewMember) {
        self.lock()
            .member_insert_faults
            .push_back(MemberInsertFault::Race(member));
    }

    /// Allow `writes` more member writes, then go offline.
    pub fn disconnect_after_member_writes(&self, writes: usize) {
        self.lock().writes_until_outage = Some(writes);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }
}

fn new_member_record(member: &NewMember) -> Member {
    let now = Utc::now();
    Member {
        id: Uuid::new_v4(),
        affiliate_id: member.affiliate_id,
        first_name: member.first_name.clone(),
        last_name: member.last_name.clone(),
        work_email: member.work_email.clone(),
        work_phone: member.work_phone.clone(),
        employment_status: member.employment_status,
        user_id: None,
        created_at: now,
        updated_at: now,
    }
}

fn new_user_record(user: &NewUser) -> User {
    User {
        id: Uuid::new_v4(),
        email: user.email.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        status: UserStatus::Invited,
        password_hash: String::new(),
        invite_token: Some(user.invite_token.clone()).filter(|t| !t.is_empty()),
        created_at: Utc::now(),
    }
}

fn member_key_taken(state: &State, affiliate_id: Uuid, email: &str, except: Option<Uuid>) -> bool {
    state.members.values().any(|m| {
        m.affiliate_id == affiliate_id && m.work_email == email && Some(m.id) != except
    })
}

#[async_trait]
impl MemberRepository for MemoryStore {
    async fn find_by_key(
        &self,
        affiliate_id: Uuid,
        work_email: &str,
    ) -> StoreResult<Option<Member>> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state
            .members
            .values()
            .find(|m| m.affiliate_id == affiliate_id && m.work_email == work_email)
            .cloned())
    }

    async fn find_by_user(&self, user_id: Uuid) -> StoreResult<Option<Member>> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state
            .members
            .values()
            .find(|m| m.user_id == Some(user_id))
            .cloned())
    }

    async fn insert(&self, member: &NewMember) -> StoreResult<Member> {
        let mut state = self.lock();
        Self::count_member_write(&mut state)?;

        match state.member_insert_faults.pop_front() {
            Some(MemberInsertFault::Fail(err)) => return Err(err),
            Some(MemberInsertFault::Race(winner)) => {
                let record = new_member_record(&winner);
                state.members.insert(record.id, record);
            }
            None => {}
        }

        if member_key_taken(&state, member.affiliate_id, &member.work_email, None) {
            return Err(StoreError::UniqueViolation {
                constraint: "members_affiliate_id_work_email_key".into(),
            });
        }
        let record = new_member_record(member);
        state.members.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, member: &Member) -> StoreResult<Member> {
        let mut state = self.lock();
        Self::count_member_write(&mut state)?;

        if !state.members.contains_key(&member.id) {
            return Err(StoreError::NotFound(format!("member {}", member.id)));
        }
        if member_key_taken(&state, member.affiliate_id, &member.work_email, Some(member.id)) {
            return Err(StoreError::UniqueViolation {
                constraint: "members_affiliate_id_work_email_key".into(),
            });
        }
        if let Some(user_id) = member.user_id {
            let linked_elsewhere = state
                .members
                .values()
                .any(|m| m.user_id == Some(user_id) && m.id != member.id);
            if linked_elsewhere {
                return Err(StoreError::UniqueViolation {
                    constraint: "members_user_id_key".into(),
                });
            }
        }

        let mut record = member.clone();
        record.updated_at = Utc::now();
        state.members.insert(record.id, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state.users.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn insert(&self, user: &NewUser) -> StoreResult<User> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        if state.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::UniqueViolation {
                constraint: "users_email_key".into(),
            });
        }
        let record = new_user_record(user);
        state.users.insert(record.id, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl RoleRepository for MemoryStore {
    async fn find_by_names(&self, names: &[String]) -> StoreResult<Vec<Role>> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state
            .roles
            .values()
            .filter(|r| names.contains(&r.name))
            .cloned()
            .collect())
    }

    async fn roles_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Role>> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state
            .user_roles
            .iter()
            .filter(|ur| ur.user_id == user_id)
            .filter_map(|ur| state.roles.get(&ur.role_id).cloned())
            .collect())
    }

    async fn grant(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        let exists = state
            .user_roles
            .iter()
            .any(|ur| ur.user_id == user_id && ur.role_id == role_id);
        if exists {
            return Ok(false);
        }
        state.user_roles.push(UserRole {
            user_id,
            role_id,
            granted_at: Utc::now(),
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmploymentStatus;

    fn new_member(email: &str) -> NewMember {
        NewMember {
            affiliate_id: Uuid::nil(),
            first_name: Some("Jane".into()),
            last_name: Some("Doe".into()),
            work_email: email.into(),
            work_phone: None,
            employment_status: EmploymentStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_member_key_is_unique() {
        let store = MemoryStore::new();
        MemberRepository::insert(&store, &new_member("jane@acme.com")).await.unwrap();

        let err = MemberRepository::insert(&store, &new_member("jane@acme.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));
        assert_eq!(store.members().len(), 1);
    }

    #[tokio::test]
    async fn test_race_inserts_competing_member_first() {
        let store = MemoryStore::new();
        store.race_next_member_insert(new_member("jane@acme.com"));

        let err = MemberRepository::insert(&store, &new_member("jane@acme.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));
        assert_eq!(store.members().len(), 1);
    }

    #[tokio::test]
    async fn test_grant_is_idempotent() {
        let store = MemoryStore::new();
        let role = store.seed_role("member");
        let user = store.seed_user("jane@acme.com");

        assert!(store.grant(user.id, role.id).await.unwrap());
        assert!(!store.grant(user.id, role.id).await.unwrap());
        assert_eq!(store.role_names_for(user.id), vec!["member".to_string()]);
    }

    #[tokio::test]
    async fn test_outage_after_member_writes() {
        let store = MemoryStore::new();
        store.disconnect_after_member_writes(1);

        MemberRepository::insert(&store, &new_member("a@acme.com")).await.unwrap();
        let err = MemberRepository::insert(&store, &new_member("b@acme.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(UserRepository::find_by_email(&store, "a@acme.com").await.is_err());
    }
}
