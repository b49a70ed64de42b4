//! Repository interfaces for the persisted entities.
//!
//! Services receive these as trait objects so the pipeline can run against
//! Postgres ([`postgres::PgStore`]) or in memory ([`memory::MemoryStore`]).
//! Implementations must enforce the unique constraints and report a
//! rejected write as [`StoreError::UniqueViolation`](crate::error::StoreError::UniqueViolation).

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Member, NewMember, NewUser, Role, User};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Member persistence, unique on `(affiliate_id, work_email)`.
#[async_trait]
pub trait MemberRepository: Send + Sync {
    async fn find_by_key(&self, affiliate_id: Uuid, work_email: &str)
        -> StoreResult<Option<Member>>;

    /// The member a user is linked to, if any.
    async fn find_by_user(&self, user_id: Uuid) -> StoreResult<Option<Member>>;

    async fn insert(&self, member: &NewMember) -> StoreResult<Member>;

    /// Overwrite every mutable column of an existing member.
    async fn update(&self, member: &Member) -> StoreResult<Member>;
}

/// User persistence, unique on `email`.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn insert(&self, user: &NewUser) -> StoreResult<User>;
}

/// Roles are read-only; user-role grants are additive.
#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn find_by_names(&self, names: &[String]) -> StoreResult<Vec<Role>>;

    async fn roles_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Role>>;

    /// Grant a role. Returns `false` when the user already had it.
    async fn grant(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool>;
}
