//! Postgres store backed by `sqlx`.
//!
//! Schema lives in `migrations/0001_onboarding.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use uuid::Uuid;

use super::{MemberRepository, RoleRepository, UserRepository};
use crate::error::{StoreError, StoreResult};
use crate::models::{EmploymentStatus, Member, NewMember, NewUser, Role, User, UserStatus};

/// Repositories over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a small pool; the pipeline only ever runs one query at a time.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))
    }
}

/// Classify a `sqlx` error for the retry policy.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
            constraint: db.constraint().unwrap_or("unique").to_string(),
        },
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) =>
        {
            StoreError::Transient(err.to_string())
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
        sqlx::Error::PoolTimedOut => StoreError::Transient(err.to_string()),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Transient(err.to_string()),
    }
}

#[derive(Debug, FromRow)]
struct MemberRow {
    id: Uuid,
    affiliate_id: Uuid,
    first_name: Option<String>,
    last_name: Option<String>,
    work_email: String,
    work_phone: Option<String>,
    employment_status: String,
    user_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MemberRow> for Member {
    type Error = StoreError;

    fn try_from(row: MemberRow) -> Result<Self, Self::Error> {
        let employment_status = EmploymentStatus::from_raw(&row.employment_status)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "member {} has unknown employment_status '{}'",
                    row.id, row.employment_status
                ))
            })?;
        Ok(Member {
            id: row.id,
            affiliate_id: row.affiliate_id,
            first_name: row.first_name,
            last_name: row.last_name,
            work_email: row.work_email,
            work_phone: row.work_phone,
            employment_status,
            user_id: row.user_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    status: String,
    password_hash: String,
    invite_token: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            status: UserStatus::from_db(&row.status).unwrap_or(UserStatus::Disabled),
            password_hash: row.password_hash,
            invite_token: row.invite_token,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct RoleRow {
    id: Uuid,
    name: String,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role {
            id: row.id,
            name: row.name,
        }
    }
}

const MEMBER_COLUMNS: &str = "id, affiliate_id, first_name, last_name, work_email, work_phone, \
     employment_status, user_id, created_at, updated_at";

#[async_trait]
impl MemberRepository for PgStore {
    async fn find_by_key(
        &self,
        affiliate_id: Uuid,
        work_email: &str,
    ) -> StoreResult<Option<Member>> {
        let sql = format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE affiliate_id = $1 AND work_email = $2"
        );
        sqlx::query_as::<_, MemberRow>(&sql)
            .bind(affiliate_id)
            .bind(work_email)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .map(Member::try_from)
            .transpose()
    }

    async fn find_by_user(&self, user_id: Uuid) -> StoreResult<Option<Member>> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members WHERE user_id = $1");
        sqlx::query_as::<_, MemberRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .map(Member::try_from)
            .transpose()
    }

    async fn insert(&self, member: &NewMember) -> StoreResult<Member> {
        let sql = format!(
            r"
            INSERT INTO members
                (id, affiliate_id, first_name, last_name, work_email, work_phone, employment_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {MEMBER_COLUMNS}
            "
        );
        let row = sqlx::query_as::<_, MemberRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(member.affiliate_id)
            .bind(&member.first_name)
            .bind(&member.last_name)
            .bind(&member.work_email)
            .bind(&member.work_phone)
            .bind(member.employment_status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_into()
    }

    async fn update(&self, member: &Member) -> StoreResult<Member> {
        let sql = format!(
            r"
            UPDATE members
            SET first_name = $2, last_name = $3, work_email = $4, work_phone = $5,
                employment_status = $6, user_id = $7, updated_at = NOW()
            WHERE id = $1
            RETURNING {MEMBER_COLUMNS}
            "
        );
        let row = sqlx::query_as::<_, MemberRow>(&sql)
            .bind(member.id)
            .bind(&member.first_name)
            .bind(&member.last_name)
            .bind(&member.work_email)
            .bind(&member.work_phone)
            .bind(member.employment_status.as_str())
            .bind(member.user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StoreError::NotFound(format!("member {}", member.id)))?;
        row.try_into()
    }
}

const USER_COLUMNS: &str =
    "id, email, first_name, last_name, status, password_hash, invite_token, created_at";

#[async_trait]
impl UserRepository for PgStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(User::from))
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(User::from))
    }

    async fn insert(&self, user: &NewUser) -> StoreResult<User> {
        let sql = format!(
            r"
            INSERT INTO users (id, email, first_name, last_name, status, password_hash, invite_token)
            VALUES ($1, $2, $3, $4, $5, '', $6)
            RETURNING {USER_COLUMNS}
            "
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&user.email)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(UserStatus::Invited.as_str())
            .bind(&user.invite_token)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.into())
    }
}

#[async_trait]
impl RoleRepository for PgStore {
    async fn find_by_names(&self, names: &[String]) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>("SELECT id, name FROM roles WHERE name = ANY($1)")
            .bind(names)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn roles_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            r"
            SELECT r.id, r.name
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn grant(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO user_roles (user_id, role_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, role_id) DO NOTHING
            ",
        )
        .bind(user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_classified() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            StoreError::Transient(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn test_unknown_employment_status_is_not_retried() {
        let now = Utc::now();
        let row = MemberRow {
            id: Uuid::new_v4(),
            affiliate_id: Uuid::nil(),
            first_name: None,
            last_name: None,
            work_email: "jane@acme.com".into(),
            work_phone: None,
            employment_status: "furloughed".into(),
            user_id: None,
            created_at: now,
            updated_at: now,
        };

        let err = Member::try_from(row).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(ref m) if m.contains("furloughed")));
        assert!(!err.is_transient());
    }
}
