//! Per-row persistence services.
//!
//! Each service owns one step of a row's import and receives its
//! repositories as trait objects:
//!
//! - [`member`] - member upsert keyed by `(affiliate_id, work_email)`
//! - [`user`] - link-or-create of the member's login account
//! - [`role`] - additive default role grants

pub mod member;
pub mod role;
pub mod user;

pub use member::{MemberOutcome, MemberService, MemberUpsert, MAX_CONFLICT_ATTEMPTS};
pub use role::{RoleAssignmentService, RoleGrant, RoleMap};
pub use user::{UserImportService, UserLink, UserOutcome};
