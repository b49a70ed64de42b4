//! User provisioning for imported members.
//!
//! Each member gets at most one user. An existing account with the member's
//! email is linked rather than duplicated; otherwise an invited account is
//! created with an invite token as its only credential.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{RowError, RowResult, StoreError};
use crate::models::{CleanedRow, Member, NewUser, User};
use crate::retry::RetryPolicy;
use crate::store::{MemberRepository, UserRepository};

/// How the member ended up with its user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    /// The member was already linked; nothing changed.
    AlreadyLinked,
    /// An existing unlinked account was linked to the member.
    Linked,
    /// A new invited account was created and linked.
    Created,
}

#[derive(Debug, Clone)]
pub struct UserLink {
    pub user: User,
    pub outcome: UserOutcome,
}

impl UserLink {
    pub fn was_created(&self) -> bool {
        self.outcome == UserOutcome::Created
    }
}

#[derive(Clone)]
pub struct UserImportService {
    users: Arc<dyn UserRepository>,
    members: Arc<dyn MemberRepository>,
    retry: RetryPolicy,
}

impl UserImportService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        members: Arc<dyn MemberRepository>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            users,
            members,
            retry,
        }
    }

    /// Return the member's user, linking or creating one when needed.
    pub async fn create_or_link_user(
        &self,
        member: &Member,
        row: &CleanedRow,
    ) -> RowResult<UserLink> {
        let users = self.users.as_ref();

        if let Some(user_id) = member.user_id {
            let existing = self.retry.run(move || users.find_by_id(user_id)).await?;
            match existing {
                Some(user) => {
                    return Ok(UserLink {
                        user,
                        outcome: UserOutcome::AlreadyLinked,
                    })
                }
                None => tracing::warn!(
                    member_id = %member.id,
                    %user_id,
                    "member links to a missing user, provisioning again"
                ),
            }
        }

        let email = member.work_email.as_str();
        let existing = self.retry.run(move || users.find_by_email(email)).await?;
        if let Some(user) = existing {
            self.link(member, &user).await?;
            return Ok(UserLink {
                user,
                outcome: UserOutcome::Linked,
            });
        }

        let new_user = NewUser {
            email: member.work_email.clone(),
            first_name: row.first_name.clone().or_else(|| member.first_name.clone()),
            last_name: row.last_name.clone().or_else(|| member.last_name.clone()),
            invite_token: Uuid::new_v4().simple().to_string(),
        };
        let new_ref = &new_user;
        match self.retry.run(move || users.insert(new_ref)).await {
            Ok(user) => {
                self.link(member, &user).await?;
                tracing::debug!(member_id = %member.id, user_id = %user.id, "created invited user");
                Ok(UserLink {
                    user,
                    outcome: UserOutcome::Created,
                })
            }
            Err(StoreError::UniqueViolation { .. }) => {
                // Someone created the account between our lookup and insert.
                let user = self
                    .retry
                    .run(move || users.find_by_email(email))
                    .await?
                    .ok_or_else(|| RowError::DuplicateEmail {
                        email: member.work_email.clone(),
                    })?;
                self.link(member, &user).await?;
                Ok(UserLink {
                    user,
                    outcome: UserOutcome::Linked,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Point `member.user_id` at `user`, refusing to steal a user that is
    /// already linked to another member.
    async fn link(&self, member: &Member, user: &User) -> RowResult<()> {
        let members = self.members.as_ref();
        let user_id = user.id;

        let owner = self.retry.run(move || members.find_by_user(user_id)).await?;
        if let Some(owner) = owner {
            if owner.id != member.id {
                return Err(RowError::DuplicateEmail {
                    email: user.email.clone(),
                });
            }
            return Ok(());
        }

        let mut linked = member.clone();
        linked.user_id = Some(user_id);
        let linked_ref = &linked;
        match self.retry.run(move || members.update(linked_ref)).await {
            Ok(_) => Ok(()),
            Err(StoreError::UniqueViolation { .. }) => Err(RowError::DuplicateEmail {
                email: user.email.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}
