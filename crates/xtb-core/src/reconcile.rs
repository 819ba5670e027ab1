//! Find-or-create the shared group and make sure the administrator is a
//! super-admin of it.
//!
//! Only listing and creating the group can fail the reconciliation. Anything
//! that goes wrong with the administrator afterwards is logged and reported in
//! [`AdminOutcome`]; the group is still returned and used.

use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    config::{ADMIN_IDENTITY, GROUP_DESCRIPTION, GROUP_IMAGE_URL, GROUP_NAME},
    domain::{find_member, Identity, Member, Role},
    ports::{GroupConversation, GroupOptions, TransportClient},
    Result,
};

/// What the shared group should look like.
#[derive(Clone, Debug)]
pub struct GroupSpec {
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub admin: Identity,
}

impl Default for GroupSpec {
    fn default() -> Self {
        Self {
            name: GROUP_NAME.to_string(),
            description: GROUP_DESCRIPTION.to_string(),
            image_url: GROUP_IMAGE_URL.to_string(),
            admin: Identity::parse(ADMIN_IDENTITY),
        }
    }
}

/// What happened to the administrator during reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminOutcome {
    /// Already a super-admin; nothing to do.
    AlreadySuperAdmin,
    Promoted { freshly_added: bool },
    PromotionFailed { freshly_added: bool, reason: String },
    /// Added, but still not listed after the settling delay.
    MissingAfterAdd,
    AddFailed { reason: String },
    MembershipUnavailable { reason: String },
}

impl AdminOutcome {
    pub fn is_super_admin(&self) -> bool {
        matches!(
            self,
            AdminOutcome::AlreadySuperAdmin | AdminOutcome::Promoted { .. }
        )
    }
}

pub struct Reconciliation {
    pub group: Arc<dyn GroupConversation>,
    pub created: bool,
    pub admin: AdminOutcome,
}

/// Ensure the shared group exists and the administrator is a super-admin.
///
/// Safe to run on every process start: an existing group with the configured
/// name is reused. When several groups share the name the first listed one
/// wins; that ambiguity is logged, not resolved.
pub async fn ensure_group(
    client: &dyn TransportClient,
    target: &GroupSpec,
    settle_delay: Duration,
) -> Result<Reconciliation> {
    let groups = client.list_groups().await?;
    let mut matching = groups.into_iter().filter(|g| g.name() == target.name);

    let (group, created) = match matching.next() {
        Some(existing) => {
            let extra = matching.count();
            if extra > 0 {
                warn!(
                    name = %target.name,
                    duplicates = extra + 1,
                    chosen = %existing.id(),
                    "multiple groups share the target name; using the first listed"
                );
            }
            info!(group_id = %existing.id(), "found existing group");
            (existing, false)
        }
        None => {
            info!(name = %target.name, "creating group");
            let group = client
                .new_group(
                    &[],
                    GroupOptions {
                        name: target.name.clone(),
                        description: target.description.clone(),
                        image_url: target.image_url.clone(),
                    },
                )
                .await?;
            info!(group_id = %group.id(), "group created");
            (group, true)
        }
    };

    let admin = ensure_admin(group.as_ref(), &target.admin, settle_delay).await;
    Ok(Reconciliation {
        group,
        created,
        admin,
    })
}

async fn ensure_admin(
    group: &dyn GroupConversation,
    admin: &Identity,
    settle_delay: Duration,
) -> AdminOutcome {
    let members = match group.members().await {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "could not read group membership; admin not verified");
            return AdminOutcome::MembershipUnavailable {
                reason: e.to_string(),
            };
        }
    };

    let (member, freshly_added) = match find_member(&members, admin).cloned() {
        Some(m) => (m, false),
        None => match add_and_verify(group, admin, settle_delay).await {
            Ok(m) => (m, true),
            Err(outcome) => return outcome,
        },
    };

    if member.role == Role::SuperAdmin {
        info!(admin = %admin, "admin is already a super-admin");
        return AdminOutcome::AlreadySuperAdmin;
    }

    match group.add_super_admin(&member.inbox_id).await {
        Ok(()) => {
            info!(admin = %admin, inbox_id = %member.inbox_id, "promoted admin to super-admin");
            AdminOutcome::Promoted { freshly_added }
        }
        Err(e) => {
            if freshly_added {
                error!(admin = %admin, error = %e, "failed to promote freshly added admin");
            } else {
                warn!(admin = %admin, error = %e, "promotion failed for existing member; continuing");
            }
            AdminOutcome::PromotionFailed {
                freshly_added,
                reason: e.to_string(),
            }
        }
    }
}

async fn add_and_verify(
    group: &dyn GroupConversation,
    admin: &Identity,
    settle_delay: Duration,
) -> std::result::Result<Member, AdminOutcome> {
    info!(admin = %admin, "adding admin to group");
    if let Err(e) = group.add_members(std::slice::from_ref(admin)).await {
        error!(admin = %admin, error = %e, "failed to add admin");
        return Err(AdminOutcome::AddFailed {
            reason: e.to_string(),
        });
    }

    // Membership changes propagate asynchronously.
    sleep(settle_delay).await;

    let members = group.members().await.map_err(|e| {
        error!(error = %e, "could not re-read membership after adding admin");
        AdminOutcome::MembershipUnavailable {
            reason: e.to_string(),
        }
    })?;

    find_member(&members, admin).cloned().ok_or_else(|| {
        warn!(admin = %admin, "could not find admin after adding; not promoted");
        AdminOutcome::MissingAfterAdd
    })
}
