//! Authentication and authorisation capability.
//!
//! Site-specific account systems implement this trait; the catalog worker
//! only ever sees the capability. The default backend grants every group
//! membership and reports the "user" role.

use async_trait::async_trait;

/// A caller's role within a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Deputy,
    Manager,
}

impl Role {
    /// Deputies and managers may delete files they do not own.
    pub fn may_delete_others_files(self) -> bool {
        matches!(self, Role::Deputy | Role::Manager)
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Whether `user` is a member of `group`.
    async fn authenticate_group(&self, user: &str, group: &str) -> bool;

    /// Whether `user` may operate on a holding owned by `(owner, group)`.
    async fn authenticate_collection(&self, user: &str, owner: &str, group: &str) -> bool;

    /// The caller's role within a group.
    async fn role_of(&self, user: &str, group: &str) -> Role;

    /// The uid this username maps to, if the backend knows one. Used for
    /// ownership comparison on delete; `None` means ownership cannot be
    /// established and the file is treated as the caller's own.
    async fn uid_of(&self, user: &str) -> Option<u32>;
}

/// The default backend: everyone is a plain user and every membership check
/// passes.
pub struct PermissiveAuthenticator;

#[async_trait]
impl Authenticator for PermissiveAuthenticator {
    async fn authenticate_group(&self, _user: &str, _group: &str) -> bool {
        true
    }

    async fn authenticate_collection(&self, _user: &str, _owner: &str, _group: &str) -> bool {
        true
    }

    async fn role_of(&self, _user: &str, _group: &str) -> Role {
        Role::User
    }

    async fn uid_of(&self, _user: &str) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_delete_rights() {
        assert!(!Role::User.may_delete_others_files());
        assert!(Role::Deputy.may_delete_others_files());
        assert!(Role::Manager.may_delete_others_files());
    }

    #[tokio::test]
    async fn permissive_backend_defaults() {
        let auth = PermissiveAuthenticator;
        assert!(auth.authenticate_group("anyone", "anygroup").await);
        assert_eq!(auth.role_of("anyone", "anygroup").await, Role::User);
        assert!(auth.uid_of("anyone").await.is_none());
    }
}
