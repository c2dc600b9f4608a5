//! Unix permission checks against stat results.
//!
//! The indexer verifies access on behalf of the requesting user, using the
//! user's uid and the union of primary and supplementary gids.

/// The access being requested, as the `other`-class permission bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read = 4,
    Write = 2,
    Execute = 1,
}

/// Check whether `(uid, gids)` may access a file with the given ownership
/// and permission bits. The owner class applies when the uid matches, the
/// group class when any gid matches, the other class otherwise.
pub fn check_permissions(
    uid: u32,
    gids: &[u32],
    access: Access,
    mode: u32,
    file_uid: u32,
    file_gid: u32,
) -> bool {
    let access = access as u32;
    let mode = mode & 0o777;
    if uid == file_uid {
        // owner bits are the access bit shifted two octal places
        (access * 0o100) & mode != 0
    } else if gids.contains(&file_gid) {
        (access * 0o10) & mode != 0
    } else {
        access & mode != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_read() {
        assert!(check_permissions(1000, &[100], Access::Read, 0o400, 1000, 100));
        assert!(!check_permissions(1000, &[100], Access::Write, 0o400, 1000, 100));
    }

    #[test]
    fn group_read_via_supplementary_gid() {
        // uid differs, gid 200 is in the caller's supplementary set
        assert!(check_permissions(1000, &[100, 200], Access::Read, 0o040, 2000, 200));
        assert!(!check_permissions(1000, &[100], Access::Read, 0o040, 2000, 200));
    }

    #[test]
    fn other_read() {
        assert!(check_permissions(1000, &[100], Access::Read, 0o004, 2000, 200));
        assert!(!check_permissions(1000, &[100], Access::Read, 0o040, 2000, 200));
    }

    #[test]
    fn owner_match_ignores_group_bits() {
        // owner takes precedence: uid matches but owner class denies read,
        // even though the group class would allow it
        assert!(!check_permissions(1000, &[200], Access::Read, 0o040, 1000, 200));
    }
}
