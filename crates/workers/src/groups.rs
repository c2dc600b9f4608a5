//! Resolution of a requesting user's uid and gid set.
//!
//! The indexer checks access as the requesting user, using the uid and the
//! union of primary and supplementary gids. Resolution is an injected
//! capability so deployments can plug in their account system and tests can
//! run unprivileged.

use std::collections::HashMap;
use std::path::Path;

/// Maps a username to `(uid, gids)`.
pub trait GroupSource: Send + Sync + 'static {
    fn resolve(&self, user: &str) -> Option<(u32, Vec<u32>)>;
}

/// Resolution against the host's passwd and group files.
pub struct EtcGroupSource {
    passwd_path: std::path::PathBuf,
    group_path: std::path::PathBuf,
}

impl EtcGroupSource {
    pub fn new() -> Self {
        Self {
            passwd_path: "/etc/passwd".into(),
            group_path: "/etc/group".into(),
        }
    }

    pub fn with_files(passwd_path: impl AsRef<Path>, group_path: impl AsRef<Path>) -> Self {
        Self {
            passwd_path: passwd_path.as_ref().to_path_buf(),
            group_path: group_path.as_ref().to_path_buf(),
        }
    }
}

impl Default for EtcGroupSource {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupSource for EtcGroupSource {
    fn resolve(&self, user: &str) -> Option<(u32, Vec<u32>)> {
        let passwd = std::fs::read_to_string(&self.passwd_path).ok()?;
        let (uid, primary_gid) = passwd.lines().find_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            if name != user {
                return None;
            }
            let _password = fields.next()?;
            let uid = fields.next()?.parse::<u32>().ok()?;
            let gid = fields.next()?.parse::<u32>().ok()?;
            Some((uid, gid))
        })?;

        let mut gids = vec![primary_gid];
        if let Ok(groups) = std::fs::read_to_string(&self.group_path) {
            for line in groups.lines() {
                let mut fields = line.split(':');
                let _name = fields.next();
                let _password = fields.next();
                let Some(gid) = fields.next().and_then(|g| g.parse::<u32>().ok()) else {
                    continue;
                };
                let members = fields.next().unwrap_or("");
                if members.split(',').any(|m| m == user) && !gids.contains(&gid) {
                    gids.push(gid);
                }
            }
        }
        Some((uid, gids))
    }
}

/// Fixed mapping, for configuration-driven deployments and tests.
pub struct StaticGroupSource {
    entries: HashMap<String, (u32, Vec<u32>)>,
}

impl StaticGroupSource {
    pub fn new(entries: HashMap<String, (u32, Vec<u32>)>) -> Self {
        Self { entries }
    }

    pub fn single(user: impl Into<String>, uid: u32, gids: Vec<u32>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(user.into(), (uid, gids));
        Self { entries }
    }
}

impl GroupSource for StaticGroupSource {
    fn resolve(&self, user: &str) -> Option<(u32, Vec<u32>)> {
        self.entries.get(user).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn etc_source_reads_uid_and_supplementary_gids() {
        let temp = tempfile::tempdir().unwrap();
        let passwd_path = temp.path().join("passwd");
        let group_path = temp.path().join("group");
        let mut passwd = std::fs::File::create(&passwd_path).unwrap();
        writeln!(passwd, "root:x:0:0:root:/root:/bin/bash").unwrap();
        writeln!(passwd, "alice:x:1000:100:Alice:/home/alice:/bin/bash").unwrap();
        let mut group = std::fs::File::create(&group_path).unwrap();
        writeln!(group, "users:x:100:").unwrap();
        writeln!(group, "climate:x:2000:alice,bob").unwrap();
        writeln!(group, "ops:x:3000:bob").unwrap();

        let source = EtcGroupSource::with_files(&passwd_path, &group_path);
        let (uid, gids) = source.resolve("alice").unwrap();
        assert_eq!(uid, 1000);
        assert_eq!(gids, vec![100, 2000]);
        assert!(source.resolve("mallory").is_none());
    }

    #[test]
    fn static_source_round_trips() {
        let source = StaticGroupSource::single("alice", 1000, vec![100]);
        assert_eq!(source.resolve("alice"), Some((1000, vec![100])));
        assert_eq!(source.resolve("bob"), None);
    }
}
