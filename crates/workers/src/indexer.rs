//! The indexer: expands user path lists into verified file lists and splits
//! work into sub-transactions.
//!
//! `index.init` splits the raw list into sub-transactions of at most L
//! paths. `index.start` walks each path depth-first, stats every file,
//! checks access as the requesting user and emits batches whenever the
//! count reaches L or the cumulative size crosses the byte threshold.

use crate::groups::GroupSource;
use async_trait::async_trait;
use nearline_core::config::IndexConfig;
use nearline_core::permissions::{check_permissions, Access};
use nearline_core::routing as rk;
use nearline_core::{PathDetails, PathType, RetrySchedule, State};
use nearline_fabric::{Inbound, ProcessError, Processor};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Handler for the index queue.
pub struct IndexerProcessor {
    config: IndexConfig,
    schedule: RetrySchedule,
    groups: Arc<dyn GroupSource>,
}

enum Outcome {
    Indexed(PathDetails),
    Failed(PathDetails),
    Retry(PathDetails),
}

struct WalkOutput {
    batches: Vec<Vec<PathDetails>>,
    failed: Vec<PathDetails>,
    retry: Vec<PathDetails>,
}

impl IndexerProcessor {
    pub fn new(config: IndexConfig, schedule: RetrySchedule, groups: Arc<dyn GroupSource>) -> Self {
        Self {
            config,
            schedule,
            groups,
        }
    }

    /// Split the raw list into ⌈N/L⌉ sub-transactions, each with a fresh
    /// sub_id, and re-emit them for walking.
    fn split(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let filelist = &inbound.message.data.filelist;
        if filelist.is_empty() {
            // nothing to do: the sub-transaction completes immediately
            return inbound
                .publisher
                .notify_monitor(inbound.key, inbound.message, State::Complete)
                .map_err(|e| ProcessError::Transient(e.to_string()));
        }
        for (index, chunk) in filelist.chunks(self.config.filelist_max_length).enumerate() {
            let child = inbound.message.split_child(index as u64, chunk.to_vec());
            let key = inbound.key.reply(rk::INDEX, rk::START);
            inbound
                .publisher
                .publish(&key, &child)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
            inbound
                .publisher
                .notify_monitor(inbound.key, &child, State::Splitting)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        // the parent sub ends here; the children carry the work forward
        inbound
            .publisher
            .notify_monitor(inbound.key, inbound.message, State::Complete)
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }

    async fn scan(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let ids = if self.config.check_permissions {
            match self.groups.resolve(&message.details.user) {
                Some(ids) => Some(ids),
                None => {
                    // the user cannot be resolved, so nothing can be verified
                    let mut failed = message.data.filelist.clone();
                    for pd in &mut failed {
                        pd.record_permanent_failure(
                            format!("permission denied: unknown user {}", message.details.user),
                            self.schedule.max_retries(),
                        );
                    }
                    return inbound
                        .publisher
                        .send_pathlist(
                            inbound.key,
                            message,
                            failed,
                            rk::INDEX,
                            rk::FAILED,
                            State::Failed,
                        )
                        .map_err(|e| ProcessError::Transient(e.to_string()));
                }
            }
        } else {
            None
        };

        let filelist = message.data.filelist.clone();
        let config = self.config.clone();
        let schedule = self.schedule.clone();
        let output = tokio::task::spawn_blocking(move || walk(filelist, &config, &schedule, ids))
            .await
            .map_err(|e| ProcessError::Fatal(format!("index walk panicked: {e}")))?;

        for batch in output.batches {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    batch,
                    rk::INDEX,
                    rk::COMPLETE,
                    State::Indexing,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        if !output.failed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    output.failed,
                    rk::INDEX,
                    rk::FAILED,
                    State::Failed,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        if !output.retry.is_empty() {
            let delay = output
                .retry
                .iter()
                .map(|pd| self.schedule.delay_for(pd.retries))
                .max()
                .unwrap_or_default();
            inbound
                .publisher
                .send_pathlist_delayed(
                    inbound.key,
                    message,
                    output.retry,
                    rk::INDEX,
                    rk::START,
                    State::Indexing,
                    delay,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for IndexerProcessor {
    fn name(&self) -> &'static str {
        "indexer"
    }

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError> {
        match inbound.key.state.as_str() {
            rk::INITIATE => self.split(&inbound),
            rk::START => {
                // an over-long list slipped through: split it again
                if inbound.message.data.filelist.len() > self.config.filelist_max_length {
                    self.split(&inbound)
                } else {
                    self.scan(&inbound).await
                }
            }
            other => Err(ProcessError::Protocol(format!(
                "unknown index state: {other}"
            ))),
        }
    }
}

/// The longest common ancestor of the batch's input paths, used to classify
/// symlink targets.
fn common_root(paths: &[PathBuf]) -> PathBuf {
    let mut iter = paths.iter();
    let Some(first) = iter.next() else {
        return PathBuf::from("/");
    };
    let mut root: Vec<Component<'_>> = first.components().collect();
    for path in iter {
        let components: Vec<Component<'_>> = path.components().collect();
        let shared = root
            .iter()
            .zip(components.iter())
            .take_while(|(a, b)| a == b)
            .count();
        root.truncate(shared);
    }
    let joined: PathBuf = root.iter().collect();
    if paths.len() == 1 || joined.as_os_str().is_empty() {
        first.parent().map(Path::to_path_buf).unwrap_or(joined)
    } else {
        joined
    }
}

fn walk(
    filelist: Vec<PathDetails>,
    config: &IndexConfig,
    schedule: &RetrySchedule,
    ids: Option<(u32, Vec<u32>)>,
) -> WalkOutput {
    let roots: Vec<PathBuf> = filelist
        .iter()
        .map(|pd| PathBuf::from(&pd.original_path))
        .collect();
    let batch_root = common_root(&roots);

    let mut output = WalkOutput {
        batches: Vec::new(),
        failed: Vec::new(),
        retry: Vec::new(),
    };
    let mut batch: Vec<PathDetails> = Vec::new();
    let mut batch_bytes: u64 = 0;

    let mut push = |outcome: Outcome, output: &mut WalkOutput| match outcome {
        Outcome::Indexed(pd) => {
            batch_bytes += pd.size.unwrap_or(0);
            batch.push(pd);
            if batch.len() >= config.filelist_max_length || batch_bytes >= config.message_threshold
            {
                output.batches.push(std::mem::take(&mut batch));
                batch_bytes = 0;
            }
        }
        Outcome::Failed(pd) => output.failed.push(pd),
        Outcome::Retry(pd) => output.retry.push(pd),
    };

    for pd in filelist {
        let path = PathBuf::from(&pd.original_path);
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_dir() => {
                for entry in WalkDir::new(&path).follow_links(false).min_depth(1) {
                    match entry {
                        Ok(entry) if entry.file_type().is_dir() => {}
                        Ok(entry) => {
                            let child = PathDetails::from_path(entry.path().to_string_lossy());
                            let outcome =
                                index_one(child, entry.path(), config, schedule, &ids, &batch_root);
                            push(outcome, &mut output);
                        }
                        Err(err) => {
                            let failed_path = err
                                .path()
                                .map(|p| p.to_string_lossy().into_owned())
                                .unwrap_or_else(|| pd.original_path.clone());
                            let mut child = PathDetails::from_path(failed_path);
                            classify_walk_error(&mut child, &err.to_string(), schedule);
                            let outcome = if schedule.exhausted(child.retries) {
                                Outcome::Failed(child)
                            } else {
                                Outcome::Retry(child)
                            };
                            push(outcome, &mut output);
                        }
                    }
                }
            }
            _ => {
                let outcome = index_one(pd, &path, config, schedule, &ids, &batch_root);
                push(outcome, &mut output);
            }
        }
    }

    if !batch.is_empty() {
        output.batches.push(batch);
    }
    output
}

/// Stat one path and classify it, per the error taxonomy: user mistakes are
/// permanent, filesystem trouble is retried.
fn index_one(
    mut pd: PathDetails,
    path: &Path,
    config: &IndexConfig,
    schedule: &RetrySchedule,
    ids: &Option<(u32, Vec<u32>)>,
    batch_root: &Path,
) -> Outcome {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            pd.record_permanent_failure("file not found", schedule.max_retries());
            return Outcome::Failed(pd);
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            pd.record_permanent_failure("permission denied", schedule.max_retries());
            return Outcome::Failed(pd);
        }
        Err(e) => {
            pd.record_retry(format!("stat failed: {e}"));
            return if schedule.exhausted(pd.retries) {
                Outcome::Failed(pd)
            } else {
                Outcome::Retry(pd)
            };
        }
    };

    pd.apply_metadata(&meta);

    if meta.file_type().is_symlink() {
        return classify_symlink(pd, path, batch_root, schedule);
    }
    if !meta.file_type().is_file() {
        pd.path_type = PathType::NotRecognised;
        pd.record_permanent_failure("path is of unknown type", schedule.max_retries());
        return Outcome::Failed(pd);
    }

    if let Some((uid, gids)) = ids {
        use std::os::unix::fs::MetadataExt;
        let readable = check_permissions(
            *uid,
            gids,
            Access::Read,
            meta.mode(),
            meta.uid(),
            meta.gid(),
        );
        if !readable {
            pd.record_permanent_failure("permission denied", schedule.max_retries());
            return Outcome::Failed(pd);
        }
    }

    if config.check_filesize && meta.len() > config.max_filesize {
        pd.record_permanent_failure(
            format!(
                "file too large: {} bytes exceeds the {} byte ceiling",
                meta.len(),
                config.max_filesize
            ),
            schedule.max_retries(),
        );
        return Outcome::Failed(pd);
    }

    Outcome::Indexed(pd)
}

fn classify_symlink(
    mut pd: PathDetails,
    path: &Path,
    batch_root: &Path,
    schedule: &RetrySchedule,
) -> Outcome {
    let target = match std::fs::read_link(path) {
        Ok(target) => target,
        Err(e) => {
            pd.record_retry(format!("readlink failed: {e}"));
            return if schedule.exhausted(pd.retries) {
                Outcome::Failed(pd)
            } else {
                Outcome::Retry(pd)
            };
        }
    };
    // resolve relative targets against the link's directory to test
    // containment, but record the target in its original shape
    let resolved = if target.is_absolute() {
        target.clone()
    } else {
        path.parent().unwrap_or(Path::new("/")).join(&target)
    };
    if normalize(&resolved).starts_with(batch_root) {
        pd.path_type = PathType::LinkCommon;
        pd.link_target = Some(target.to_string_lossy().into_owned());
    } else {
        pd.path_type = PathType::LinkAbsolute;
        pd.link_target = Some(normalize(&resolved).to_string_lossy().into_owned());
    }
    Outcome::Indexed(pd)
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn classify_walk_error(pd: &mut PathDetails, reason: &str, schedule: &RetrySchedule) {
    if reason.contains("No such file") {
        pd.record_permanent_failure("file not found", schedule.max_retries());
    } else if reason.contains("Permission denied") {
        pd.record_permanent_failure("permission denied", schedule.max_retries());
    } else {
        pd.record_retry(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    fn test_config() -> IndexConfig {
        IndexConfig {
            check_permissions: false,
            ..IndexConfig::default()
        }
    }

    fn paths(list: &[&Path]) -> Vec<PathDetails> {
        list.iter()
            .map(|p| PathDetails::from_path(p.to_string_lossy()))
            .collect()
    }

    #[test]
    fn walk_indexes_files_and_recurses_directories() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join("sub/b.txt"), b"body").unwrap();

        let input = paths(&[temp.path()]);
        let output = walk(input, &test_config(), &RetrySchedule::default(), None);

        assert!(output.failed.is_empty());
        assert!(output.retry.is_empty());
        let all: Vec<&PathDetails> = output.batches.iter().flatten().collect();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|pd| pd.path_type == PathType::File));
        assert!(all.iter().any(|pd| pd.size == Some(10)));
    }

    #[test]
    fn missing_path_fails_without_retry() {
        let temp = tempfile::tempdir().unwrap();
        let schedule = RetrySchedule::default();
        let input = paths(&[&temp.path().join("nope.txt")]);
        let output = walk(input, &test_config(), &schedule, None);

        assert_eq!(output.failed.len(), 1);
        let pd = &output.failed[0];
        assert_eq!(pd.last_failure_reason(), Some("file not found"));
        assert!(schedule.exhausted(pd.retries));
    }

    #[test]
    fn oversized_file_fails_with_reason() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("big.bin"), vec![0u8; 2048]).unwrap();
        let config = IndexConfig {
            max_filesize: 1024,
            check_permissions: false,
            ..IndexConfig::default()
        };
        let input = paths(&[&temp.path().join("big.bin")]);
        let output = walk(input, &config, &RetrySchedule::default(), None);

        assert_eq!(output.failed.len(), 1);
        assert!(output.failed[0]
            .last_failure_reason()
            .unwrap()
            .starts_with("file too large"));
    }

    #[test]
    fn filesize_check_can_be_disabled() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("big.bin"), vec![0u8; 2048]).unwrap();
        let config = IndexConfig {
            max_filesize: 1024,
            check_filesize: false,
            check_permissions: false,
            ..IndexConfig::default()
        };
        let input = paths(&[&temp.path().join("big.bin")]);
        let output = walk(input, &config, &RetrySchedule::default(), None);
        assert!(output.failed.is_empty());
    }

    #[test]
    fn symlink_inside_batch_root_is_link_common() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("target.txt"), b"x").unwrap();
        symlink("target.txt", temp.path().join("link")).unwrap();

        let input = paths(&[temp.path()]);
        let output = walk(input, &test_config(), &RetrySchedule::default(), None);

        let link = output
            .batches
            .iter()
            .flatten()
            .find(|pd| pd.path_type.is_link())
            .expect("link indexed");
        assert_eq!(link.path_type, PathType::LinkCommon);
        assert_eq!(link.link_target.as_deref(), Some("target.txt"));
    }

    #[test]
    fn symlink_outside_batch_root_is_link_absolute() {
        let temp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("elsewhere.txt"), b"x").unwrap();
        symlink(
            outside.path().join("elsewhere.txt"),
            temp.path().join("link"),
        )
        .unwrap();

        let input = paths(&[temp.path()]);
        let output = walk(input, &test_config(), &RetrySchedule::default(), None);

        let link = output
            .batches
            .iter()
            .flatten()
            .find(|pd| pd.path_type.is_link())
            .expect("link indexed");
        assert_eq!(link.path_type, PathType::LinkAbsolute);
        assert!(Path::new(link.link_target.as_deref().unwrap()).is_absolute());
    }

    #[test]
    fn batches_split_at_the_length_threshold() {
        let temp = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(temp.path().join(format!("f{i}")), b"x").unwrap();
        }
        let config = IndexConfig {
            filelist_max_length: 2,
            check_permissions: false,
            ..IndexConfig::default()
        };
        let input = paths(&[temp.path()]);
        let output = walk(input, &config, &RetrySchedule::default(), None);

        assert_eq!(output.batches.len(), 3);
        assert!(output.batches.iter().take(2).all(|b| b.len() == 2));
        assert_eq!(output.batches[2].len(), 1);
    }

    #[test]
    fn batches_split_at_the_byte_threshold() {
        let temp = tempfile::tempdir().unwrap();
        for i in 0..4 {
            fs::write(temp.path().join(format!("f{i}")), vec![0u8; 600]).unwrap();
        }
        let config = IndexConfig {
            message_threshold: 1000,
            check_permissions: false,
            ..IndexConfig::default()
        };
        let input = paths(&[temp.path()]);
        let output = walk(input, &config, &RetrySchedule::default(), None);

        // each pair of 600-byte files crosses the 1000-byte threshold
        assert_eq!(output.batches.len(), 2);
    }

    #[test]
    fn permission_check_uses_requesting_ids() {
        use std::os::unix::fs::MetadataExt;
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("private.txt");
        fs::write(&file, b"secret").unwrap();
        let meta = fs::metadata(&file).unwrap();

        let config = IndexConfig::default();
        // ids that are definitely not the file's owner or group
        let foreign = Some((meta.uid() + 1, vec![meta.gid() + 1]));
        let mut perms = fs::metadata(&file).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o600);
        fs::set_permissions(&file, perms).unwrap();

        let output = walk(
            paths(&[&file]),
            &config,
            &RetrySchedule::default(),
            foreign,
        );
        assert_eq!(output.failed.len(), 1);
        assert_eq!(
            output.failed[0].last_failure_reason(),
            Some("permission denied")
        );
    }

    #[test]
    fn common_root_of_sibling_paths() {
        let root = common_root(&[
            PathBuf::from("/gws/proc/run1/a.nc"),
            PathBuf::from("/gws/proc/run2/b.nc"),
        ]);
        assert_eq!(root, PathBuf::from("/gws/proc"));

        let single = common_root(&[PathBuf::from("/gws/proc/run1")]);
        assert_eq!(single, PathBuf::from("/gws/proc"));
    }
}
