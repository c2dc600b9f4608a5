//! The catalog worker: every `catalog-*` operation, serialised through the
//! single-consumer catalog queue.

use crate::auth::Authenticator;
use crate::error::CatalogError;
use crate::models::{path_details_from_rows, FileRow, LocationRow};
use crate::store::{CatalogStore, FileQuery};
use async_trait::async_trait;
use nearline_core::config::CatalogConfig;
use nearline_core::routing as rk;
use nearline_core::{ApiAction, Details, PathDetails, RetrySchedule, State, StorageType};
use nearline_fabric::{Inbound, ProcessError, Processor};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Stateless handler for the catalog queue.
pub struct CatalogProcessor {
    store: Arc<dyn CatalogStore>,
    config: CatalogConfig,
    auth: Arc<dyn Authenticator>,
    schedule: RetrySchedule,
}

impl CatalogProcessor {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        config: CatalogConfig,
        auth: Arc<dyn Authenticator>,
        schedule: RetrySchedule,
    ) -> Self {
        Self {
            store,
            config,
            auth,
            schedule,
        }
    }

    fn tenancy(&self, details: &Details) -> Result<String, ProcessError> {
        details
            .tenancy
            .clone()
            .or_else(|| self.config.default_tenancy.clone())
            .ok_or_else(|| {
                ProcessError::Protocol("no tenancy in message or configuration".to_string())
            })
    }

    /// Build the file query a message implies, optionally narrowed to one
    /// original path.
    fn file_query(details: &Details, original_path: Option<&str>) -> FileQuery {
        FileQuery {
            original_path: original_path.map(str::to_string),
            transaction_id: None,
            holding_id: details.holding_id,
            holding_label: details.holding_label.clone(),
            tags: details
                .tags
                .as_ref()
                .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        }
    }

    fn map_db_error(e: CatalogError) -> ProcessError {
        if e.is_transient() {
            ProcessError::Transient(e.to_string())
        } else {
            ProcessError::Protocol(e.to_string())
        }
    }

    // ----- put workflow -------------------------------------------------

    /// Create the holding/transaction scaffolding and a provisional file row
    /// per path. Duplicate `(holding, original_path)` pairs fail without
    /// retry.
    async fn catalog_put(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        let label = details
            .holding_label
            .clone()
            .unwrap_or_else(|| details.transaction_id.to_string());

        let holding = match details.holding_id {
            Some(id) => self
                .store
                .get_holding_by_id(&details.user, &details.group, id)
                .await
                .map_err(Self::map_db_error)?
                .ok_or_else(|| ProcessError::Protocol(format!("holding {id} not found")))?,
            None => match self
                .store
                .get_holding_by_label(&details.user, &details.group, &label)
                .await
                .map_err(Self::map_db_error)?
            {
                Some(holding) => holding,
                None => self
                    .store
                    .create_holding(&details.user, &details.group, &label)
                    .await
                    .map_err(Self::map_db_error)?,
            },
        };

        if let Some(tags) = &details.tags {
            let existing = self
                .store
                .get_tags(holding.id)
                .await
                .map_err(Self::map_db_error)?;
            for (key, value) in tags {
                if !existing.iter().any(|t| &t.key == key) {
                    self.store
                        .create_tag(holding.id, key, value)
                        .await
                        .map_err(Self::map_db_error)?;
                }
            }
        }

        let transaction_id = details.transaction_id.to_string();
        let txn = match self
            .store
            .get_transaction(&transaction_id)
            .await
            .map_err(Self::map_db_error)?
        {
            Some(txn) => txn,
            None => self
                .store
                .create_transaction(holding.id, &transaction_id)
                .await
                .map_err(Self::map_db_error)?,
        };

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for mut pd in message.data.filelist.clone() {
            // a replayed delivery finds its own rows: already done
            let replayed = self
                .store
                .file_exists_in_transaction(txn.id, &pd.original_path)
                .await
                .map_err(Self::map_db_error)?;
            if replayed {
                completed.push(pd);
                continue;
            }
            let duplicate = self
                .store
                .file_exists_in_holding(holding.id, &pd.original_path)
                .await
                .map_err(Self::map_db_error)?;
            if duplicate {
                pd.record_permanent_failure(
                    format!("file already exists in holding {}", holding.label),
                    self.schedule.max_retries(),
                );
                failed.push(pd);
                continue;
            }
            self.store
                .create_file(txn.id, &pd)
                .await
                .map_err(Self::map_db_error)?;
            completed.push(pd);
        }

        if !completed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    completed,
                    rk::CATALOG_PUT,
                    rk::COMPLETE,
                    State::CatalogPutting,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        if !failed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    failed,
                    rk::CATALOG_PUT,
                    rk::FAILED,
                    State::Failed,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    /// Attach the OBJECT_STORE location each transferred file reports.
    /// Replays are no-ops: an existing identical location counts as done.
    async fn catalog_update(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        let now = OffsetDateTime::now_utc();

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for mut pd in message.data.filelist.clone() {
            let Some(os_loc) = pd.object_store_location().cloned() else {
                pd.record_permanent_failure(
                    "no object store location on transferred file",
                    self.schedule.max_retries(),
                );
                failed.push(pd);
                continue;
            };
            // a put updates its own transaction's rows; a recalled get
            // resolves by path, since the rows belong to the original put
            let query = if details.api_action.is_get() {
                Self::file_query(details, Some(&pd.original_path))
            } else {
                FileQuery {
                    transaction_id: Some(details.transaction_id.to_string()),
                    original_path: Some(pd.original_path.clone()),
                    ..FileQuery::default()
                }
            };
            let files = self
                .store
                .get_files(&details.user, &details.group, &query)
                .await
                .map_err(Self::map_db_error)?;
            let Some(file) = files.first() else {
                pd.record_permanent_failure("file not found in catalog", self.schedule.max_retries());
                failed.push(pd);
                continue;
            };
            match self
                .store
                .create_location(
                    file.id,
                    StorageType::ObjectStore,
                    &os_loc.url_scheme,
                    &os_loc.url_netloc,
                    &os_loc.root,
                    &os_loc.path,
                    now,
                    None,
                )
                .await
            {
                Ok(_) => completed.push(pd),
                Err(CatalogError::AlreadyExists(_)) => {
                    // replayed message or a filled recall marker
                    let existing = self
                        .store
                        .get_location(file.id, StorageType::ObjectStore)
                        .await
                        .map_err(Self::map_db_error)?;
                    if let Some(existing) = existing {
                        if existing.is_empty_marker() {
                            self.store
                                .fill_location(existing.id, &os_loc.path, now, None)
                                .await
                                .map_err(Self::map_db_error)?;
                        }
                    }
                    completed.push(pd);
                }
                Err(e) => return Err(Self::map_db_error(e)),
            }
        }

        if !completed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    completed,
                    rk::CATALOG_UPDATE,
                    rk::COMPLETE,
                    State::Cataloging,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        if !failed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    failed,
                    rk::CATALOG_UPDATE,
                    rk::FAILED,
                    State::Failed,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    // ----- get workflow -------------------------------------------------

    /// Resolve each requested file to a storage tier. Warm files go to the
    /// transfer list; tape-only files get an empty OBJECT_STORE marker and
    /// one archive-restore message per owning aggregation.
    async fn catalog_get(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        let tenancy = self.tenancy(details)?;

        if !self
            .auth
            .authenticate_group(&details.user, &details.group)
            .await
        {
            return Err(ProcessError::Protocol(format!(
                "user {} is not a member of group {}",
                details.user, details.group
            )));
        }

        let mut completed: Vec<PathDetails> = Vec::new();
        let mut failed: Vec<PathDetails> = Vec::new();
        // aggregation → members to recall
        let mut to_recall: HashMap<i64, (crate::models::AggregationRow, Vec<PathDetails>)> =
            HashMap::new();

        for mut pd in message.data.filelist.clone() {
            let query = Self::file_query(details, Some(&pd.original_path));
            let files = self
                .store
                .get_files(&details.user, &details.group, &query)
                .await
                .map_err(Self::map_db_error)?;
            let Some(file) = files.first() else {
                pd.record_permanent_failure(
                    format!("could not find file with original path {}", pd.original_path),
                    self.schedule.max_retries(),
                );
                failed.push(pd);
                continue;
            };
            let locations = self
                .store
                .get_file_locations(file.id)
                .await
                .map_err(Self::map_db_error)?;
            let os_loc = locations
                .iter()
                .find(|l| l.storage_type == StorageType::ObjectStore.as_str());
            let tape_loc = locations
                .iter()
                .find(|l| l.storage_type == StorageType::Tape.as_str());

            match (os_loc, tape_loc) {
                (Some(os), _) if !os.is_empty_marker() => {
                    let new_pd = path_details_from_rows(file, &locations)
                        .map_err(|e| ProcessError::Protocol(e.to_string()))?;
                    completed.push(new_pd);
                }
                (Some(_), _) => {
                    // an empty marker means another get already scheduled the
                    // recall for this aggregation
                    pd.record_permanent_failure(
                        "recall already in progress",
                        self.schedule.max_retries(),
                    );
                    failed.push(pd);
                }
                (None, Some(tape)) => {
                    let Some(agg_id) = tape.aggregation_id else {
                        pd.record_permanent_failure(
                            "tape location has no aggregation",
                            self.schedule.max_retries(),
                        );
                        failed.push(pd);
                        continue;
                    };
                    if to_recall.contains_key(&agg_id) {
                        continue;
                    }
                    let aggregation = self
                        .store
                        .get_aggregation(agg_id)
                        .await
                        .map_err(Self::map_db_error)?
                        .ok_or_else(|| {
                            ProcessError::Protocol(format!("aggregation {agg_id} missing"))
                        })?;
                    let members = self.recall_members(agg_id, tape, &tenancy).await?;
                    to_recall.insert(agg_id, (aggregation, members));
                }
                (None, None) => {
                    pd.record_permanent_failure("no location", self.schedule.max_retries());
                    failed.push(pd);
                }
            }
        }

        if !completed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    completed,
                    rk::CATALOG_GET,
                    rk::COMPLETE,
                    State::CatalogGetting,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        for (agg_id, (aggregation, members)) in to_recall {
            if members.is_empty() {
                continue;
            }
            let mut restore = message.reply_with(members);
            restore.data.aggregation_id = Some(agg_id);
            restore.data.tarfile = Some(aggregation.tarname);
            // the stored checksum travels along so the recall can verify
            restore.data.checksum = aggregation
                .checksum
                .as_deref()
                .and_then(|c| u32::from_str_radix(c, 16).ok());
            restore.data.checksum_algorithm = aggregation.algorithm.clone();
            let key = inbound.key.reply(rk::CATALOG_GET, rk::ARCHIVE_RESTORE);
            inbound
                .publisher
                .publish(&key, &restore)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
            inbound
                .publisher
                .notify_monitor(inbound.key, &restore, State::CatalogGetting)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        if !failed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    failed,
                    rk::CATALOG_GET,
                    rk::FAILED,
                    State::Failed,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    /// Create empty OBJECT_STORE markers for the files to be recalled from
    /// one aggregation and return their PathDetails. In full-unpack mode the
    /// whole aggregation is recalled so one tape mount serves every member.
    async fn recall_members(
        &self,
        aggregation_id: i64,
        requested_tape_loc: &LocationRow,
        tenancy: &str,
    ) -> Result<Vec<PathDetails>, ProcessError> {
        let member_locations = if self.config.full_unpack {
            self.store
                .aggregation_members(aggregation_id)
                .await
                .map_err(Self::map_db_error)?
        } else {
            vec![requested_tape_loc.clone()]
        };

        let mut members = Vec::new();
        for tape_loc in &member_locations {
            let file = self
                .file_of_location(tape_loc)
                .await
                .map_err(Self::map_db_error)?;
            let existing = self
                .store
                .get_location(file.id, StorageType::ObjectStore)
                .await
                .map_err(Self::map_db_error)?;
            if existing.is_some() {
                // already warm or already being recalled
                continue;
            }
            let txn = self
                .store
                .file_transaction(file.id)
                .await
                .map_err(Self::map_db_error)?;
            let marker = self
                .store
                .create_location(
                    file.id,
                    StorageType::ObjectStore,
                    "https",
                    tenancy,
                    &txn.transaction_id,
                    "",
                    tape_loc.access_time,
                    None,
                )
                .await;
            match marker {
                Ok(_) => {}
                // raced with a concurrent get: that one owns the recall
                Err(CatalogError::AlreadyExists(_)) => continue,
                Err(e) => return Err(Self::map_db_error(e)),
            }
            let locations = self
                .store
                .get_file_locations(file.id)
                .await
                .map_err(Self::map_db_error)?;
            let pd = path_details_from_rows(&file, &locations)
                .map_err(|e| ProcessError::Protocol(e.to_string()))?;
            members.push(pd);
        }
        Ok(members)
    }

    async fn file_of_location(&self, location: &LocationRow) -> Result<FileRow, CatalogError> {
        let txn = self.store.file_transaction(location.file_id).await?;
        let holding = self.store.holding_of_transaction(txn.id).await?;
        let files = self
            .store
            .get_files(
                &holding.user_name,
                &holding.group_name,
                &FileQuery {
                    transaction_id: Some(txn.transaction_id.clone()),
                    ..FileQuery::default()
                },
            )
            .await?;
        files
            .into_iter()
            .find(|f| f.id == location.file_id)
            .ok_or_else(|| CatalogError::NotFound(format!("file {}", location.file_id)))
    }

    // ----- deletion and compensation ------------------------------------

    /// Remove file rows. Serves both the user-facing delete and the
    /// compensation for a failed transfer-put.
    async fn catalog_del(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        let user_delete = details.api_action.is_del();
        let caller_uid = self.auth.uid_of(&details.user).await;
        let role = self.auth.role_of(&details.user, &details.group).await;

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for mut pd in message.data.filelist.clone() {
            let query = if user_delete {
                Self::file_query(details, Some(&pd.original_path))
            } else {
                FileQuery {
                    transaction_id: Some(details.transaction_id.to_string()),
                    original_path: Some(pd.original_path.clone()),
                    ..FileQuery::default()
                }
            };
            let files = self
                .store
                .get_files(&details.user, &details.group, &query)
                .await
                .map_err(Self::map_db_error)?;
            let Some(file) = files.first() else {
                pd.record_permanent_failure("file not found in catalog", self.schedule.max_retries());
                failed.push(pd);
                continue;
            };
            if user_delete {
                let owns = match caller_uid {
                    Some(uid) => i64::from(uid) == file.file_user,
                    // the backend cannot map the user to a uid: treat the
                    // file as the caller's own
                    None => true,
                };
                if !owns && !role.may_delete_others_files() {
                    pd.record_permanent_failure(
                        "permission denied: deputy or manager role required",
                        self.schedule.max_retries(),
                    );
                    failed.push(pd);
                    continue;
                }
            }
            self.store
                .delete_file(file.id)
                .await
                .map_err(Self::map_db_error)?;
            completed.push(pd);
        }

        // compensation runs silently; a user delete reports its outcome
        if user_delete {
            if !completed.is_empty() {
                inbound
                    .publisher
                    .send_pathlist(
                        inbound.key,
                        message,
                        completed,
                        rk::CATALOG_DEL,
                        rk::COMPLETE,
                        State::Complete,
                    )
                    .map_err(|e| ProcessError::Transient(e.to_string()))?;
            }
            if !failed.is_empty() {
                inbound
                    .publisher
                    .send_pathlist(
                        inbound.key,
                        message,
                        failed,
                        rk::CATALOG_DEL,
                        rk::FAILED,
                        State::Failed,
                    )
                    .map_err(|e| ProcessError::Transient(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Strip empty OBJECT_STORE markers after a failed recall, so the next
    /// get can schedule a fresh one.
    async fn catalog_remove(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        for pd in &message.data.filelist {
            let query = Self::file_query(details, Some(&pd.original_path));
            let files = self
                .store
                .get_files(&details.user, &details.group, &query)
                .await
                .map_err(Self::map_db_error)?;
            for file in &files {
                let location = self
                    .store
                    .get_location(file.id, StorageType::ObjectStore)
                    .await
                    .map_err(Self::map_db_error)?;
                if let Some(location) = location {
                    if location.is_empty_marker() {
                        self.store
                            .delete_location(file.id, StorageType::ObjectStore)
                            .await
                            .map_err(Self::map_db_error)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Strip empty TAPE markers (and fail the aggregation, if named) after a
    /// failed archive-put, so the next archive cycle retries cleanly.
    async fn catalog_archive_remove(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        if let Some(agg_id) = message.data.aggregation_id {
            self.store
                .fail_aggregation(agg_id)
                .await
                .map_err(Self::map_db_error)?;
        }
        for pd in &message.data.filelist {
            let query = Self::file_query(details, Some(&pd.original_path));
            let files = self
                .store
                .get_files(&details.user, &details.group, &query)
                .await
                .map_err(Self::map_db_error)?;
            for file in &files {
                let location = self
                    .store
                    .get_location(file.id, StorageType::Tape)
                    .await
                    .map_err(Self::map_db_error)?;
                if let Some(location) = location {
                    if location.is_empty_marker() {
                        self.store
                            .delete_location(file.id, StorageType::Tape)
                            .await
                            .map_err(Self::map_db_error)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ----- archive workflow ---------------------------------------------

    /// Select the oldest holding with unarchived files and mark each with an
    /// empty TAPE location so the next pass cannot double-archive.
    async fn catalog_archive_next(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let tape_url = self
            .config
            .default_tape_url
            .clone()
            .ok_or_else(|| ProcessError::Protocol("no default_tape_url configured".to_string()))?;

        let Some(holding) = self
            .store
            .next_unarchived_holding()
            .await
            .map_err(Self::map_db_error)?
        else {
            tracing::info!("no holdings to archive");
            return Ok(());
        };
        let files = self
            .store
            .unarchived_files(holding.id)
            .await
            .map_err(Self::map_db_error)?;

        // the tape directory for this holding; stable across aggregates
        let holding_slug = format!("{}.{}.{}", holding.id, holding.user_name, holding.group_name);
        let now = OffsetDateTime::now_utc();

        let mut candidates = Vec::new();
        for file in &files {
            match self
                .store
                .create_location(
                    file.id,
                    StorageType::Tape,
                    "root",
                    &tape_url,
                    &holding_slug,
                    "",
                    now,
                    None,
                )
                .await
            {
                Ok(_) => {}
                // marked by an earlier pass that has not completed yet
                Err(CatalogError::AlreadyExists(_)) => continue,
                Err(e) => return Err(Self::map_db_error(e)),
            }
            let locations = self
                .store
                .get_file_locations(file.id)
                .await
                .map_err(Self::map_db_error)?;
            let pd = path_details_from_rows(file, &locations)
                .map_err(|e| ProcessError::Protocol(e.to_string()))?;
            candidates.push(pd);
        }

        if candidates.is_empty() {
            return Ok(());
        }
        let mut onward = message.reply_with(candidates);
        onward.details.user = holding.user_name.clone();
        onward.details.group = holding.group_name.clone();
        onward.details.holding_id = Some(holding.id);
        let key = inbound.key.reply(rk::CATALOG_ARCHIVE_NEXT, rk::COMPLETE);
        inbound
            .publisher
            .publish(&key, &onward)
            .map_err(|e| ProcessError::Transient(e.to_string()))?;
        inbound
            .publisher
            .notify_monitor(inbound.key, &onward, State::Routing)
            .map_err(|e| ProcessError::Transient(e.to_string()))?;
        Ok(())
    }

    /// On archive-put success: create or reuse the aggregation, fill each
    /// member's TAPE marker with the tar name and link it.
    async fn catalog_archive_update(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        let tarname = message
            .data
            .tarfile
            .clone()
            .ok_or_else(|| ProcessError::Protocol("no tarfile in archive update".to_string()))?;
        let checksum = message
            .data
            .checksum
            .ok_or_else(|| ProcessError::Protocol("no checksum in archive update".to_string()))?;
        let algorithm = message
            .data
            .checksum_algorithm
            .clone()
            .unwrap_or_else(|| "ADLER32".to_string());
        let now = OffsetDateTime::now_utc();

        let aggregation = match self
            .store
            .get_aggregation_by_tarname(&tarname)
            .await
            .map_err(Self::map_db_error)?
        {
            Some(aggregation) => aggregation,
            None => self
                .store
                .create_aggregation(&tarname)
                .await
                .map_err(Self::map_db_error)?,
        };
        self.store
            .update_aggregation(aggregation.id, &format!("{checksum:08x}"), &algorithm)
            .await
            .map_err(Self::map_db_error)?;

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for mut pd in message.data.filelist.clone() {
            let query = Self::file_query(details, Some(&pd.original_path));
            let files = self
                .store
                .get_files(&details.user, &details.group, &query)
                .await
                .map_err(Self::map_db_error)?;
            let Some(file) = files.first() else {
                pd.record_permanent_failure("file not found in catalog", self.schedule.max_retries());
                failed.push(pd);
                continue;
            };
            let location = self
                .store
                .get_location(file.id, StorageType::Tape)
                .await
                .map_err(Self::map_db_error)?;
            match location {
                Some(location) if location.is_empty_marker() => {
                    self.store
                        .fill_location(location.id, &tarname, now, Some(aggregation.id))
                        .await
                        .map_err(Self::map_db_error)?;
                    completed.push(pd);
                }
                Some(_) => {
                    // already filled by an earlier delivery of this message
                    completed.push(pd);
                }
                None => {
                    pd.record_permanent_failure(
                        "no tape location to update",
                        self.schedule.max_retries(),
                    );
                    failed.push(pd);
                }
            }
        }

        if !completed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    completed,
                    rk::CATALOG_ARCHIVE_UPDATE,
                    rk::COMPLETE,
                    State::CatalogArchiveAggregating,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        if !failed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    failed,
                    rk::CATALOG_ARCHIVE_UPDATE,
                    rk::FAILED,
                    State::Failed,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    // ----- RPC queries --------------------------------------------------

    async fn rpc_query(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        let mut reply = message.reply_with(Vec::new());

        match details.api_action {
            ApiAction::List => {
                let holdings = self
                    .store
                    .list_holdings(&details.user, &details.group)
                    .await
                    .map_err(Self::map_db_error)?;
                let mut out = Vec::new();
                for holding in &holdings {
                    let tags = self
                        .store
                        .get_tags(holding.id)
                        .await
                        .map_err(Self::map_db_error)?;
                    out.push(serde_json::json!({
                        "id": holding.id,
                        "label": holding.label,
                        "user": holding.user_name,
                        "group": holding.group_name,
                        "tags": tags.iter()
                            .map(|t| (t.key.clone(), t.value.clone()))
                            .collect::<HashMap<_, _>>(),
                    }));
                }
                reply.meta = serde_json::json!({ "holdings": out });
            }
            ApiAction::Find => {
                let paths: Vec<Option<String>> = if message.data.filelist.is_empty() {
                    vec![None]
                } else {
                    message
                        .data
                        .filelist
                        .iter()
                        .map(|pd| Some(pd.original_path.clone()))
                        .collect()
                };
                let mut found = Vec::new();
                for path in paths {
                    let query = Self::file_query(details, path.as_deref());
                    let files = self
                        .store
                        .get_files(&details.user, &details.group, &query)
                        .await
                        .map_err(Self::map_db_error)?;
                    for file in &files {
                        let locations = self
                            .store
                            .get_file_locations(file.id)
                            .await
                            .map_err(Self::map_db_error)?;
                        found.push(
                            path_details_from_rows(file, &locations)
                                .map_err(|e| ProcessError::Protocol(e.to_string()))?,
                        );
                    }
                }
                reply.data.filelist = found;
            }
            ApiAction::Quota => {
                let quota = self
                    .store
                    .get_quota(&details.group)
                    .await
                    .map_err(Self::map_db_error)?;
                reply.meta = match quota {
                    Some(q) => serde_json::json!({
                        "group": q.group_name, "size": q.size, "used": q.used,
                    }),
                    None => serde_json::json!({ "group": details.group, "size": null }),
                };
            }
            other => {
                return Err(ProcessError::Protocol(format!(
                    "unsupported rpc action {other:?} on catalog queue"
                )))
            }
        }

        inbound
            .publisher
            .rpc_reply(inbound.delivery.properties(), &reply)
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }
}

#[async_trait]
impl Processor for CatalogProcessor {
    fn name(&self) -> &'static str {
        "catalog"
    }

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError> {
        if inbound.delivery.properties().reply_to.is_some() {
            return self.rpc_query(&inbound).await;
        }
        match inbound.key.worker.as_str() {
            rk::CATALOG_PUT => self.catalog_put(&inbound).await,
            rk::CATALOG_UPDATE => self.catalog_update(&inbound).await,
            rk::CATALOG_GET => self.catalog_get(&inbound).await,
            rk::CATALOG_DEL => self.catalog_del(&inbound).await,
            rk::CATALOG_REMOVE => self.catalog_remove(&inbound).await,
            rk::CATALOG_ARCHIVE_NEXT => self.catalog_archive_next(&inbound).await,
            rk::CATALOG_ARCHIVE_UPDATE => self.catalog_archive_update(&inbound).await,
            rk::CATALOG_ARCHIVE_DEL | rk::CATALOG_ARCHIVE_REMOVE => {
                self.catalog_archive_remove(&inbound).await
            }
            other => Err(ProcessError::Protocol(format!(
                "unknown catalog operation: {other}"
            ))),
        }
    }
}
