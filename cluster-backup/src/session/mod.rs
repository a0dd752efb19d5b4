//! Backup session state machine.
//!
//! A session goes `INVALID -> RUNNING -> DONE | ERROR`. It becomes RUNNING
//! once the catalog lock is held and the first descriptor is persisted.
//! From then on every exit path ends in a persisted terminal status: failures
//! are cleaned up explicitly (closing the backup window on the server when it
//! is still open), and [`DescriptorGuard`] marks the backup ERROR if the
//! session is dropped or panics before reaching either outcome.

pub mod descriptor;

pub use descriptor::{BackupDescriptor, BackupMode, BackupStatus};

use chrono::{DateTime, Utc};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{last_data_backup, FsCatalog};
use crate::control;
use crate::executor::CopyPass;
use crate::fs::inventory::{Clock, FileInventory};
use crate::fs::walker::WalkOptions;
use crate::server::{check_server, Connector, ServerInfo};
use crate::timeline::{resolve_history, timeline_index};
use crate::transfer::copy::FileCopier;
use crate::wal::archive::ArchiveSync;
use crate::wal::pagemap::{build_pagemaps, WalScanner};
use crate::{BackupError, Result};

/// Present in the data directory of a standby.
pub const RECOVERY_CONF: &str = "recovery.conf";

/// Created by the server while a backup window is open.
pub const BACKUP_LABEL: &str = "backup_label";

/// What to back up and where.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub pgdata: Option<PathBuf>,
    pub arclog_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    pub mode: Option<BackupMode>,
    pub smooth_checkpoint: bool,
    pub compress: bool,
    pub walk: WalkOptions,
}

/// Collaborators of a session.
pub struct BackupContext<C> {
    pub connector: C,
    pub copier: Box<dyn FileCopier>,
    pub scanner: Box<dyn WalScanner>,
    pub clock: Box<dyn Clock>,
    /// Process-wide interruption flag.
    pub cancel: CancellationToken,
}

/// Options after the precondition checks.
struct Target {
    pgdata: PathBuf,
    arclog_path: PathBuf,
    backup_path: PathBuf,
    mode: BackupMode,
}

pub struct BackupSession<C> {
    options: BackupOptions,
    ctx: BackupContext<C>,
    server: Option<ServerInfo>,
}

impl<C: Connector> BackupSession<C> {
    pub fn new(options: BackupOptions, ctx: BackupContext<C>) -> Self {
        Self {
            options,
            ctx,
            server: None,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from(self.ctx.clock.now())
    }

    fn check_preconditions(&self) -> Result<Target> {
        let opts = &self.options;
        let pgdata = opts
            .pgdata
            .clone()
            .ok_or_else(|| BackupError::Config("required parameter not specified: PGDATA (-D, --pgdata)".into()))?;
        let backup_path = opts.backup_path.clone().ok_or_else(|| {
            BackupError::Config("required parameter not specified: BACKUP_PATH (-B, --backup-path)".into())
        })?;
        let mode = opts
            .mode
            .ok_or_else(|| BackupError::Config("required parameter not specified: BACKUP_MODE (-b, --backup-mode)".into()))?;
        let arclog_path = opts.arclog_path.clone().ok_or_else(|| {
            BackupError::Config("required parameter not specified: ARCLOG_PATH (-A, --arclog-path)".into())
        })?;

        if pgdata.join(RECOVERY_CONF).exists() {
            return Err(BackupError::Config("cannot take a backup from a standby server".into()));
        }

        Ok(Target {
            pgdata,
            arclog_path,
            backup_path,
            mode,
        })
    }

    /// Server compatibility, checked once per session.
    async fn server_info(&mut self) -> Result<ServerInfo> {
        if let Some(info) = self.server {
            return Ok(info);
        }
        let info = check_server(&self.ctx.connector).await?;
        self.server = Some(info);
        Ok(info)
    }

    /// Take one backup. Returns the final descriptor, which is DONE.
    pub async fn run(&mut self) -> Result<BackupDescriptor> {
        let target = self.check_preconditions()?;
        let server = self.server_info().await?;

        let catalog = FsCatalog::new(&target.backup_path);
        let _lock = catalog.lock()?;

        let mut desc = BackupDescriptor::new(target.mode, self.options.compress, self.now());
        desc.block_size = server.block_size;
        desc.wal_block_size = server.wal_block_size;
        desc.status = BackupStatus::Running;
        catalog.create_backup_dir(&desc)?;
        catalog.write_descriptor(&desc)?;

        let mut guard = DescriptorGuard::new(&catalog, desc);
        info!("========================================");
        info!("{} backup start ({})", target.mode, guard.id());

        if let Err(err) = self.backup_database(&target, &catalog, &mut guard).await {
            self.cleanup(&target, &catalog, &mut guard).await;
            return Err(err);
        }

        guard.commit(self.now())?;
        let desc = guard.disarm();

        info!(
            "backup {} complete: start {} stop {}, {} bytes",
            desc.id(),
            desc.start_lsn,
            desc.stop_lsn,
            desc.data_bytes
        );
        Ok(desc)
    }

    async fn backup_database(
        &self,
        target: &Target,
        catalog: &FsCatalog,
        desc: &mut BackupDescriptor,
    ) -> Result<()> {
        let sync = ArchiveSync::new(&self.ctx.connector, &target.pgdata, &self.ctx.cancel);

        desc.tli = control::current_timeline(&target.pgdata)?;

        let prev = if target.mode.is_diff() {
            let backups = catalog.list_backups()?;
            let prev = last_data_backup(&backups, desc.tli)
                .cloned()
                .ok_or(BackupError::BaselineNotFound(desc.tli))?;
            info!("Baseline backup {} (start {})", prev.id(), prev.start_lsn);
            Some(prev)
        } else {
            None
        };

        desc.start_lsn = sync
            .start_backup(&desc.label(), self.options.smooth_checkpoint)
            .await?;

        if !backup_label_path(&target.pgdata).exists() {
            if let Err(err) = sync.stop_backup().await {
                warn!("could not stop backup: {}", err);
            }
            return Err(BackupError::BackupLabelMissing);
        }

        let baseline = match &prev {
            Some(prev) => Some(catalog.read_baseline(prev)?),
            None => None,
        };

        let mut inventory = FileInventory::scan(&target.pgdata, &self.options.walk)?;
        info!("{} entries listed in {}", inventory.len(), target.pgdata.display());

        if let Some(prev) = &prev {
            let history = resolve_history(&target.pgdata, desc.tli)?;
            let tli_index = timeline_index(&history, desc.tli).ok_or_else(|| {
                BackupError::Corrupted(format!("timeline {} missing from its own history", desc.tli))
            })?;

            // The scan boundary must sit in an archived segment.
            sync.switch_xlog().await?;
            build_pagemaps(
                self.ctx.scanner.as_ref(),
                &mut inventory,
                &target.arclog_path,
                prev.start_lsn,
                &history,
                tli_index,
                desc.start_lsn,
            )?;
        }

        let to_root = catalog.database_dir(desc);
        let pass = CopyPass {
            to_root: &to_root,
            baseline: baseline.as_ref(),
            since: prev.as_ref().map(|p| p.start_lsn),
            prefix: None,
            compress: self.options.compress,
            copier: self.ctx.copier.as_ref(),
            clock: self.ctx.clock.as_ref(),
            cancel: &self.ctx.cancel,
        };
        pass.run(&mut inventory).await?;

        let stop = sync.stop_backup().await?;
        desc.tli = stop.tli;
        desc.stop_lsn = stop.lsn;
        desc.recovery_xid = stop.recovery_xid;
        desc.recovery_time = Some(stop.recovery_time);

        catalog.write_file_list(desc, &inventory)?;
        desc.data_bytes = inventory.data_bytes(target.mode.is_diff());

        let (copied, skipped) = inventory.copy_counts();
        info!("{} files copied, {} skipped", copied, skipped);
        Ok(())
    }

    /// Best effort: close an open backup window, then record the failure.
    async fn cleanup(&self, target: &Target, catalog: &FsCatalog, guard: &mut DescriptorGuard<'_>) {
        if backup_label_path(&target.pgdata).exists() {
            info!("{} exists, stop backup", BACKUP_LABEL);
            let sync = ArchiveSync::new(&self.ctx.connector, &target.pgdata, &self.ctx.cancel);
            if let Err(err) = sync.stop_backup().await {
                warn!("could not stop backup: {}", err);
            }
        }

        if guard.fail(self.now()) {
            if let Err(err) = catalog.write_descriptor(guard) {
                warn!("could not persist status of backup {}: {}", guard.id(), err);
            }
            warn!("backup {} is marked as {}", guard.id(), guard.status);
        }
        guard.armed = false;
    }
}

/// Owns the descriptor of a RUNNING backup and persists ERROR if dropped
/// before being disarmed.
pub struct DescriptorGuard<'a> {
    catalog: &'a FsCatalog,
    desc: BackupDescriptor,
    armed: bool,
}

impl<'a> DescriptorGuard<'a> {
    pub fn new(catalog: &'a FsCatalog, desc: BackupDescriptor) -> Self {
        Self {
            catalog,
            desc,
            armed: true,
        }
    }

    /// Persist the descriptor as DONE. If the write fails it stays RUNNING,
    /// so dropping the guard still records ERROR.
    pub fn commit(&mut self, at: DateTime<Utc>) -> Result<()> {
        let mut done = self.desc.clone();
        done.complete(at);
        self.catalog.write_descriptor(&done)?;
        self.desc = done;
        Ok(())
    }

    pub fn disarm(mut self) -> BackupDescriptor {
        self.armed = false;
        self.desc.clone()
    }
}

impl Deref for DescriptorGuard<'_> {
    type Target = BackupDescriptor;

    fn deref(&self) -> &BackupDescriptor {
        &self.desc
    }
}

impl DerefMut for DescriptorGuard<'_> {
    fn deref_mut(&mut self) -> &mut BackupDescriptor {
        &mut self.desc
    }
}

impl Drop for DescriptorGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || !self.desc.fail(Utc::now()) {
            return;
        }
        warn!(
            "backup {} abandoned while running, the server may still be in backup mode",
            self.desc.id()
        );
        if let Err(err) = self.catalog.write_descriptor(&self.desc) {
            warn!("could not persist status of backup {}: {}", self.desc.id(), err);
        }
    }
}

/// Path of the backup label marker in `pgdata`.
pub fn backup_label_path(pgdata: &Path) -> PathBuf {
    pgdata.join(BACKUP_LABEL)
}
