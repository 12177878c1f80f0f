use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use yadisk_dav::DavClient;

use crate::destination::{DavDestination, Destination};
use crate::source::{ObjectSource, S3Settings, S3Source};
use crate::sync::backoff::RetryPolicy;
use crate::sync::ledger::{Ledger, default_ledger_path};
use crate::sync::reconcile::{DeletePolicy, PassReport, ReconcileSettings, Reconciler};
use crate::sync::schedule::{ActiveWindow, Scheduler, SystemClock};
use crate::sync::transfer::TransferStage;

const DEFAULT_PREFIX: &str = "invoices/";
const DEFAULT_S3_ENDPOINT: &str = "https://storage.yandexcloud.net";
const DEFAULT_REGION: &str = "ru-central1";
const DEFAULT_WEBDAV_URL: &str = "https://webdav.yandex.ru";
const DEFAULT_DISK_FOLDER: &str = "Накладные";
const DEFAULT_ACTIVE_START_HOUR: u8 = 8;
const DEFAULT_ACTIVE_END_HOUR: u8 = 17;
const DEFAULT_POLL_SECS: u64 = 300;
const DEFAULT_CONCURRENCY: u64 = 5;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_RETRY_ATTEMPTS: u64 = 3;

#[derive(Clone)]
pub struct MirrorConfig {
    pub s3: S3Settings,
    pub prefix: String,
    pub webdav_url: String,
    pub login: String,
    pub app_password: String,
    pub disk_folder: String,
    pub scratch_dir: PathBuf,
    pub ledger_path: Option<PathBuf>,
    pub delete_policy: DeletePolicy,
    pub window: ActiveWindow,
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub http_timeout: Duration,
    pub retry_attempts: u32,
}

impl fmt::Debug for MirrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorConfig")
            .field("s3", &self.s3)
            .field("prefix", &self.prefix)
            .field("webdav_url", &self.webdav_url)
            .field("login", &self.login)
            .field("disk_folder", &self.disk_folder)
            .field("scratch_dir", &self.scratch_dir)
            .field("ledger_path", &self.ledger_path)
            .field("delete_policy", &self.delete_policy)
            .field("window", &self.window)
            .field("poll_interval", &self.poll_interval)
            .field("concurrency", &self.concurrency)
            .field("http_timeout", &self.http_timeout)
            .field("retry_attempts", &self.retry_attempts)
            .finish_non_exhaustive()
    }
}

impl MirrorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source, so tests do not
    /// have to touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = dirs::home_dir();
        let http_timeout = Duration::from_secs(read_u64_env(
            &lookup,
            "MIRROR_HTTP_TIMEOUT_SECS",
            DEFAULT_HTTP_TIMEOUT_SECS,
        ));

        let s3 = S3Settings {
            bucket: read_required(&lookup, "MIRROR_BUCKET")?,
            endpoint: read_string(&lookup, "MIRROR_S3_ENDPOINT", DEFAULT_S3_ENDPOINT),
            region: read_string(&lookup, "YANDEX_REGION", DEFAULT_REGION),
            access_key_id: read_required(&lookup, "AWS_ACCESS_KEY_ID")?,
            secret_access_key: read_required(&lookup, "AWS_SECRET_ACCESS_KEY")?,
            force_path_style: read_bool_env(&lookup, "MIRROR_S3_PATH_STYLE", false),
            timeout: http_timeout,
        };

        let scratch_dir = lookup("MIRROR_SCRATCH_DIR")
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_path(&value, home.as_deref()))
            .unwrap_or_else(default_scratch_root);
        let ledger_path = match lookup("MIRROR_LEDGER_PATH") {
            Some(value) if value.trim() == "default" => {
                Some(default_ledger_path().context("cannot resolve default ledger location")?)
            }
            Some(value) if !value.trim().is_empty() => Some(expand_path(&value, home.as_deref())),
            _ => None,
        };

        let window = ActiveWindow::new(
            read_hour_env(&lookup, "MIRROR_ACTIVE_START_HOUR", DEFAULT_ACTIVE_START_HOUR)?,
            read_hour_env(&lookup, "MIRROR_ACTIVE_END_HOUR", DEFAULT_ACTIVE_END_HOUR)?,
        )
        .context("invalid active window")?;

        Ok(Self {
            s3,
            prefix: read_string(&lookup, "MIRROR_PREFIX", DEFAULT_PREFIX),
            webdav_url: read_string(&lookup, "MIRROR_WEBDAV_URL", DEFAULT_WEBDAV_URL),
            login: read_required(&lookup, "YANDEX_LOGIN")?,
            app_password: read_required(&lookup, "YANDEX_APP_PASSWORD")?,
            disk_folder: read_string(&lookup, "MIRROR_DISK_FOLDER", DEFAULT_DISK_FOLDER),
            scratch_dir,
            ledger_path,
            delete_policy: read_delete_policy(&lookup)?,
            window,
            poll_interval: Duration::from_secs(read_u64_env(
                &lookup,
                "MIRROR_POLL_SECS",
                DEFAULT_POLL_SECS,
            )),
            concurrency: usize::try_from(read_u64_env(
                &lookup,
                "MIRROR_CONCURRENCY",
                DEFAULT_CONCURRENCY,
            ))
            .unwrap_or(usize::MAX),
            http_timeout,
            retry_attempts: u32::try_from(read_u64_env(
                &lookup,
                "MIRROR_RETRY_ATTEMPTS",
                DEFAULT_RETRY_ATTEMPTS,
            ))
            .unwrap_or(u32::MAX),
        })
    }
}

pub struct DaemonRuntime {
    config: MirrorConfig,
    scheduler: Scheduler<Reconciler>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: MirrorConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.scratch_dir)
            .await
            .with_context(|| format!("failed to create scratch dir at {:?}", config.scratch_dir))?;

        let source: Arc<dyn ObjectSource> = Arc::new(S3Source::new(&config.s3));
        let client = DavClient::with_timeout(
            &config.webdav_url,
            config.login.clone(),
            config.app_password.clone(),
            config.http_timeout,
        )
        .context("invalid WebDAV configuration")?;
        let destination: Arc<dyn Destination> =
            Arc::new(DavDestination::new(client, config.disk_folder.clone()));

        let ledger = match &config.ledger_path {
            Some(path) => Some(
                Ledger::open(path)
                    .await
                    .with_context(|| format!("failed to open ledger at {path:?}"))?,
            ),
            None => None,
        };

        let retry = RetryPolicy::new(RetryPolicy::default().backoff(), config.retry_attempts);
        let transfer = TransferStage::new(
            Arc::clone(&source),
            Arc::clone(&destination),
            config.scratch_dir.clone(),
            config.concurrency,
            retry,
        );
        let reconciler = Reconciler::new(
            source,
            destination,
            transfer,
            ledger,
            ReconcileSettings {
                prefix: config.prefix.clone(),
                concurrency: config.concurrency,
                delete_policy: config.delete_policy,
                retry,
            },
        );
        let scheduler = Scheduler::new(reconciler, SystemClock, config.window, config.poll_interval);

        Ok(Self { config, scheduler })
    }

    /// Runs passes on schedule until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        self.log_started("scheduled");
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested, finishing current pass"),
                Err(err) => warn!(error = %err, "failed waiting for shutdown signal"),
            }
            signal_token.cancel();
        });

        self.scheduler.run(shutdown).await;
        signal_handle.abort();
        Ok(())
    }

    /// Runs a single pass immediately, ignoring the active window.
    pub async fn run_once(self) -> anyhow::Result<PassReport> {
        self.log_started("single pass");
        let report = self
            .scheduler
            .runner()
            .run_pass()
            .await
            .context("reconciliation pass failed")?;
        info!(
            enumerated = report.enumerated,
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.transfer_failed,
            deleted = report.deleted,
            "pass finished"
        );
        Ok(report)
    }

    fn log_started(&self, mode: &str) {
        info!(
            mode,
            bucket = %self.config.s3.bucket,
            prefix = %self.config.prefix,
            disk_folder = %self.config.disk_folder,
            ledger = self.config.ledger_path.is_some(),
            delete_policy = ?self.config.delete_policy,
            concurrency = self.config.concurrency,
            "mirror started"
        );
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
