//! Package synchronization
//!
//! The admin saves the package manifest as [`ResourceKind::Packages`];
//! workers install it and then restart. A revision counts as applied only
//! once both steps succeed.
//!
//! The restart usually replaces the process, so the installer itself must
//! remember what it installed: a worker starts from
//! [`PackageInstaller::installed_revision`] and only a newer manifest
//! triggers another install.

use super::subscriber::{ChangeSubscriber, ConfigUpdate, ReloadHandler};
use super::Channels;
use crate::common::{Error, Result};
use crate::storage::{ConfigStore, ResourceKind};
use crate::transport::Transport;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Host hooks for package changes
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Manifest revision the local installation reflects (0 = none)
    async fn installed_revision(&self) -> Result<u64>;

    /// Bring installed packages in line with `manifest` and record `revision`
    /// so that [`installed_revision`](Self::installed_revision) reports it
    /// after the restart
    async fn install(&self, manifest: &Value, revision: u64) -> Result<()>;

    /// Restart the runtime so the installed packages are loaded
    async fn restart(&self) -> Result<()>;
}

struct InstallThenRestart {
    installer: Arc<dyn PackageInstaller>,
}

#[async_trait]
impl ReloadHandler for InstallThenRestart {
    async fn reload(&self, update: ConfigUpdate) -> Result<()> {
        tracing::info!("Installing packages from manifest revision {}", update.revision);
        self.installer.install(&update.body, update.revision).await.map_err(|e| match e {
            Error::Install(_) => e,
            other => Error::Install(other.to_string()),
        })?;
        tracing::info!("Packages installed, restarting");
        self.installer.restart().await
    }
}

pub struct PackageSubscriber {
    inner: Arc<ChangeSubscriber>,
}

impl PackageSubscriber {
    pub fn new(store: Arc<ConfigStore>, channels: Channels, installer: Arc<dyn PackageInstaller>) -> Self {
        Self::starting_at(store, channels, installer, 0)
    }

    /// Subscriber that starts from the installer's recorded revision
    pub async fn open(
        store: Arc<ConfigStore>,
        channels: Channels,
        installer: Arc<dyn PackageInstaller>,
    ) -> Result<Self> {
        let installed = installer.installed_revision().await?;
        tracing::debug!("Installed package manifest revision {}", installed);
        Ok(Self::starting_at(store, channels, installer, installed))
    }

    fn starting_at(
        store: Arc<ConfigStore>,
        channels: Channels,
        installer: Arc<dyn PackageInstaller>,
        installed: u64,
    ) -> Self {
        let subscriber = ChangeSubscriber::new(
            store,
            channels,
            vec![ResourceKind::Packages],
            Arc::new(InstallThenRestart { installer }),
        )
        .named("package subscriber")
        .starting_at([(ResourceKind::Packages, installed)]);
        Self {
            inner: Arc::new(subscriber),
        }
    }

    pub async fn applied_revision(&self) -> u64 {
        self.inner.applied_revision(ResourceKind::Packages).await
    }

    /// Install and restart when the manifest changed; returns whether it did
    pub async fn reconcile(&self) -> bool {
        self.inner.reconcile().await > 0
    }

    pub fn start(
        &self,
        transport: Arc<dyn Transport>,
        reconcile_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        self.inner.clone().start(transport, reconcile_interval, shutdown)
    }
}
