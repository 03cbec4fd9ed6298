//! Run lease handle
//!
//! Holds the exclusive per-namespace run lease and renews it in the
//! background. The first failed renewal marks the lease lost; waiters on
//! [`RunLease::lost`] are woken exactly once with the reason.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::connector::{LeaseError, LeaseToken, NamespaceConnector};

pub struct RunLease {
    connector: Arc<dyn NamespaceConnector>,
    token: LeaseToken,
    lost_rx: watch::Receiver<Option<String>>,
    renewal: JoinHandle<()>,
}

impl RunLease {
    /// Acquire the lease and start renewing it every `renew_interval`
    #[instrument(skip(connector), fields(namespace = %connector.namespace()))]
    pub async fn acquire(
        connector: Arc<dyn NamespaceConnector>,
        holder: &str,
        renew_interval: Duration,
    ) -> Result<Self, LeaseError> {
        let token = connector.acquire_run_lease(holder).await?;
        info!(lease = %token.id, "Acquired run lease");

        let (lost_tx, lost_rx) = watch::channel(None);
        let renewal = tokio::spawn(renew_loop(
            connector.clone(),
            token.clone(),
            renew_interval,
            lost_tx,
        ));

        Ok(Self {
            connector,
            token,
            lost_rx,
            renewal,
        })
    }

    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    pub fn is_lost(&self) -> bool {
        self.lost_rx.borrow().is_some()
    }

    /// Wait until the lease is lost and return the reason.
    /// Never completes while the lease is healthy.
    pub async fn lost(&self) -> String {
        let mut rx = self.lost_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Renewal stopped without losing the lease
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stop renewing and hand the lease back
    pub async fn release(self) {
        self.renewal.abort();
        if self.is_lost() {
            debug!(namespace = %self.token.namespace, "Lease already lost, nothing to release");
            return;
        }
        match self.connector.release_run_lease(&self.token).await {
            Ok(()) => info!(namespace = %self.token.namespace, "Released run lease"),
            Err(e) => warn!(namespace = %self.token.namespace, error = %e, "Failed to release run lease"),
        }
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

async fn renew_loop(
    connector: Arc<dyn NamespaceConnector>,
    token: LeaseToken,
    renew_interval: Duration,
    lost_tx: watch::Sender<Option<String>>,
) {
    let mut interval = tokio::time::interval(renew_interval);
    // First tick fires immediately; the lease was just acquired
    interval.tick().await;

    loop {
        interval.tick().await;
        match connector.renew_run_lease(&token).await {
            Ok(()) => debug!(namespace = %token.namespace, "Renewed run lease"),
            Err(e) => {
                warn!(namespace = %token.namespace, error = %e, "Run lease lost");
                let _ = lost_tx.send(Some(e.to_string()));
                return;
            }
        }
    }
}
