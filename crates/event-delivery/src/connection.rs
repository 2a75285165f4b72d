//! Connection ownership shared by the publisher, subscriber, and DLQ tools.
//!
//! Each component owns one [`ConnectionSlot`]. `connect` is idempotent;
//! `close` waits for every outstanding read guard, which lets callers drain
//! in-flight work before the connection is released.

use std::sync::Arc;

use shared_bus::{BusConnection, BusConnector, ConnectOptions};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::BusSettings;
use crate::domain::DeliveryError;

pub(crate) struct ConnectionSlot {
    connector: Arc<dyn BusConnector>,
    settings: BusSettings,
    role: &'static str,
    slot: RwLock<Option<Arc<dyn BusConnection>>>,
}

impl ConnectionSlot {
    pub(crate) fn new(
        connector: Arc<dyn BusConnector>,
        settings: BusSettings,
        role: &'static str,
    ) -> Self {
        Self {
            connector,
            settings,
            role,
            slot: RwLock::new(None),
        }
    }

    /// Connect unless already connected. Returns `true` when a new
    /// connection was opened.
    pub(crate) async fn connect(&self) -> Result<bool, DeliveryError> {
        if self.is_connected().await {
            return Ok(false);
        }

        let mut slot = self.slot.write().await;
        if slot.as_ref().is_some_and(|c| c.is_connected()) {
            return Ok(false);
        }

        let options = ConnectOptions {
            servers: self.settings.servers.clone(),
            name: format!("{}-{}", self.settings.service_name, self.role),
            connect_timeout: self.settings.connect_timeout,
        };
        let connection = match timeout(
            self.settings.connect_timeout,
            self.connector.connect(&options),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(err)) => {
                error!(role = self.role, servers = ?options.servers, error = %err, "Bus connection failed");
                return Err(err.into());
            }
            Err(_) => {
                error!(role = self.role, servers = ?options.servers, "Bus connection timed out");
                return Err(DeliveryError::Timeout(self.settings.connect_timeout));
            }
        };

        if let Some(stale) = slot.replace(connection) {
            debug!(role = self.role, "Replacing dropped bus connection");
            let _ = stale.close().await;
        }
        info!(role = self.role, servers = ?options.servers, "Connected to bus");
        Ok(true)
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.slot
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// Current connection, or `NotConnected`.
    pub(crate) async fn get(&self) -> Result<Arc<dyn BusConnection>, DeliveryError> {
        self.slot
            .read()
            .await
            .clone()
            .ok_or(DeliveryError::NotConnected)
    }

    /// Hold the connection for the duration of an operation; `close` waits
    /// until the guard is dropped.
    pub(crate) async fn hold(&self) -> RwLockReadGuard<'_, Option<Arc<dyn BusConnection>>> {
        self.slot.read().await
    }

    /// Flush and release the connection. Safe to call more than once.
    pub(crate) async fn close(&self) -> Result<(), DeliveryError> {
        let Some(connection) = self.slot.write().await.take() else {
            return Ok(());
        };
        if let Err(err) = connection.flush().await {
            warn!(role = self.role, error = %err, "Flush before close failed");
        }
        connection.close().await?;
        info!(role = self.role, "Bus connection closed");
        Ok(())
    }
}
