//! Registry of running proxies, one per container.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus_connection::{Connector, ZbusConnector};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::proxy::{DbusProxy, ProxyStats};

/// Summary of one managed proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyInfo {
    pub container_name: String,
    pub bus_address: String,
    /// Well-known names currently routed, on either bus.
    pub name_count: usize,
}

struct ManagedProxy {
    proxy: Arc<DbusProxy>,
    /// The task driving `run()`.
    task: JoinHandle<Result<()>>,
}

/// Starts, tracks and stops proxies by container name.
pub struct ProxyManager {
    host_bus_address: Option<String>,
    connector: Arc<dyn Connector>,
    proxies: Arc<Mutex<HashMap<String, ManagedProxy>>>,
}

impl ProxyManager {
    /// Create a manager whose proxies connect real buses.
    ///
    /// # Arguments
    /// * `host_bus_address` - Host session bus for every proxy; `None` uses
    ///   the environment.
    pub fn new(host_bus_address: Option<String>) -> Self {
        Self::with_connector(host_bus_address, Arc::new(ZbusConnector))
    }

    /// Create a manager whose proxies connect through `connector`.
    pub fn with_connector(host_bus_address: Option<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            host_bus_address,
            connector,
            proxies: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a proxy for a container and keep it running in the background.
    ///
    /// Fails with [`Error::DuplicateProxy`] if the container already has one.
    /// A proxy that loses a bus is stopped and forgotten, freeing the name.
    pub async fn start_proxy(&self, container_name: &str, container_bus_address: &str) -> Result<()> {
        let mut proxies = self.proxies.lock().await;
        if proxies.contains_key(container_name) {
            warn!(container = %container_name, "Proxy already running");
            return Err(Error::DuplicateProxy(container_name.to_string()));
        }

        let mut config = ProxyConfig::new(container_bus_address);
        if let Some(host) = &self.host_bus_address {
            config = config.with_host_bus(host.clone());
        }

        let proxy = Arc::new(DbusProxy::with_connector(config, self.connector.clone()));
        proxy.start().await?;

        let runner = proxy.clone();
        let registry = self.proxies.clone();
        let name = container_name.to_string();
        let task = tokio::spawn(async move {
            let result = runner.run().await;
            if let Err(e) = &result {
                warn!(container = %name, error = %e, "Proxy exited with error");
                runner.stop().await;

                let mut proxies = registry.lock().await;
                if proxies
                    .get(&name)
                    .is_some_and(|managed| Arc::ptr_eq(&managed.proxy, &runner))
                {
                    proxies.remove(&name);
                    info!(container = %name, "Removed failed proxy");
                }
            }
            result
        });

        proxies.insert(container_name.to_string(), ManagedProxy { proxy, task });
        info!(
            container = %container_name,
            bus_address = %container_bus_address,
            "Started D-Bus proxy for container"
        );
        Ok(())
    }

    /// Stop and forget the proxy for a container.
    ///
    /// Returns `false` if there was none.
    pub async fn stop_proxy(&self, container_name: &str) -> bool {
        let entry = self.proxies.lock().await.remove(container_name);
        let Some(ManagedProxy { proxy, task }) = entry else {
            debug!(container = %container_name, "No proxy to stop");
            return false;
        };

        proxy.stop().await;
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(container = %container_name, error = %e, "Proxy had already failed"),
            Err(e) => warn!(container = %container_name, error = %e, "Proxy task panicked"),
        }

        info!(container = %container_name, "Stopped D-Bus proxy for container");
        true
    }

    /// Stop every proxy.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.proxies.lock().await.keys().cloned().collect();
        for name in names {
            self.stop_proxy(&name).await;
        }
    }

    /// Describe every managed proxy, ordered by container name.
    pub async fn list_proxies(&self) -> Vec<ProxyInfo> {
        let proxies = self.proxies.lock().await;
        let mut infos: Vec<ProxyInfo> = proxies
            .iter()
            .map(|(name, managed)| {
                let stats = managed.proxy.get_stats();
                ProxyInfo {
                    container_name: name.clone(),
                    bus_address: managed.proxy.config().container_bus_address.clone(),
                    name_count: stats.local_name_count + stats.host_name_count,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        infos
    }

    /// Counters for one container's proxy.
    pub async fn get_proxy_stats(&self, container_name: &str) -> Option<ProxyStats> {
        self.proxies
            .lock()
            .await
            .get(container_name)
            .map(|managed| managed.proxy.get_stats())
    }

    /// Number of managed proxies.
    pub async fn len(&self) -> usize {
        self.proxies.lock().await.len()
    }

    /// Whether no proxies are managed.
    pub async fn is_empty(&self) -> bool {
        self.proxies.lock().await.is_empty()
    }
}
