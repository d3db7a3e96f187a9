//! Process context wiring the hub, router and agents together

use crate::client::McpClient;
use crate::config::MeshConfig;
use crate::error::Result;
use crate::hub::UiHub;
use crate::router::Router;
use crate::transport::RouterTransport;
use std::sync::Arc;
use tracing::info;

/// Everything one mesh process shares, built once at startup
pub struct McpContext {
    config: MeshConfig,
    hub: Arc<UiHub>,
    router: Arc<Router>,
}

impl McpContext {
    /// Build the hub and router from `config`
    pub fn new(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let hub = Arc::new(UiHub::new(config.hub.clone()));
        let router = Arc::new(Router::new(config.router.clone(), Some(Arc::clone(&hub)))?);
        info!("Mesh context {} ready", config.router.router_id);
        Ok(Self { config, hub, router })
    }

    /// Configuration the context was built from
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Shared activity hub
    pub fn hub(&self) -> &Arc<UiHub> {
        &self.hub
    }

    /// Router every spawned agent is registered with
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Create an agent reachable through the router under `agent_id`
    pub fn spawn_agent(&self, agent_id: impl Into<String>) -> Result<McpClient> {
        let mut client_config = self.config.client.clone();
        client_config.agent_id = agent_id.into();

        let client = McpClient::new(
            client_config,
            self.config.protocol.clone(),
            self.config.circuit_breaker.clone(),
            self.config.registry.clone(),
            Arc::new(RouterTransport::new(&self.router)),
        )?;
        self.router
            .register_server(client.agent_id(), Arc::new(client.clone()))?;
        Ok(client)
    }

    /// Detach every agent from the router
    pub fn shutdown(&self) {
        self.router.clear_servers();
        info!("Mesh context {} shut down", self.config.router.router_id);
    }
}
