//! Frame delivery between agents

use crate::error::{McpError, Result};
use crate::router::Router;
use agentmesh_core::{Message, Response};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Delivers an encoded message to a named target and returns its response
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `frame` to `target`.
    ///
    /// `Err` means the frame never reached a server; a server that rejects
    /// the message still answers with an `error` response.
    async fn deliver(&self, target: &str, frame: Vec<u8>) -> Result<Response>;
}

/// In-process transport that hands frames to a [`Router`]
#[derive(Debug, Clone)]
pub struct RouterTransport {
    router: Weak<Router>,
}

impl RouterTransport {
    /// Transport over `router`; it does not keep the router alive
    pub fn new(router: &Arc<Router>) -> Self {
        Self {
            router: Arc::downgrade(router),
        }
    }
}

#[async_trait]
impl Transport for RouterTransport {
    async fn deliver(&self, target: &str, frame: Vec<u8>) -> Result<Response> {
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| McpError::communication("router shut down"))?;
        let message = Message::from_wire(&frame)?;
        debug!("Delivering {} {} to {}", message.message_type(), message.trace_id(), target);

        let outcome = router.route_to(target, message).await;
        match outcome.response {
            Some(response) => Ok(response),
            None => Err(McpError::communication(
                outcome.error.unwrap_or_else(|| format!("delivery to '{}' failed", target)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterConfig;
    use agentmesh_core::{Headers, MessageType};
    use serde_json::Map;

    fn frame() -> Vec<u8> {
        let headers = Headers::new("t", "mcp://agent-a/receive_callback", "agent-a").unwrap();
        Message::new(MessageType::Heartbeat, headers, Map::new())
            .unwrap()
            .to_wire()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_target_is_a_communication_error() {
        let router = Arc::new(Router::new(RouterConfig::default(), None).unwrap());
        let transport = RouterTransport::new(&router);
        let err = transport.deliver("ghost", frame()).await.unwrap_err();
        assert!(matches!(err, McpError::Communication(ref m) if m.contains("ghost")));
    }

    #[tokio::test]
    async fn test_dropped_router() {
        let router = Arc::new(Router::new(RouterConfig::default(), None).unwrap());
        let transport = RouterTransport::new(&router);
        drop(router);
        let err = transport.deliver("anyone", frame()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
