//! Protocol layer: outbound signing, inbound verification and dispatch by
//! message type.

use crate::error::{McpError, Result};
use agentmesh_core::{ErrorCode, Message, MessageSigner, MessageType, Response};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Protocol configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Shared HMAC key; outgoing messages are signed when set
    pub signing_key: Option<String>,
    /// Reject inbound messages that carry no valid signature
    pub require_signatures: bool,
}

/// Handles one inbound message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produce the response for a verified message
    async fn handle(&self, message: Message) -> Result<Response>;
}

/// Message codec plus a dispatch table keyed by [`MessageType`]
pub struct McpProtocol {
    config: ProtocolConfig,
    signer: Option<MessageSigner>,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
}

impl McpProtocol {
    /// Create a protocol instance
    pub fn new(config: ProtocolConfig) -> Result<Self> {
        let signer = match &config.signing_key {
            Some(key) => Some(MessageSigner::new(key)?),
            None => None,
        };
        if config.require_signatures && signer.is_none() {
            return Err(McpError::Configuration(
                "require_signatures needs a signing_key".to_string(),
            ));
        }

        Ok(Self {
            config,
            signer,
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Install the handler for a message type, replacing any previous one
    pub fn register_handler(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        debug!("Registered handler for {} messages", kind);
        self.handlers.write().insert(kind, handler);
    }

    /// Whether a handler is installed for `kind`
    pub fn has_handler(&self, kind: MessageType) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Validate and, when a key is configured, sign a message before send
    pub fn prepare_outgoing(&self, message: Message) -> Result<Message> {
        message.headers().validate()?;
        match &self.signer {
            Some(signer) => Ok(signer.sign_message(message)?),
            None => Ok(message),
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(message.to_wire()?)
    }

    /// Decode wire bytes, re-running every message validation
    pub fn decode(&self, bytes: &[u8]) -> Result<Message> {
        Ok(Message::from_wire(bytes)?)
    }

    /// Check an inbound signature.
    ///
    /// A present signature is always checked when a key is configured;
    /// an absent one is only an error when signatures are required.
    pub fn verify(&self, message: &Message) -> Result<()> {
        let signature = message.headers().auth_signature();
        match (&self.signer, signature) {
            (Some(signer), Some(_)) => {
                if signer.verify(message) {
                    Ok(())
                } else {
                    Err(McpError::Signature("signature does not match".to_string()))
                }
            }
            (_, None) if self.config.require_signatures => {
                Err(McpError::Signature("message is not signed".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Whether the message carries a signature this protocol verified
    pub fn is_authenticated(&self, message: &Message) -> bool {
        self.signer
            .as_ref()
            .is_some_and(|signer| signer.verify(message))
    }

    /// Verify and dispatch a decoded message; never fails, every problem
    /// becomes an `error` response
    pub async fn handle_incoming(&self, message: Message) -> Response {
        let trace_id = message.trace_id().to_string();
        let kind = message.message_type();

        if let Err(e) = self.verify(&message) {
            warn!("Rejected {} message {} from {}: {}", kind, trace_id, message.headers().caller(), e);
            return Response::error(ErrorCode::InvalidSignature, e.to_string()).with_trace_id(trace_id);
        }

        let handler = self.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            debug!("No handler for {} message {}", kind, trace_id);
            return Response::error(
                ErrorCode::NoHandler,
                format!("No handler registered for message type '{}'", kind),
            )
            .with_trace_id(trace_id);
        };

        match handler.handle(message).await {
            Ok(mut response) if response.is_well_formed() => {
                if response.trace_id.is_none() {
                    response.trace_id = Some(trace_id);
                }
                response
            }
            Ok(_) => {
                warn!("Handler for {} returned a malformed response", kind);
                Response::error(
                    ErrorCode::InvalidHandlerResponse,
                    format!("Handler for '{}' returned a malformed response", kind),
                )
                .with_trace_id(trace_id)
            }
            Err(e) => {
                debug!("Handler for {} message {} failed: {}", kind, trace_id, e);
                Response::error(e.error_code(), e.to_string()).with_trace_id(trace_id)
            }
        }
    }

    /// Decode and dispatch raw bytes
    pub async fn handle_frame(&self, bytes: &[u8]) -> Response {
        match self.decode(bytes) {
            Ok(message) => self.handle_incoming(message).await,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                let response = Response::error(ErrorCode::ValidationError, format!("Invalid message: {}", e));
                match frame_trace_id(bytes) {
                    Some(trace_id) => response.with_trace_id(trace_id),
                    None => response,
                }
            }
        }
    }
}

/// Best-effort trace id of a frame that failed validation
fn frame_trace_id(bytes: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value
        .get("headers")?
        .get("trace-id")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
