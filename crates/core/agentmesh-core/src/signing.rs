//! HMAC-SHA256 message signing with a shared key.

use crate::error::{CoreError, CoreResult};
use crate::message::Message;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies messages with a shared secret
#[derive(Clone)]
pub struct MessageSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for MessageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSigner").field("key", &"<redacted>").finish()
    }
}

impl MessageSigner {
    /// Create a signer; the key must not be empty
    pub fn new(key: impl AsRef<[u8]>) -> CoreResult<Self> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(CoreError::signature("signing key must not be empty"));
        }
        Ok(Self { key: key.to_vec() })
    }

    fn mac(&self, message: &Message) -> CoreResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| CoreError::signature(format!("invalid signing key: {e}")))?;
        mac.update(&message.canonical_bytes()?);
        Ok(mac)
    }

    /// Hex signature over the message with its signature field cleared
    pub fn sign(&self, message: &Message) -> CoreResult<String> {
        let mac = self.mac(message)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Return a signed copy of the message
    pub fn sign_message(&self, message: Message) -> CoreResult<Message> {
        let signature = self.sign(&message)?;
        Ok(message.with_signature(signature))
    }

    /// Check the message signature in constant time.
    ///
    /// Unsigned messages and undecodable signatures never verify.
    pub fn verify(&self, message: &Message) -> bool {
        let Some(signature) = message.headers().auth_signature() else {
            return false;
        };
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        match self.mac(message) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use crate::message::MessageType;
    use serde_json::{json, Map};

    fn message(text: &str) -> Message {
        let headers = Headers::new("tenant", "mcp://agent-a/receive_callback", "agent-a").unwrap();
        let mut payload = Map::new();
        payload.insert("text".into(), json!(text));
        Message::new(MessageType::ToolCall, headers, payload).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = MessageSigner::new("shared-secret").unwrap();
        let signed = signer.sign_message(message("hi")).unwrap();
        assert!(signed.headers().auth_signature().is_some());
        assert!(signer.verify(&signed));

        let decoded = Message::from_wire(&signed.to_wire().unwrap()).unwrap();
        assert!(signer.verify(&decoded));
    }

    #[test]
    fn test_rejects_tampering_and_wrong_key() {
        let signer = MessageSigner::new("shared-secret").unwrap();
        let signed = signer.sign_message(message("hi")).unwrap();

        let other = MessageSigner::new("other-secret").unwrap();
        assert!(!other.verify(&signed));

        let signature = signed.headers().auth_signature().unwrap().to_string();
        let forged = message("bye").with_signature(signature);
        assert!(!signer.verify(&forged));

        assert!(!signer.verify(&message("hi")));
        assert!(!signer.verify(&message("hi").with_signature("not-hex")));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(MessageSigner::new("").is_err());
    }
}
