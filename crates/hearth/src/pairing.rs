use serde::{Deserialize, Serialize};

use crate::role::Role;

/// How the shared pairing code is obtained by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PairingMode {
    /// A fixed code printed on the device label.
    EmbeddedCode,
    /// A freshly generated 4-digit PIN shown by the device.
    PinCode,
}

/// The key-agreement protocol negotiated for a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CryptoKind {
    /// Single-round P-224 encrypted key exchange.
    #[serde(rename = "p224-spake")]
    P224Spake,
    /// No key agreement; only usable when security is disabled.
    #[serde(rename = "none")]
    None,
}

/// Request body of the `pairingStart` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStartRequest {
    /// Requested pairing mode.
    pub pairing: PairingMode,
    /// Requested key-agreement protocol.
    pub crypto: CryptoKind,
}

/// Response body of the `pairingStart` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStartResponse {
    /// Opaque id of the freshly opened session.
    pub session_id: String,
    /// Base64 of the device's key-exchange message.
    pub device_commitment: String,
}

/// Request body of the `pairingConfirm` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingConfirmRequest {
    /// Id of the session being confirmed.
    pub session_id: String,
    /// Base64 of the client's key-exchange message.
    pub client_commitment: String,
}

/// Response body of the `pairingConfirm` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingConfirmResponse {
    /// Base64 of the device's TLS certificate fingerprint.
    pub certificate_fingerprint: String,
    /// Base64 of HMAC-SHA256(session key, certificate fingerprint).
    pub signature: String,
}

/// Response body of the `authenticate` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateResponse {
    /// Base64 of the freshly issued access token.
    pub access_token: String,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    /// Role granted by the token.
    pub scope: Role,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{deserialize, serialize};

    use super::{CryptoKind, PairingMode, PairingStartRequest, PairingStartResponse};

    #[test]
    fn wire_names() {
        assert_eq!(serialize(PairingMode::EmbeddedCode), json!("embeddedCode"));
        assert_eq!(serialize(PairingMode::PinCode), json!("pinCode"));
        assert_eq!(serialize(CryptoKind::P224Spake), json!("p224-spake"));
        assert_eq!(serialize(CryptoKind::None), json!("none"));
    }

    #[test]
    fn request_round_trip() {
        let request = PairingStartRequest {
            pairing: PairingMode::PinCode,
            crypto: CryptoKind::P224Spake,
        };
        assert_eq!(
            serialize(&request),
            json!({"pairing": "pinCode", "crypto": "p224-spake"})
        );
        assert_eq!(deserialize::<PairingStartRequest>(serialize(&request)), request);
    }

    #[test]
    fn response_field_names() {
        let response = PairingStartResponse {
            session_id: "123".into(),
            device_commitment: "YWJj".into(),
        };
        assert_eq!(
            serialize(response),
            json!({"sessionId": "123", "deviceCommitment": "YWJj"})
        );
    }
}
