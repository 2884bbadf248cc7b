//! Request/response shapes of the QR login handshake service.
//!
//! The artifact endpoint answers in several loosely-typed shapes. They are
//! decoded here into `QrCodePayload` and normalized once into `QrArtifact`;
//! nothing past this module sees the raw variants.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

const DATA_URI_PREFIX: &str = "data:";
const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

// ────────────────────────────────────────────────────────────────────────────
// POST /start
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StartResponse {
    /// The flow is live when freshly started or already running server-side.
    pub fn flow_started(&self) -> bool {
        self.success || self.status.as_deref() == Some("in_progress")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// GET /status
// ────────────────────────────────────────────────────────────────────────────

/// Server-side handshake status. Anything other than success/failed means "keep waiting".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLoginStatus {
    Waiting,
    Success,
    Failed,
    Other(String),
}

impl<'de> Deserialize<'de> for RemoteLoginStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "waiting" => RemoteLoginStatus::Waiting,
            "success" => RemoteLoginStatus::Success,
            "failed" => RemoteLoginStatus::Failed,
            _ => RemoteLoginStatus::Other(raw),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: RemoteLoginStatus,
    #[serde(default)]
    pub is_in_progress: Option<bool>,
    #[serde(default)]
    pub elapsed_seconds: Option<u64>,
}

// ────────────────────────────────────────────────────────────────────────────
// GET /qrcode
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QrCodeData {
    #[serde(default, rename = "qrcodeBase64")]
    pub qrcode_base64: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Every shape the artifact endpoint is known to return.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QrCodePayload {
    Raw(String),
    Wrapped {
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        data: Option<QrCodeData>,
        #[serde(default, rename = "qrcodeBase64")]
        qrcode_base64: Option<String>,
        #[serde(default)]
        image: Option<String>,
    },
}

impl QrCodePayload {
    /// Collapses the payload to a canonical artifact, or `None` if no image is present yet.
    pub fn normalize(self) -> Option<QrArtifact> {
        let encoded = match self {
            QrCodePayload::Raw(s) => Some(s),
            QrCodePayload::Wrapped {
                success,
                data,
                qrcode_base64,
                image,
            } => {
                if success == Some(false) {
                    return None;
                }
                let data = data.unwrap_or_default();
                data.qrcode_base64
                    .filter(|s| !s.is_empty())
                    .or(data.image.filter(|s| !s.is_empty()))
                    .or(qrcode_base64.filter(|s| !s.is_empty()))
                    .or(image)
            }
        }?;
        QrArtifact::from_encoded(&encoded)
    }
}

/// Decodes an artifact response body. JSON `null` means "not ready".
pub fn parse_qrcode_body(body: &str) -> Result<Option<QrArtifact>, serde_json::Error> {
    let payload: Option<QrCodePayload> = serde_json::from_str(body)?;
    Ok(payload.and_then(QrCodePayload::normalize))
}

/// The scannable login code, always held as a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QrArtifact(String);

impl QrArtifact {
    pub fn from_encoded(encoded: &str) -> Option<Self> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return None;
        }
        if encoded.starts_with(DATA_URI_PREFIX) {
            Some(Self(encoded.to_string()))
        } else {
            Some(Self(format!("{PNG_DATA_URI_PREFIX}{encoded}")))
        }
    }

    pub fn data_uri(&self) -> &str {
        &self.0
    }

    /// Raw image bytes behind the data URI.
    pub fn decode_png(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let payload = self
            .0
            .split_once(";base64,")
            .map(|(_, b64)| b64)
            .unwrap_or(&self.0);
        STANDARD.decode(payload)
    }
}
