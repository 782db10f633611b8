//! Shared type definitions for the Kontext pipeline client.
//!
//! These are plain data types with no I/O: surfaces and stage labels used to
//! key timers and diagnostics, the run lifecycle enums, and the opaque
//! [`Artifact`] payload handed between stages and out to the presentation
//! layer. The event stream types live in [`event`].

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod event;

pub use event::{RunEvent, RunOutcome};

/// Identifies the display surface a run reports to.
///
/// Diagnostics are conventionally tagged with the surface, e.g. `[Step1]`.
/// The generate flow owns `Step1`; the refine flow owns `Step2`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Surface {
    Step1,
    Step2,
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step1 => write!(f, "[Step1]"),
            Self::Step2 => write!(f, "[Step2]"),
        }
    }
}

/// Label of one elapsed-time tracker within a run.
///
/// `Total` spans the whole workflow; `Flux` and `Nano` bracket the two
/// generate stages. The refine flow uses `Total` only.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum StageLabel {
    Total,
    Flux,
    Nano,
}

impl fmt::Display for StageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Total => write!(f, "Total"),
            Self::Flux => write!(f, "Flux"),
            Self::Nano => write!(f, "Nano"),
        }
    }
}

/// Lifecycle phase of a pipeline slot.
///
/// Single-stage flows (refine) run entirely under `Stage1Running`;
/// `Stage2Running` is reached only by the two-stage generate flow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunPhase {
    #[default]
    Idle,
    Stage1Running,
    Stage2Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunPhase {
    /// True while a run is in flight and may still settle either way.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Stage1Running | Self::Stage2Running)
    }

    /// True once a run has settled. `Idle` is not terminal; it precedes a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Stage1Running => "stage1-running",
            Self::Stage2Running => "stage2-running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Opaque byte-bearing payload produced by a stage.
///
/// The core never interprets artifact contents; it only caches them, resends
/// them in multipart forms, and hands them to the presentation layer. Clones
/// are cheap (shared allocation).
#[derive(Clone, Eq, PartialEq)]
pub struct Artifact {
    bytes: Arc<[u8]>,
}

impl Artifact {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into().into(),
        }
    }

    /// Decode a backend image payload into raw bytes.
    ///
    /// Accepts either a bare base64 string or a data URL
    /// (`data:image/png;base64,...`); the media-type prefix is discarded.
    pub fn from_data_url(payload: &str) -> Result<Self, ArtifactDecodeError> {
        let encoded = match payload.split_once(',') {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => payload,
        };
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|source| ArtifactDecodeError { source })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact").field("len", &self.len()).finish()
    }
}

/// The artifact payload was not valid base64.
#[derive(Debug, Error)]
#[error("artifact payload is not valid base64: {source}")]
pub struct ArtifactDecodeError {
    #[source]
    source: base64::DecodeError,
}

/// Content signature of a source image, used to skip recomputing Stage1 when
/// the input has not changed. Supplied by the input-provisioning layer;
/// compared for equality only.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InputSignature(String);

impl InputSignature {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Signature from a file name and content length, mirroring the
    /// `name|size` convention the provisioning layer uses.
    pub fn from_parts(file_name: &str, len: usize) -> Self {
        Self(format!("{}|{}", file_name, len))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InputSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One uploaded source image plus its content signature.
#[derive(Clone, Debug)]
pub struct SourceImage {
    pub data: Artifact,
    pub file_name: String,
    pub signature: InputSignature,
}

impl SourceImage {
    pub fn new(bytes: impl Into<Vec<u8>>, file_name: impl Into<String>) -> Self {
        let data = Artifact::from_bytes(bytes);
        let file_name = file_name.into();
        let signature = InputSignature::from_parts(&file_name, data.len());
        Self {
            data,
            file_name,
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_decodes_bare_base64() {
        let artifact = Artifact::from_data_url("aGVsbG8=").expect("decode");
        assert_eq!(artifact.as_bytes(), b"hello");
    }

    #[test]
    fn artifact_decodes_data_url_and_drops_prefix() {
        let artifact = Artifact::from_data_url("data:image/png;base64,aGVsbG8=").expect("decode");
        assert_eq!(artifact.as_bytes(), b"hello");
        assert_eq!(artifact.len(), 5);
    }

    #[test]
    fn artifact_rejects_garbage() {
        assert!(Artifact::from_data_url("not base64 at all!").is_err());
    }

    #[test]
    fn signature_tracks_name_and_length() {
        let a = SourceImage::new(vec![0u8; 16], "character.png");
        let b = SourceImage::new(vec![1u8; 16], "character.png");
        let c = SourceImage::new(vec![0u8; 17], "character.png");
        assert_eq!(a.signature, b.signature);
        assert_ne!(a.signature, c.signature);
    }

    #[test]
    fn phase_classification() {
        assert!(RunPhase::Stage1Running.is_running());
        assert!(RunPhase::Stage2Running.is_running());
        assert!(!RunPhase::Idle.is_running());
        assert!(!RunPhase::Idle.is_terminal());
        assert!(RunPhase::Cancelled.is_terminal());
    }
}
