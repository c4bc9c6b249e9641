pub mod backoff;
pub mod scheduler;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Resolves abstract media ids to playable URLs. Implementations talk to the
/// asset store, an IPC bridge, or a test double; resolution may be slow and
/// may transiently fail, which is why the scheduler wraps every call in
/// dedup + backoff.
pub trait MediaResolver: Send + Sync {
    /// Playable URL for the original asset. `Ok(None)` means the id is
    /// unknown (not an error, but nothing to play either).
    fn resolve_media_url(&self, media_id: &str) -> anyhow::Result<Option<String>>;

    /// URL of a scrub-friendly proxy rendition, if one has been generated.
    fn resolve_proxy_url(&self, _media_id: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    /// Container/codec metadata used to score decode cost.
    fn media_info(&self, _media_id: &str) -> Option<MediaInfo> {
        None
    }
}

/// Broad codec buckets ranked by decode expense on a typical desktop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecFamily {
    H264,
    Hevc,
    Av1,
    ProRes,
    Vp9,
    Image,
    Other,
}

impl CodecFamily {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("h264") || lower.contains("avc") {
            CodecFamily::H264
        } else if lower.contains("hevc") || lower.contains("h265") || lower.contains("hvc1") {
            CodecFamily::Hevc
        } else if lower.contains("av1") || lower.contains("av01") {
            CodecFamily::Av1
        } else if lower.contains("prores") {
            CodecFamily::ProRes
        } else if lower.contains("vp9") || lower.contains("vp09") {
            CodecFamily::Vp9
        } else if lower.contains("png") || lower.contains("jpeg") || lower.contains("jpg") {
            CodecFamily::Image
        } else {
            CodecFamily::Other
        }
    }

    /// Relative decode expense, 1.0 = easy h264.
    pub fn base_cost(self) -> f64 {
        match self {
            CodecFamily::H264 => 1.0,
            CodecFamily::Vp9 => 2.0,
            CodecFamily::Hevc => 3.0,
            CodecFamily::ProRes => 3.5,
            CodecFamily::Av1 => 4.0,
            CodecFamily::Image => 0.5,
            CodecFamily::Other => 2.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub codec: CodecFamily,
    pub duration_seconds: f64,
}

impl MediaInfo {
    /// Decode cost estimate combining codec family and pixel count; 4K
    /// roughly quadruples the 1080p figure.
    pub fn decode_cost(&self) -> f64 {
        let pixels = self.width as f64 * self.height as f64;
        let pixel_factor = (pixels / (1920.0 * 1080.0)).max(0.25);
        self.codec.base_cost() * pixel_factor
    }
}

/// Which rendition a resolved URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedTier {
    Original,
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub url: String,
    pub tier: ResolvedTier,
}

impl ResolvedSource {
    pub fn original(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tier: ResolvedTier::Original,
        }
    }

    pub fn proxy(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tier: ResolvedTier::Proxy,
        }
    }
}

static PROXY_REGISTRY: Lazy<RwLock<HashMap<String, String>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Record a generated proxy rendition for `media_id`. Process-wide so the
/// background proxy pipeline can publish results without a handle to any
/// particular preview instance.
pub fn register_proxy(media_id: &str, proxy_url: &str) {
    PROXY_REGISTRY
        .write()
        .insert(media_id.to_string(), proxy_url.to_string());
}

pub fn lookup_proxy(media_id: &str) -> Option<String> {
    PROXY_REGISTRY.read().get(media_id).cloned()
}

pub fn clear_proxy_registry() {
    PROXY_REGISTRY.write().clear();
}
