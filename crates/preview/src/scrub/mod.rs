pub mod prewarm;
pub mod renderer;

use std::collections::HashMap;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use timeline::{Frame, Sequence};

use crate::resolve::ResolvedSource;

/// CPU-side RGBA frame produced by the fast-scrub renderer.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Where finished scrub frames go (a texture uploader, a window surface, a
/// test collector).
pub trait FrameSink: Send + Sync {
    fn present(&self, frame: Frame, buffer: FrameBuffer);
}

/// Everything a renderer needs to composite the sequence at a frame.
#[derive(Clone)]
pub struct CompositionProps {
    pub sequence: Arc<Sequence>,
    pub resolved: Arc<HashMap<String, ResolvedSource>>,
    /// Effective quality multiplier, 1.0 = full resolution. Size-dependent
    /// visual parameters must be scaled by the same factor so reduced
    /// quality changes sampling resolution, not apparent geometry.
    pub quality: f32,
    /// Render-target dimensions, already scaled by `quality`.
    pub target_width: u32,
    pub target_height: u32,
}

/// Offline compositor used for scrub frames. Constructed per composition
/// shape; `preload` is the potentially slow warm-up the caller bounds with a
/// timeout.
pub trait CompositionRenderer: Send {
    /// Blocking warm-up (decoder init, first GOP decode). Safe to skip; the
    /// first renders are just slower.
    fn preload(&mut self, props: &CompositionProps) -> anyhow::Result<()>;

    /// Render the user-facing frame at full priority.
    fn render_frame(&mut self, props: &CompositionProps, frame: Frame) -> anyhow::Result<FrameBuffer>;

    /// Speculative render whose output is only cached, never presented.
    fn prewarm_frame(&mut self, props: &CompositionProps, frame: Frame) -> anyhow::Result<()>;
}

/// Builds renderers; the fast-scrub worker reconstructs one whenever the
/// composition fingerprint changes.
pub trait RendererFactory: Send + Sync {
    fn create(&self, props: &CompositionProps) -> anyhow::Result<Box<dyn CompositionRenderer>>;
}

/// Whether the fast-scrub overlay should cover the primary player right now.
/// The overlay is only trustworthy while an uncommitted scrub position exists
/// and the last rendered frame matches it exactly; any mismatch falls back to
/// the player underneath rather than showing a stale frame.
pub fn should_show_fast_scrub_overlay(
    is_playing: bool,
    is_gizmo_interacting: bool,
    preview_frame: Option<Frame>,
    rendered_frame: Option<Frame>,
) -> bool {
    if is_playing || is_gizmo_interacting {
        return false;
    }
    match (preview_frame, rendered_frame) {
        (Some(wanted), Some(rendered)) => wanted == rendered,
        _ => false,
    }
}

/// Stable digest of the sequence structure (dimensions, fps, track/item
/// layout, keyframes). Content changes that do not alter this digest do not
/// require a renderer rebuild.
pub fn composition_fingerprint(sequence: &Sequence) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sequence.structure_digest_input().as_bytes());
    format!("{:x}", hasher.finalize())
}
