use thiserror::Error;
use timeline::Frame;

/// Failure taxonomy for the preview subsystem. Nothing here is fatal to the
/// host; every variant degrades to the primary player's slower seek path.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("media resolution failed for {media_id}: {reason}")]
    Resolution { media_id: String, reason: String },

    #[error("media {media_id} marked broken after {failures} consecutive failures")]
    BrokenMedia { media_id: String, failures: u32 },

    #[error("scrub renderer unavailable: {0}")]
    Renderer(String),

    #[error("stale render discarded for frame {0}")]
    StaleRender(Frame),
}
