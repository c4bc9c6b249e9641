use serde::{Deserialize, Serialize};
use timeline::Frame;

/// What the user is currently doing to the timeline. Derived on demand from
/// playback state, never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionMode {
    Playing,
    GizmoDragging,
    Scrubbing,
    Paused,
}

impl InteractionMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::GizmoDragging => "gizmo_dragging",
            Self::Scrubbing => "scrubbing",
            Self::Paused => "paused",
        }
    }
}

/// Precedence: playing > gizmo drag > scrubbing > paused.
pub fn resolve_mode(
    is_playing: bool,
    preview_frame: Option<Frame>,
    is_gizmo_interacting: bool,
) -> InteractionMode {
    if is_playing {
        InteractionMode::Playing
    } else if is_gizmo_interacting {
        InteractionMode::GizmoDragging
    } else if preview_frame.is_some() {
        InteractionMode::Scrubbing
    } else {
        InteractionMode::Paused
    }
}

/// The frame position the user is actually looking at. Every downstream
/// scheduler must go through this; diverging notions of "current position"
/// are how preload and seek end up fighting each other.
pub fn anchor_frame(
    mode: InteractionMode,
    current_frame: Frame,
    preview_frame: Option<Frame>,
) -> Frame {
    match mode {
        InteractionMode::Scrubbing => preview_frame.unwrap_or(current_frame),
        _ => current_frame,
    }
}
