use crate::mode::{resolve_mode, InteractionMode};
use crate::store::PlaybackSnapshot;

/// Why the scheduler should fire extra preload work right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreloadBurst {
    None,
    /// Preview frame went null -> non-null while paused: latency-sensitive,
    /// re-prioritize resolution around the new anchor immediately.
    ScrubEnter,
    /// Ruler-click style `current_frame` jump while paused and not scrubbing:
    /// front-load media near the new position before play is pressed.
    PausedShortSeek,
}

/// Deterministic classification of one playback-state change. No I/O, never
/// fails.
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    pub mode: InteractionMode,
    pub current_frame_changed: bool,
    pub preview_frame_changed: bool,
    pub entered_playing: bool,
    pub exited_playing: bool,
    /// True when the primary player must not seek to `current_frame`: during
    /// a gizmo drag, and while the scrub path owns seeking (a duplicate seek
    /// from `current_frame` would race it and stutter).
    pub should_skip_current_frame_seek: bool,
    pub burst: PreloadBurst,
}

pub fn classify(prev: &PlaybackSnapshot, next: &PlaybackSnapshot) -> Transition {
    let mode = resolve_mode(
        next.is_playing,
        next.preview_frame,
        next.is_gizmo_interacting,
    );
    let current_frame_changed = prev.current_frame != next.current_frame;
    let preview_frame_changed = prev.preview_frame != next.preview_frame;
    let entered_playing = !prev.is_playing && next.is_playing;
    let exited_playing = prev.is_playing && !next.is_playing;

    let should_skip_current_frame_seek = match mode {
        InteractionMode::GizmoDragging => true,
        InteractionMode::Scrubbing => preview_frame_changed,
        _ => false,
    };

    let burst = if mode == InteractionMode::Scrubbing
        && prev.preview_frame.is_none()
        && next.preview_frame.is_some()
    {
        PreloadBurst::ScrubEnter
    } else if mode == InteractionMode::Paused && current_frame_changed {
        PreloadBurst::PausedShortSeek
    } else {
        PreloadBurst::None
    };

    Transition {
        mode,
        current_frame_changed,
        preview_frame_changed,
        entered_playing,
        exited_playing,
        should_skip_current_frame_seek,
        burst,
    }
}
