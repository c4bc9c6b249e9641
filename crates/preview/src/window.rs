use timeline::Frame;

use crate::mode::InteractionMode;

/// Inclusive frame span that should be kept hot. May extend below zero; the
/// timeline query layer simply finds nothing there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadWindow {
    pub start_frame: Frame,
    pub end_frame: Frame,
}

impl PreloadWindow {
    pub fn width(&self) -> Frame {
        self.end_frame - self.start_frame
    }
}

/// Preload window around the anchor. Playback and forward scrubs look ahead
/// only; backward scrubs flip the window behind the playhead so decode
/// bandwidth is not wasted opposite the direction of travel; a scrub with no
/// established direction gets a centered window of the same total width.
pub fn preload_window(
    mode: InteractionMode,
    anchor_frame: Frame,
    scrub_direction: i32,
    fps: i64,
    ahead_seconds: i64,
) -> PreloadWindow {
    let width = fps * ahead_seconds;
    match (mode, scrub_direction) {
        (InteractionMode::Scrubbing, d) if d < 0 => PreloadWindow {
            start_frame: anchor_frame - width,
            end_frame: anchor_frame,
        },
        (InteractionMode::Scrubbing, 0) => {
            let start_frame = anchor_frame - width / 2;
            PreloadWindow {
                start_frame,
                end_frame: start_frame + width,
            }
        }
        _ => PreloadWindow {
            start_frame: anchor_frame,
            end_frame: anchor_frame + width,
        },
    }
}
