use std::collections::BTreeSet;

use crate::{Frame, Item, Sequence};

/// An item boundary (clip start or end) on the timeline, used by the preview
/// subsystem to prewarm frames around cut points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub frame: Frame,
    pub is_start: bool,
}

impl Sequence {
    /// Visual items covering `frame`, top-most track first (lower index wins,
    /// matching the preview compositing priority).
    pub fn visual_items_at(&self, frame: Frame) -> Vec<&Item> {
        self.tracks
            .iter()
            .flat_map(|track| track.items.iter())
            .filter(|item| item.kind.is_visual() && item.contains(frame))
            .collect()
    }

    /// All items intersecting the half-open range `[start, end)`.
    pub fn items_intersecting(&self, start: Frame, end: Frame) -> Vec<&Item> {
        self.tracks
            .iter()
            .flat_map(|track| track.items.iter())
            .filter(|item| item.intersects(start, end))
            .collect()
    }

    /// Deduplicated media ids referenced by items intersecting `[start, end)`.
    pub fn media_ids_in(&self, start: Frame, end: Frame) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for item in self.items_intersecting(start, end) {
            if let Some(id) = item.kind.media_id() {
                if seen.insert(id.to_string()) {
                    out.push(id.to_string());
                }
            }
        }
        out
    }

    /// Every media id referenced anywhere in the sequence.
    pub fn referenced_media_ids(&self) -> Vec<String> {
        self.media_ids_in(Frame::MIN / 2, Frame::MAX / 2)
    }

    /// Clip boundaries within `radius` frames of `anchor`, nearest first.
    pub fn boundaries_near(&self, anchor: Frame, radius: Frame) -> Vec<Boundary> {
        let mut out: Vec<Boundary> = Vec::new();
        for track in &self.tracks {
            for item in &track.items {
                for (frame, is_start) in [(item.from, true), (item.end(), false)] {
                    if (frame - anchor).abs() <= radius {
                        out.push(Boundary { frame, is_start });
                    }
                }
            }
        }
        out.sort_by_key(|b| (b.frame - anchor).abs());
        out.dedup();
        out
    }

    /// Stable structural description of tracks/items/keyframes/dimensions.
    /// Any change to it means composition renderers built against the old
    /// structure must be discarded.
    pub fn structure_digest_input(&self) -> String {
        let mut buf = format!("{}x{}@{}/{}", self.width, self.height, self.fps.num, self.fps.den);
        for track in &self.tracks {
            buf.push('|');
            buf.push_str(&track.name);
            for item in &track.items {
                buf.push(';');
                buf.push_str(&item.id);
                buf.push_str(&format!(
                    ":{}+{}:{}",
                    item.from,
                    item.duration_in_frames,
                    item.kind.media_id().unwrap_or("-")
                ));
                for kf in &item.keyframes {
                    buf.push_str(&format!(",{}={}@{}", kf.property, kf.value, kf.frame));
                }
            }
        }
        buf
    }
}
