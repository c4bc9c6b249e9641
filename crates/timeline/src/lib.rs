use serde::{Deserialize, Serialize};
use thiserror::Error;

mod query;
pub use query::*;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("invalid operation: {0}")]
    InvalidOp(String),
    #[error("item not found: {0}")]
    ItemNotFound(String),
    #[error("track not found: {0}")]
    TrackNotFound(usize),
    #[error("item duration must be at least 1 frame, got {0}")]
    InvalidDuration(Frame),
}

pub type Frame = i64; // timeline time in frames; negatives allowed for window math

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fps {
    pub num: u32,
    pub den: u32,
}

impl Fps {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Whole frames per second, rounded. Preload windows are computed in
    /// integer frames so fractional rates round to the nearest frame count.
    pub fn rounded(&self) -> i64 {
        self.as_f64().round() as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ItemKind {
    #[serde(rename = "solid")]
    Solid { color: String },

    #[serde(rename = "text")]
    Text { text: String, color: String },

    #[serde(rename = "video")]
    Video {
        media_id: String,
        #[serde(default)]
        in_offset_frames: Frame,
    },

    #[serde(rename = "image")]
    Image { media_id: String },

    #[serde(rename = "audio")]
    Audio {
        media_id: String,
        #[serde(default)]
        in_offset_frames: Frame,
    },
}

impl ItemKind {
    pub fn media_id(&self) -> Option<&str> {
        match self {
            ItemKind::Video { media_id, .. }
            | ItemKind::Image { media_id }
            | ItemKind::Audio { media_id, .. } => Some(media_id),
            ItemKind::Solid { .. } | ItemKind::Text { .. } => None,
        }
    }

    pub fn is_visual(&self) -> bool {
        !matches!(self, ItemKind::Audio { .. })
    }
}

/// A single animated value sample attached to an item, in item-local frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyframe {
    pub frame: Frame,
    pub property: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub from: Frame,
    pub duration_in_frames: Frame,
    #[serde(flatten)]
    pub kind: ItemKind,
    #[serde(default)]
    pub keyframes: Vec<Keyframe>,
}

impl Item {
    pub fn new(from: Frame, duration_in_frames: Frame, kind: ItemKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from,
            duration_in_frames,
            kind,
            keyframes: Vec::new(),
        }
    }

    pub fn end(&self) -> Frame {
        self.from + self.duration_in_frames
    }

    pub fn contains(&self, frame: Frame) -> bool {
        frame >= self.from && frame < self.end()
    }

    /// Half-open intersection test against `[start, end)`.
    pub fn intersects(&self, start: Frame, end: Frame) -> bool {
        self.from < end && self.end() > start
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub items: Vec<Item>,
}

impl Track {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub duration_in_frames: Frame,
    pub tracks: Vec<Track>,
}

impl Sequence {
    pub fn new(
        name: impl Into<String>,
        width: u32,
        height: u32,
        fps: Fps,
        duration_in_frames: Frame,
    ) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            fps,
            duration_in_frames,
            tracks: Vec::new(),
        }
    }

    pub fn add_track(&mut self, track: Track) -> usize {
        self.tracks.push(track);
        self.tracks.len() - 1
    }

    pub fn add_item(&mut self, track_index: usize, item: Item) -> Result<(), TimelineError> {
        if item.duration_in_frames < 1 {
            return Err(TimelineError::InvalidDuration(item.duration_in_frames));
        }
        let track = self
            .tracks
            .get_mut(track_index)
            .ok_or(TimelineError::TrackNotFound(track_index))?;
        track.items.push(item);
        Ok(())
    }
}
