//! Preview playback and scrub-rendering pipeline for the editor.
//!
//! The pieces, roughly in data-flow order: [`store::PlaybackStore`] holds the
//! authoritative playback state; [`transition::classify`] turns each change
//! into a deterministic action set; [`resolve::scheduler::ResolveScheduler`]
//! converts preload-window media ids into playable URLs with dedup and
//! backoff; [`warm_set::SourceWarmSet`] keeps nearby decoders open;
//! [`scrub::renderer::FastScrub`] renders scrub frames latest-wins beside the
//! primary player; [`quality::AdaptiveQuality`] trades resolution for frame
//! rate under load. [`controller::PreviewController`] wires it all together.

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod mode;
pub mod quality;
pub mod resolve;
pub mod sched;
pub mod scrub;
pub mod store;
pub mod telemetry;
pub mod transition;
pub mod warm_set;
pub mod window;

pub use config::PreviewConfig;
pub use controller::{PlayerHandle, PreviewController};
pub use error::PreviewError;
pub use mode::{anchor_frame, resolve_mode, InteractionMode};
pub use store::{PlaybackSnapshot, PlaybackStore};
pub use telemetry::{PreviewStats, StatsSnapshot};
