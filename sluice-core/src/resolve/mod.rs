//! Source resolution: redirect following and playback classification

pub mod classify;
pub mod redirect;

pub use classify::{PlaybackKind, classify};
pub use redirect::{RedirectResolver, ResolvedSource, UpstreamHeaders};
