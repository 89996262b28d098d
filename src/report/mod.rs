//! Deterministic `|`-delimited reports over decoded captures.
//!
//! Both report kinds hold their aggregates plus the text rendered from them
//! once; the text never depends on wall-clock time or hash iteration order.

pub mod analysis;
pub mod render;
pub mod timeline;

pub use analysis::{generate, AnalysisReport, CaptureStats};
pub use timeline::{correlate, correlate_with, TimelineOptions, TimelineReport, MIN_CAPTURES};
