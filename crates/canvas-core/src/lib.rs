//! In-memory canvas engine: the pixel grid, its incremental aggregates, and the
//! memoized serialized view handed to spectators and archive writers.

pub mod error;
pub mod grid;
pub mod history;
pub mod palette;
pub mod state;
pub mod stats;

pub use error::CanvasError;
pub use grid::{Cell, GridStore};
pub use history::{PlacementHistory, PlacementRecord, HISTORY_CAPACITY};
pub use palette::Color;
pub use state::{CanvasState, StateCache};
pub use stats::{ColorCounts, OwnershipCache, OWNERSHIP_TTL};
