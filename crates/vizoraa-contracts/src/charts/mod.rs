mod normalize;
mod packed;

pub use normalize::{normalize, ChartFailure, ChartOutcome, RenderableChart};
pub use packed::{decode_packed_doubles, DecodeError};
