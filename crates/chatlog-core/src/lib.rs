mod model;
pub mod time;

pub use model::*;
pub use time::{CivilDateRange, CivilZone, TimeError, TimeWindow};
