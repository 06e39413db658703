pub mod settings;

pub use settings::{Config, UnitMode, DEFAULT_REGION_SIZE};
