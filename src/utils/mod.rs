pub mod error;

pub use error::{FrameError, ServerError};
