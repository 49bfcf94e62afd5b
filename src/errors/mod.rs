mod separation_error;

pub use separation_error::{Result, SeparationError};
