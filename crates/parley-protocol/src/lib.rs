mod envelope;
mod error;
mod frame;

pub use envelope::*;
pub use error::*;
pub use frame::*;
