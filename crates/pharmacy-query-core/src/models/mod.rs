//! Domain models for the pharmacy query engine.

mod intent;
mod records;
mod result;
mod session;

pub use intent::*;
pub use records::*;
pub use result::*;
pub use session::*;
