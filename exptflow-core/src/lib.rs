//! exptflow Core - Entity Types
//!
//! Data structures, status machines, the schedule event wire schema and the
//! contracts of every external collaborator. No I/O lives here; the storage
//! crate and the engine crate build on top of these types.

mod entities;
mod enums;
mod error;
mod event;
mod lease;
pub mod services;

pub use entities::*;
pub use enums::*;
pub use error::*;
pub use event::*;
pub use lease::*;
