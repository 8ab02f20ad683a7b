pub mod index;
pub mod record;

pub use index::*;
pub use record::*;
