pub mod image_saved;
pub mod notifier;

pub use image_saved::*;
pub use notifier::*;
