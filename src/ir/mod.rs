pub mod def;
pub mod verify;

pub use def::*;
