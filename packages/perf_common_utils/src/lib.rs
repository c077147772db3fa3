pub mod env;
pub mod sync;
