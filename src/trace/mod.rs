pub mod engine;
pub mod pool;

pub use engine::*;
pub use pool::*;
