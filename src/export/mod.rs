pub mod chunk;
pub mod stream;

pub use chunk::*;
pub use stream::*;
