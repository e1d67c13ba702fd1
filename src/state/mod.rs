pub mod packet;
pub mod trace;

pub use packet::*;
pub use trace::*;
