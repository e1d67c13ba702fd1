pub mod decode;
pub mod interface;
pub mod sniffer;

pub use decode::*;
pub use interface::*;
pub use sniffer::*;
