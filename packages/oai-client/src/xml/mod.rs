//! XML helpers shared by the response parsers.

mod utils;

pub use utils::*;
