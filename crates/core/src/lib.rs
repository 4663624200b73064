pub mod digits;
pub mod errors;
pub mod ladder;
pub mod models;
pub mod traits;

pub use errors::*;
pub use ladder::StakeLadder;
pub use models::*;
pub use traits::*;
