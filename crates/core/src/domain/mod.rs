mod plan;
mod state;
mod storage;

pub use plan::*;
pub use state::*;
pub use storage::*;
