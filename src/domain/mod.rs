pub mod events;
pub mod market;
pub mod order;
pub mod state;

pub use events::*;
pub use market::*;
pub use order::*;
pub use state::*;
