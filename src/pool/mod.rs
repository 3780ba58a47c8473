pub mod book;
pub mod engine;
pub mod ledger;
pub mod position;
pub mod prices;
pub mod queue;

pub use engine::{Pool, PoolHandle};
pub use position::PositionId;
pub use prices::ManualPriceFeed;
