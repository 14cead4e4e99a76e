pub mod aggregate;
pub mod basket;
pub mod completeness;
pub mod engine;
pub mod error;
pub mod resolve;
pub mod store;

pub mod test_support;

pub use aggregate::{Aggregate, BasketFold};
pub use basket::{Basket, BasketCall, BasketResult};
pub use engine::TaskEngine;
pub use error::EngineError;
pub use resolve::{ConflictResolver, Resolved, SourceValue};
pub use store::TaskStore;
