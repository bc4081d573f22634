pub mod engine;
pub mod ids;
pub mod resolver;
pub mod store;
