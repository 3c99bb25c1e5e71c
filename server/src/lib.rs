pub mod api;
pub mod backup;
pub mod config;
pub mod episodes;
pub mod error;
pub mod graph;
pub mod llm;
pub mod model;
pub mod normalize;
pub mod router;
pub mod store;
pub mod transport;
pub mod worker;
