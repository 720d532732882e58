#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate lazy_static;

pub mod crawler;
pub mod elevation;
pub mod enrichment;
pub mod feature_collection;
pub mod fetcher;
pub mod geocoding;
pub mod queue;
pub mod reconcile;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
pub mod utils;
