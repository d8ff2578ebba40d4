pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod mutex;
pub mod paths;
pub mod progress;
pub mod runner;
pub mod settings;
pub mod store;
