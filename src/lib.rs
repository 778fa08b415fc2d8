pub mod apps;
pub mod assistant;
pub mod config;
pub mod engine;
pub mod frontend;
pub mod logger;
pub mod model;
pub mod thingpedia;
pub mod util;
pub mod webhook;
