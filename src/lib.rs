pub mod backbone;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod inference;
pub mod labels;
pub mod loader;
pub mod model;
pub mod server;
pub mod utils;
