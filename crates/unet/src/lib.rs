pub mod config;
pub mod model;

pub use config::UNetConfig;
pub use model::UNet;
