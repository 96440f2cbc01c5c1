pub mod clienv;
pub mod config;
pub mod error;
pub mod http_server;
pub mod logging;
pub mod supervisor;

pub use config::WrapperConfig;
pub use error::{Result, WrapperError};
pub use supervisor::Supervisor;
