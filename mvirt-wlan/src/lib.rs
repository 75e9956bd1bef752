pub mod config;
pub mod datapath;
pub mod error;
pub mod recovery;
pub mod sim;
pub mod stats;

pub use config::RxConfig;
pub use error::{Result, RxError};
