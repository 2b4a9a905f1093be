pub mod config;
pub mod error;
pub mod job;
pub mod source;

pub use config::Config;
pub use error::*;
pub use job::*;
pub use source::*;
