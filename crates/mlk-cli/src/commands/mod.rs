mod compile;
mod config;
mod inspect;
mod install;

pub use compile::*;
pub use config::*;
pub use inspect::*;
pub use install::*;
