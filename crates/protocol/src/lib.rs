pub mod config;
pub mod envelope;
pub mod events;
pub mod types;

pub use config::*;
pub use envelope::*;
pub use events::*;
pub use types::*;
