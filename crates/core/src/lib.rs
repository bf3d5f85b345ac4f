pub mod config;
pub mod error;
pub mod stage;
pub mod types;

pub use config::AppConfig;
pub use error::{AdweaveError, AdweaveResult};
pub use stage::{next_contract, Stage, StageContract, MAX_RETRY};
