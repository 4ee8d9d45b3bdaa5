pub mod crypto;
pub mod error;
pub mod types;

pub use crypto::*;
pub use error::*;
pub use types::*;
