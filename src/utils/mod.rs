//! The `utils` module holds what every other module shares: the error
//! taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{BrokerError, DeliveryError, Error, Result};
