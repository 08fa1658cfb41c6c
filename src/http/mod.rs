pub mod exchange;
pub mod streamfactory;

// Re-exports for convenience
pub use exchange::{ExchangeClient, ExchangeConfig};
pub use streamfactory::{HttpStream, HttpStreamFactory};
