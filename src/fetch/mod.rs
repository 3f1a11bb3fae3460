pub mod client;
pub mod limiter;
pub mod single_flight;

pub use client::{AlphaVantageClient, FetchConfig, QuoteSource};
pub use limiter::RateLimiter;
pub use single_flight::SingleFlight;
