mod api;
mod endpoints;
mod errors;
mod rest;
pub mod retry;

pub use api::TradingApi;
pub use endpoints::{Endpoint, EndpointSet, TradingVariant};
pub use errors::{Error, Result};
pub use rest::{RestClient, RestClientBuilder};
pub use retry::{fetch_with_retry, RetryPolicy};
