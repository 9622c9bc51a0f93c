pub mod client;

pub use client::{CandleSource, FetchError, UpbitClient};
