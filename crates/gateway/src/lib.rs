pub mod audit;
pub mod config;
pub mod export;
pub mod http;
pub mod metrics;
pub mod problem;
pub mod rate_limit;
pub mod signer;
pub mod storage;
pub mod store;
pub mod sweep;
pub mod upload;

#[cfg(test)]
mod testing;
