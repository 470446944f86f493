pub mod cli;
pub mod config;
pub mod error;
pub mod fleet;
pub mod ingest;
pub mod reading;
pub mod worker;

#[cfg(test)]
pub mod test_support;
