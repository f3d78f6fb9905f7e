pub mod adapter;
pub mod btle;
pub mod connector;
pub mod constants;
pub mod mock;
pub mod pairing;
pub mod types;
pub mod walker;
