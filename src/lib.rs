pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod fs_util;
pub mod manifest;
pub mod output;
pub mod pipeline;
pub mod snapshot;
pub mod staging;
pub mod store;
pub mod transfer;
pub mod verify;
