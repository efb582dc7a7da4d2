//! taki: differential forensic imaging of running containers
//!
//! The operator (`taki`) starts an agent (`taki-agent`) beside each target
//! container, sends it the metadata tree of the base image, and fetches back
//! an archive of every file that was added or modified since the container
//! started.

pub mod archive;
pub mod cli;
pub mod config;
pub mod error;
pub mod fsdiff;
pub mod handshake;
pub mod imager;
pub mod logger;
pub mod manifest;
pub mod meta;
pub mod meta_builder;
pub mod meta_cache;
pub mod process_io;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod rpc;
pub mod rpcfs;
pub mod server;
pub mod task;
