pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod dicom;
pub mod direct;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod output;
pub mod paths;
pub mod resolve;
pub mod store;
pub mod uri;
