//! Reassembly of Android boot and vendor boot images.
//!
//! Unpacks an existing image, rewrites its ramdisk and command line, repacks
//! and signs it through the host tools, and replaces the committed output
//! only when the bytes changed.

pub mod avb;
pub mod bootconfig;
pub mod commit;
pub mod config;
pub mod error;
pub mod kv;
pub mod ramdisk;
pub mod repack;
pub mod report;
pub mod staging;
pub mod tools;
pub mod version;

pub use error::{Error, ErrorKind, Result};
pub use repack::Assembler;
