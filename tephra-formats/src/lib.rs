//! Binary manifest and index formats for the content pipeline.
//!
//! A build is described by a chain of content-addressed tables: the root
//! manifest maps file IDs to content keys, the encoding table maps content
//! keys to encoding keys, and archive indices locate encoding-keyed blobs
//! inside archives. This crate parses all of them, plus the key/value
//! configuration files that tie a build together.

pub mod config;
pub mod encoding;
mod error;
pub mod group;
pub mod index;
pub mod install;
pub mod ioutils;
pub mod jenkins3;
pub mod keys;
pub mod root;

pub use error::{Error, Result};
pub use keys::{CKey, EKey, KEY_LENGTH, Md5};
