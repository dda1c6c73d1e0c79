//! Protobuf messages stored in pagemap images.
//!
//! Generated from proto/pagemap.proto and checked in, so building the crate
//! does not need protoc.

mod pagemap;

pub use pagemap::{PagemapEntry, PagemapHead};
