//! Storage backend implementations.

pub mod filesystem;
pub mod s3;
pub mod tape_disk;
