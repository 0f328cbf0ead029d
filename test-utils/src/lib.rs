//! Test fixtures for the imglift workspace.
//!
//! Builders for synthetic disk-image headers and fake guest filesystem
//! trees, shared by unit and integration tests across the workspace.

pub mod guest;
pub mod images;
