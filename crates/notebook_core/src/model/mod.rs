//! Domain model for the notebook hierarchy.
//!
//! # Responsibility
//! - Define the folder/note records shared by storage, tree and lifecycle code.
//!
//! # Invariants
//! - Every item is identified by a stable `ItemId` that is never reused.
//! - Only the root has no parent; the root sits at depth `ROOT_DEPTH`.

pub mod item;
pub mod media;
