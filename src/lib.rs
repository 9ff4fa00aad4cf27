//! Ray tracing acceleration structure builds.
//!
//! Turns scene meshes or procedural boxes into bottom-level structures,
//! places them with a top-level structure, and keeps the latter up to date
//! as instances move. Everything goes through the narrow device interface
//! of [`hal`].

#![allow(
    irrefutable_let_patterns,
    clippy::new_without_default,
    // Conflicts with `pattern_type_mismatch`
    clippy::needless_borrowed_reference,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

pub use blade_accel_hal as hal;

pub mod blas;
pub mod config;
mod error;
pub mod geometry;
mod instance;
mod manager;
mod resource;
pub mod scene;
pub mod scratch;
pub mod tlas;

pub use blas::{BlasBatch, BlasBuilder, BuildStats};
pub use config::{Config, TracePreference};
pub use error::Error;
pub use geometry::{AabbBatch, GeometryInput, GeometryInputBuilder, GeometryKind};
pub use instance::{Instance, InstanceArena, InstanceHandle};
pub use manager::AsResourceManager;
pub use resource::AccelerationStructure;
pub use scene::{Mesh, Node, Scene, SceneBuilder};
pub use scratch::{BuildSizing, PersistentScratch, ScratchBudgetAllocator, ScratchPlan};
pub use tlas::{TlasBuilder, TlasState};
