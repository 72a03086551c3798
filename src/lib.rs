// src/lib.rs

//! Build-orchestration core for a rolling binary distribution
//!
//! Maintains package repositories: ingests repository databases, parses
//! binary package archives to extract their real runtime dependencies
//! (including shared-library provides/requires), plans builds in
//! dependency order, drives external packaging tools, and moves artifacts
//! between staging and stable repositories while keeping the package
//! graph consistent.
//!
//! # Architecture
//!
//! - Graph-first: an in-memory, lock-coordinated model of databases and
//!   packages with inverted dependency/library indices
//! - Storage-backed: packages persist in a shared SQLite environment with
//!   a bounded LRU cache in front
//! - Actions: long-running asynchronous operations (reload, prepare,
//!   conduct, move, remove, clean) with precise locking and per-action
//!   subprocess log files

pub mod actions;
pub mod config;
pub mod database;
pub mod dependencies;
mod error;
pub mod packages;
pub mod storage;
pub mod version;

pub use actions::{
    ActionHandle, BuildAction, BuildActionResult, BuildActionResultData, BuildActionStatus,
    BuildActionType, BuildingConfig, ServiceSetup,
};
pub use config::{BuildOrderOptions, BuildOrderResult, Config, PackageKey};
pub use database::{
    Database, DatabaseHandle, DatabaseId, DatabaseInfo, PackageSearchResult, PackageUpdates,
    SignatureLevel, UnresolvedDependencies,
};
pub use dependencies::{Dependency, DependencyMode, DependencyOp, DependencySet, LibraryId};
pub use error::{Error, Result};
pub use packages::{Package, PackageInfo, PackageOrigin, SourceInfo};
pub use storage::{PackageCache, StorageEnvironment, StorageID};
pub use version::PackageVersion;
