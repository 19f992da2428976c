//! Voxlaunch is the core download and installation pipeline of a sandbox game
//! launcher: it resolves versioned profiles with inheritance, acquires every
//! required artifact (client, libraries, assets, natives, Java runtime) through
//! a mirrored, validated and concurrency-bounded download engine, synthesizes
//! the final process argument list and monitors the running game.
//!
//! The surrounding desktop application (windows, screens, accounts, settings
//! persistence) is not part of this crate; it consumes the pipeline through the
//! [`task::Task`] progress handles and the per-module async entry points.

#![deny(unsafe_op_in_unsafe_fn)]

mod path;
mod http;
mod serde;

pub mod gav;

pub mod task;
pub mod pool;
pub mod mirror;
pub mod cache;
pub mod download;

pub mod profile;
pub mod container;
pub mod install;
pub mod jre;
pub mod args;
pub mod launch;
