//! Workspace placeholder crate.
//!
//! This crate exposes the token-acquisition core behind a single feature so
//! host applications can depend on `auth-workspace` instead of wiring
//! `core-auth`, `core-runtime` and `bridge-traits` individually.

#[cfg(feature = "broker")]
pub use bridge_traits as bridges;
#[cfg(feature = "broker")]
pub use core_auth as auth;
#[cfg(feature = "broker")]
pub use core_runtime as runtime;
