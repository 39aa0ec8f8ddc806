//! Generated protobuf bindings for the on-disk envelope types.
//!
//! `build.rs` compiles `proto/entry.proto` with `prost-build`; the output
//! lands in `OUT_DIR` and is pulled in here so the rest of the crate can
//! treat these as ordinary Rust types.

include!(concat!(env!("OUT_DIR"), "/loglet.rs"));
