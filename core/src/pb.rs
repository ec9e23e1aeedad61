//! Generated protobuf types for the management wire protocol (spec.md
//! section 6.1), compiled by `build.rs` via `prost-build` from
//! `proto/s2p_interface.proto`.

#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/s2p_interface.rs"));
