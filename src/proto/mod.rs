//! Generated protobuf types (spec.md SS3 "Envelope", SS4.3 "Socket
//! resource"). Compiled at build time from `proto/forsta.proto` by
//! `build.rs`.

include!(concat!(env!("OUT_DIR"), "/forsta.rs"));
