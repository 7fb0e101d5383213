//! HTTP clients against the two external services this core talks to
//! (spec.md SS4.2, SS1 "Out of scope").

pub mod atlas_client;
pub mod models;
pub mod signal_client;

pub use atlas_client::AtlasClient;
pub use signal_client::SignalTransportClient;
