//! Frame-level control plane for a fixed-function hardware video
//! encoder.
//!
//! The crate turns per-frame encode parameters into validated kernel
//! dispatch sequences: it derives a frame plan, manages derived
//! surface resources and session-persistent buffers, builds parameter
//! blocks and binding tables for each fixed-function kernel stage,
//! sequences the per-frame pipeline, and drives the multi-pass
//! packetization loop with conditional early exit.
//!
//! The hardware substrate is abstracted behind the traits in [`hw`];
//! [`hw::stub::StubDevice`] interprets the command stream in software
//! for testing.

pub mod derive;
pub mod error;
pub mod hw;
pub mod kernels;
pub mod pak;
pub mod params;
pub mod pipeline;
pub mod resources;
pub mod session;

pub use derive::{FramePlan, FrameType};
pub use error::{EncodeError, Result};
pub use hw::{BufferHandle, HwDevice, SurfaceId};
pub use kernels::{DeviceGen, KernelStage};
pub use params::{
    BitrateControl, FrameParams, PictureParams, Preset, RoiRect, SequenceParams, SliceParams,
    SliceType,
};
pub use pipeline::FrameReport;
pub use session::EncodeSession;
