pub mod color;
pub mod common;
pub mod controller;
pub mod gamma;
pub mod layout;
pub mod pixels;
pub mod protocol;
pub mod scheduler;
pub mod timing;
pub mod types;

#[cfg(test)]
mod tests;

pub use common::error::{RenderError, Result};
pub use controller::TclController;
pub use gamma::RgbGamma;
pub use layout::{ColorSpace, LedAddress, LedCoord, LedLayout, LedLayoutMap, LedStrands};
pub use pixels::{rgba_len, RgbaImage};
pub use protocol::{ControllerLink, FrameTransport, LinkTiming, UdpTransport};
pub use scheduler::TclRenderer;
pub use timing::{StageTiming, StageTimings, Timer};
pub use types::{EffectMode, HdrMode};
