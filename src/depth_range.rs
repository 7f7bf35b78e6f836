pub mod colormap;
pub mod contours;
pub mod device;
pub mod error;
pub mod filters;
pub mod merger;
pub mod types;


pub use device::{DeviceStatus, RangeDevice, StreamInfo};
pub use error::{MergerError, Result};
pub use merger::DepthMerger;
pub use types::{Circle, MergerConfig, MergerConfigBuilder};
