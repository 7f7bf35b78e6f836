//! Rendering mode enumerations

/// Geometric transform applied to a source image to fit a controller's
/// pixel canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectMode {
    /// Resize the source to the full canvas.
    Overlay,
    /// Resize to half width and repeat side by side.
    Duplicate,
    /// Resize to half width; the right half is the mirrored left half.
    Mirror,
}

/// Local contrast stretch applied per LED over its pixel-space neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrMode {
    None,
    Luminance,
    Saturation,
    Lsat,
}

impl HdrMode {
    pub fn stretches_luminance(self) -> bool {
        matches!(self, HdrMode::Luminance | HdrMode::Lsat)
    }

    pub fn stretches_saturation(self) -> bool {
        matches!(self, HdrMode::Saturation | HdrMode::Lsat)
    }
}
