//! Depth merger types and configuration

/// A detected object: centroid in merged-canvas pixels and the radius of
/// the circle with the same area as the contour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Circle {
    pub cx: i32,
    pub cy: i32,
    pub radius: i32,
}

/// Tuning for the depth processing chain.
#[derive(Debug, Clone)]
pub struct MergerConfig {
    /// Practical sensor limits in millimetres; raw depth is clamped here
    /// before any filtering.
    pub depth_clamp: (u16, u16),
    /// Side of the square box-blur kernel applied to reduce sensor noise.
    pub blur_kernel: usize,
    /// Distance slab (mm) that triggers the detection mask.
    pub trigger_range: (u16, u16),
    pub erode_kernel: usize,
    pub erode_passes: usize,
    pub dilate_kernel: usize,
    pub dilate_passes: usize,
    /// Accepted object size as a fraction of `object_radius_basis`.
    /// A person should take at least 10% and at most 33%.
    pub object_ratio: (f64, f64),
    pub object_radius_basis: f64,
    /// Above this many detected components the frame is considered noise
    /// and all detections are dropped.
    pub max_object_count: usize,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            depth_clamp: (500, 3000),
            blur_kernel: 7,
            trigger_range: (1500, 2500),
            erode_kernel: 3,
            erode_passes: 2,
            dilate_kernel: 8,
            dilate_passes: 2,
            object_ratio: (0.10, 0.33),
            object_radius_basis: 500.0,
            max_object_count: 100,
        }
    }
}

impl MergerConfig {
    pub fn builder() -> MergerConfigBuilder {
        MergerConfigBuilder::default()
    }
}

/// Builder for MergerConfig
#[derive(Default)]
pub struct MergerConfigBuilder {
    depth_clamp: Option<(u16, u16)>,
    blur_kernel: Option<usize>,
    trigger_range: Option<(u16, u16)>,
    erode_kernel: Option<usize>,
    erode_passes: Option<usize>,
    dilate_kernel: Option<usize>,
    dilate_passes: Option<usize>,
    object_ratio: Option<(f64, f64)>,
    object_radius_basis: Option<f64>,
    max_object_count: Option<usize>,
}

impl MergerConfigBuilder {
    pub fn depth_clamp(mut self, min: u16, max: u16) -> Self {
        self.depth_clamp = Some((min, max));
        self
    }

    pub fn blur_kernel(mut self, kernel: usize) -> Self {
        self.blur_kernel = Some(kernel);
        self
    }

    pub fn trigger_range(mut self, min: u16, max: u16) -> Self {
        self.trigger_range = Some((min, max));
        self
    }

    pub fn erode(mut self, kernel: usize, passes: usize) -> Self {
        self.erode_kernel = Some(kernel);
        self.erode_passes = Some(passes);
        self
    }

    pub fn dilate(mut self, kernel: usize, passes: usize) -> Self {
        self.dilate_kernel = Some(kernel);
        self.dilate_passes = Some(passes);
        self
    }

    pub fn object_ratio(mut self, min: f64, max: f64) -> Self {
        self.object_ratio = Some((min, max));
        self
    }

    pub fn object_radius_basis(mut self, basis: f64) -> Self {
        self.object_radius_basis = Some(basis);
        self
    }

    pub fn max_object_count(mut self, count: usize) -> Self {
        self.max_object_count = Some(count);
        self
    }

    pub fn build(self) -> MergerConfig {
        let default = MergerConfig::default();
        MergerConfig {
            depth_clamp: self.depth_clamp.unwrap_or(default.depth_clamp),
            blur_kernel: self.blur_kernel.unwrap_or(default.blur_kernel),
            trigger_range: self.trigger_range.unwrap_or(default.trigger_range),
            erode_kernel: self.erode_kernel.unwrap_or(default.erode_kernel),
            erode_passes: self.erode_passes.unwrap_or(default.erode_passes),
            dilate_kernel: self.dilate_kernel.unwrap_or(default.dilate_kernel),
            dilate_passes: self.dilate_passes.unwrap_or(default.dilate_passes),
            object_ratio: self.object_ratio.unwrap_or(default.object_ratio),
            object_radius_basis: self
                .object_radius_basis
                .unwrap_or(default.object_radius_basis),
            max_object_count: self.max_object_count.unwrap_or(default.max_object_count),
        }
    }
}
