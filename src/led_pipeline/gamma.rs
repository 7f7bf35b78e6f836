//! Per-channel gamma lookup tables.
//!
//! 1.0 is uncorrected gamma, which is perceived as "too bright" in the
//! middle. 2.4 is a good starting point. Higher values produce dimmer
//! mid-range pixels.

/// Independent R/G/B mappings, each defined by an input range and an
/// exponent. Applied after the HLS stages so the RGB-HLS conversions stay
/// linear.
#[derive(Debug, Clone)]
pub struct RgbGamma {
    r: [u8; 256],
    g: [u8; 256],
    b: [u8; 256],
}

impl Default for RgbGamma {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl RgbGamma {
    pub fn new(gamma: f64) -> Self {
        let mut result = Self {
            r: [0; 256],
            g: [0; 256],
            b: [0; 256],
        };
        result.set_gamma_ranges(0, 255, gamma, 0, 255, gamma, 0, 255, gamma);
        result
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_gamma_ranges(
        &mut self,
        r_min: i32,
        r_max: i32,
        r_gamma: f64,
        g_min: i32,
        g_max: i32,
        g_gamma: f64,
        b_min: i32,
        b_max: i32,
        b_gamma: f64,
    ) {
        self.r = build_table(r_min, r_max, r_gamma);
        self.g = build_table(g_min, g_max, g_gamma);
        self.b = build_table(b_min, b_max, b_gamma);
    }

    /// Maps R, G and B through their tables; alpha passes through.
    pub fn apply(&self, color: [u8; 4]) -> [u8; 4] {
        [
            self.r[color[0] as usize],
            self.g[color[1] as usize],
            self.b[color[2] as usize],
            color[3],
        ]
    }
}

fn build_table(min: i32, max: i32, gamma: f64) -> [u8; 256] {
    let mut table = [0u8; 256];
    if max <= min {
        // Degenerate range: step function at the pivot.
        for (x, entry) in table.iter_mut().enumerate() {
            *entry = if (x as i32) <= min { 0 } else { 255 };
        }
        return table;
    }
    for (x, entry) in table.iter_mut().enumerate() {
        let v = (x as i32).clamp(min, max);
        let norm = (v - min) as f64 / (max - min) as f64;
        *entry = (norm.powf(gamma) * 255.0).round() as u8;
    }
    table
}
