//! Owned RGBA pixel buffers and the raster operations the effect modes need.

use crate::led_pipeline::common::error::{RenderError, Result};

/// Byte length of a row-major RGBA buffer of the given dimensions.
pub fn rgba_len(width: usize, height: usize) -> usize {
    width * height * 4
}

/// Row-major 8-bit RGBA image. Alpha 0 is fully transparent for the merge
/// paste, 255 is opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RgbaImage {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl RgbaImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; rgba_len(width, height)],
        }
    }

    pub fn from_raw(data: Vec<u8>, width: usize, height: usize) -> Result<Self> {
        if data.len() != rgba_len(width, height) {
            return Err(RenderError::ImageSizeMismatch {
                expected: rgba_len(width, height),
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.width = 0;
        self.height = 0;
        self.data.clear();
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let idx = (y * self.width + x) * 4;
        [
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ]
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, color: [u8; 4]) {
        let idx = (y * self.width + x) * 4;
        self.data[idx..idx + 4].copy_from_slice(&color);
    }

    /// Bilinear resize with center-aligned sample mapping
    /// (`sx = (x + 0.5) * scale - 0.5`). Resizing to the same dimensions is
    /// an exact copy.
    pub fn resize(&self, dst_width: usize, dst_height: usize) -> RgbaImage {
        if dst_width == self.width && dst_height == self.height {
            return self.clone();
        }
        let mut dst = RgbaImage::new(dst_width, dst_height);
        if self.is_empty() || dst_width == 0 || dst_height == 0 {
            return dst;
        }

        let scale_x = self.width as f64 / dst_width as f64;
        let scale_y = self.height as f64 / dst_height as f64;
        for y in 0..dst_height {
            let fy = ((y as f64 + 0.5) * scale_y - 0.5).clamp(0.0, (self.height - 1) as f64);
            let y0 = fy.floor() as usize;
            let y1 = (y0 + 1).min(self.height - 1);
            let ty = fy - y0 as f64;
            for x in 0..dst_width {
                let fx = ((x as f64 + 0.5) * scale_x - 0.5).clamp(0.0, (self.width - 1) as f64);
                let x0 = fx.floor() as usize;
                let x1 = (x0 + 1).min(self.width - 1);
                let tx = fx - x0 as f64;

                let p00 = self.pixel(x0, y0);
                let p10 = self.pixel(x1, y0);
                let p01 = self.pixel(x0, y1);
                let p11 = self.pixel(x1, y1);
                let mut out = [0u8; 4];
                for c in 0..4 {
                    let top = p00[c] as f64 * (1.0 - tx) + p10[c] as f64 * tx;
                    let bottom = p01[c] as f64 * (1.0 - tx) + p11[c] as f64 * tx;
                    out[c] = (top * (1.0 - ty) + bottom * ty).round() as u8;
                }
                dst.set_pixel(x, y, out);
            }
        }
        dst
    }

    pub fn flip_horizontal(&self) -> RgbaImage {
        let mut dst = RgbaImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                dst.set_pixel(self.width - 1 - x, y, self.pixel(x, y));
            }
        }
        dst
    }

    /// Pastes `src` with its top-left corner at `(dst_x, dst_y)`, clipping to
    /// bounds. Without `merge` pixels are copied verbatim. With `merge` the
    /// source alpha drives a blend: opaque source pixels replace the
    /// destination, fully transparent ones leave it unchanged, and
    /// intermediate alphas mix proportionally. Destination alpha is kept.
    pub fn paste(&mut self, src: &RgbaImage, dst_x: usize, dst_y: usize, merge: bool) {
        let copy_w = src.width.min(self.width.saturating_sub(dst_x));
        let copy_h = src.height.min(self.height.saturating_sub(dst_y));
        for y in 0..copy_h {
            for x in 0..copy_w {
                let sp = src.pixel(x, y);
                if !merge {
                    self.set_pixel(dst_x + x, dst_y + y, sp);
                    continue;
                }
                let alpha = sp[3] as u32;
                if alpha == 0 {
                    continue;
                }
                let mut dp = self.pixel(dst_x + x, dst_y + y);
                if alpha == 255 {
                    dp[0] = sp[0];
                    dp[1] = sp[1];
                    dp[2] = sp[2];
                } else {
                    for c in 0..3 {
                        dp[c] =
                            ((sp[c] as u32 * alpha + dp[c] as u32 * (255 - alpha)) / 255) as u8;
                    }
                }
                self.set_pixel(dst_x + x, dst_y + y, dp);
            }
        }
    }
}
