use tracing::debug;

use crate::led_pipeline::common::error::{RenderError, Result};
use crate::led_pipeline::gamma::RgbGamma;
use crate::led_pipeline::layout::{ColorSpace, LedLayout, LedLayoutMap, LedStrands};
use crate::led_pipeline::pixels::RgbaImage;
use crate::led_pipeline::timing::{StageTimings, Timer};
use crate::led_pipeline::types::{EffectMode, HdrMode};

/// The controller's "black" level: every wire byte is offset by this value.
const BLACK_OFFSET: u8 = 0x2C;

/// Pipeline state for one TCL controller: the layout mapping, colour
/// processing settings, and the cached images exposed to monitoring
/// consumers. Socket state lives in
/// [`ControllerLink`](crate::led_pipeline::protocol::ControllerLink), owned
/// by the worker thread.
pub struct TclController {
    id: u8,
    width: usize,
    height: usize,
    gamma: RgbGamma,
    layout: LedLayoutMap,
    hdr_mode: HdrMode,
    effect_image: RgbaImage,
    last_image: RgbaImage,
    last_led_image: RgbaImage,
    last_image_id: i32,
}

impl TclController {
    pub fn new(id: u8, width: usize, height: usize, layout: &LedLayout, gamma: f64) -> Self {
        Self {
            id,
            width,
            height,
            gamma: RgbGamma::new(gamma),
            layout: LedLayoutMap::build(layout, width, height),
            hdr_mode: HdrMode::None,
            effect_image: RgbaImage::default(),
            last_image: RgbaImage::default(),
            last_led_image: RgbaImage::default(),
            last_image_id: 0,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn layout(&self) -> &LedLayoutMap {
        &self.layout
    }

    /// Length of the packed wire frame: one byte per bit plane per colour
    /// channel per LED position.
    pub fn frame_data_len(&self) -> usize {
        self.layout.strand_length() * 8 * 3
    }

    pub fn set_hdr_mode(&mut self, mode: HdrMode) {
        self.hdr_mode = mode;
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
        self.gamma
            .set_gamma_ranges(r_min, r_max, r_gamma, g_min, g_max, g_gamma, b_min, b_max, b_gamma);
    }

    /// Fits a source image onto this controller's canvas according to the
    /// effect mode. Incoming images are expected to use linearised RGB.
    pub fn build_image(
        &self,
        bytes: &[u8],
        width: usize,
        height: usize,
        mode: EffectMode,
    ) -> Result<RgbaImage> {
        if bytes.is_empty() {
            return Err(RenderError::EmptyImage);
        }
        let src = RgbaImage::from_raw(bytes.to_vec(), width, height)?;
        let result = match mode {
            EffectMode::Overlay => src.resize(self.width, self.height),
            EffectMode::Duplicate => {
                let half = src.resize(self.width / 2, self.height);
                let mut dst = RgbaImage::new(self.width, self.height);
                dst.paste(&half, 0, 0, false);
                dst.paste(&half, self.width / 2, 0, false);
                dst
            }
            EffectMode::Mirror => {
                let half = src.resize(self.width / 2, self.height);
                let flipped = half.flip_horizontal();
                let mut dst = RgbaImage::new(self.width, self.height);
                dst.paste(&half, 0, 0, false);
                dst.paste(&flipped, self.width / 2, 0, false);
                dst
            }
        };
        Ok(result)
    }

    pub fn set_effect_image(
        &mut self,
        bytes: &[u8],
        width: usize,
        height: usize,
        mode: EffectMode,
    ) {
        self.effect_image.clear();
        if let Ok(image) = self.build_image(bytes, width, height, mode) {
            self.effect_image = image;
        }
    }

    /// Merges the configured overlay onto `image`; transparent overlay
    /// pixels leave the frame untouched.
    pub fn apply_effect(&self, image: &mut RgbaImage) {
        if self.effect_image.is_empty() {
            return;
        }
        image.paste(&self.effect_image, 0, 0, true);
    }

    /// Runs the full image-to-wire pipeline and refreshes the cached
    /// monitoring images.
    pub fn build_frame_data_for_image(
        &mut self,
        image: &mut RgbaImage,
        image_id: i32,
    ) -> Result<Vec<u8>> {
        let mut timings = StageTimings::new();

        let timer = Timer::start("apply_effect");
        self.apply_effect(image);
        let (name, duration) = timer.stop();
        timings.add_stage(name, duration);

        let timer = Timer::start("image_to_strands");
        let strands = self.image_to_strands(image)?;
        let (name, duration) = timer.stop();
        timings.add_stage(name, duration);

        let timer = Timer::start("encode_frame");
        let frame_data = self.strands_to_frame(&strands);
        let (name, duration) = timer.stop();
        timings.add_stage(name, duration);

        self.last_image = image.clone();
        self.last_image_id = image_id;
        self.last_led_image = self.led_image_for_strands(&strands);

        debug!(
            "Frame {} for controller {} built in {:.3}ms",
            image_id,
            self.id,
            timings.total_duration().as_secs_f64() * 1000.0
        );
        Ok(frame_data)
    }

    /// Samples the image into per-LED colours and runs the HLS, contrast
    /// stretch and gamma stages.
    pub fn image_to_strands(&self, image: &RgbaImage) -> Result<LedStrands> {
        let mut strands = LedStrands::from_map(&self.layout);
        self.populate_strand_colors(&mut strands, image)?;
        strands.convert_to(ColorSpace::Hls);
        self.perform_hdr(&mut strands);
        strands.convert_to(ColorSpace::Rgb);
        self.apply_strand_gamma(&mut strands);
        Ok(strands)
    }

    fn populate_strand_colors(&self, strands: &mut LedStrands, image: &RgbaImage) -> Result<()> {
        let image_data = image.data();
        for strand_id in 0..self.layout.strand_count() {
            for led_id in 0..self.layout.led_count(strand_id) {
                let coords = self.layout.led_coords(strand_id, led_id);
                if coords.is_empty() {
                    // Every surrounding pixel was claimed by another LED;
                    // render dark rather than sampling nothing.
                    strands.set_color(strand_id, led_id, [0, 0, 0, 255]);
                    continue;
                }
                let mut r = 0u32;
                let mut g = 0u32;
                let mut b = 0u32;
                for coord in coords {
                    let idx = (coord.y as usize * self.width + coord.x as usize) * 4;
                    if idx + 4 > image_data.len() {
                        return Err(RenderError::ImageDataExhausted {
                            offset: idx,
                            len: image_data.len(),
                            strand_id,
                            led_id,
                        });
                    }
                    r += image_data[idx] as u32;
                    g += image_data[idx + 1] as u32;
                    b += image_data[idx + 2] as u32;
                }
                let count = coords.len() as u32;
                strands.set_color(
                    strand_id,
                    led_id,
                    [(r / count) as u8, (g / count) as u8, (b / count) as u8, 255],
                );
            }
        }
        Ok(())
    }

    /// Stretches L and/or S of each LED across the min/max observed among
    /// its HDR siblings. Hue and alpha always survive unchanged. Reads the
    /// pre-stretch values for every LED so order of processing cannot skew
    /// the result.
    pub(crate) fn perform_hdr(&self, strands: &mut LedStrands) {
        if self.hdr_mode == HdrMode::None {
            return;
        }
        let source = strands.clone();
        for strand_id in 0..self.layout.strand_count() {
            for led_id in 0..self.layout.led_count(strand_id) {
                let mut l_min = 255u8;
                let mut l_max = 0u8;
                let mut s_min = 255u8;
                let mut s_max = 0u8;
                for sibling in self.layout.hdr_siblings(strand_id, led_id) {
                    let hls = source.color(sibling.strand_id, sibling.led_id);
                    l_min = l_min.min(hls[1]);
                    l_max = l_max.max(hls[1]);
                    s_min = s_min.min(hls[2]);
                    s_max = s_max.max(hls[2]);
                }
                let mut color = source.color(strand_id, led_id);
                if self.hdr_mode.stretches_luminance() {
                    color[1] = extend256(color[1], l_min, l_max);
                }
                if self.hdr_mode.stretches_saturation() {
                    color[2] = extend256(color[2], s_min, s_max);
                }
                strands.set_color(strand_id, led_id, color);
            }
        }
    }

    fn apply_strand_gamma(&self, strands: &mut LedStrands) {
        for strand_id in 0..strands.strand_count() {
            for led_id in 0..strands.led_count(strand_id) {
                let color = strands.color(strand_id, led_id);
                strands.set_color(strand_id, led_id, self.gamma.apply(color));
            }
        }
    }

    /// Paints each LED's final colour onto every pixel it owns, producing
    /// the monitoring view of what the strands actually display.
    pub fn led_image_for_strands(&self, strands: &LedStrands) -> RgbaImage {
        let mut image = RgbaImage::new(self.width, self.height);
        for strand_id in 0..self.layout.strand_count() {
            for led_id in 0..self.layout.led_count(strand_id) {
                let color = strands.color(strand_id, led_id);
                for coord in self.layout.led_coords(strand_id, led_id) {
                    image.set_pixel(coord.x as usize, coord.y as usize, color);
                }
            }
        }
        image
    }

    /// Packs strand colours into the controller's bit-interleaved wire
    /// format. For each LED position, channels go out B, G, R; each channel
    /// emits one byte per bit plane (bit 7 first) whose bit `s` carries
    /// strand `s`. The black offset is added last.
    pub fn strands_to_frame(&self, strands: &LedStrands) -> Vec<u8> {
        let strand_length = self.layout.strand_length();
        let mut frame = Vec::with_capacity(self.frame_data_len());
        for led_id in 0..strand_length {
            for component in [2usize, 1, 0] {
                for bit in (0..8).rev() {
                    let mut out = 0u8;
                    for strand_id in 0..strands.strand_count() {
                        if led_id >= strands.led_count(strand_id) {
                            continue;
                        }
                        if strands.color(strand_id, led_id)[component] & (1 << bit) != 0 {
                            out |= 1 << strand_id;
                        }
                    }
                    frame.push(out);
                }
            }
        }
        debug_assert_eq!(frame.len(), self.frame_data_len());
        for byte in &mut frame {
            *byte = byte.wrapping_add(BLACK_OFFSET);
        }
        frame
    }

    pub fn get_and_clear_last_image(&mut self) -> Option<RgbaImage> {
        if self.last_image.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.last_image))
    }

    pub fn get_and_clear_last_led_image(&mut self) -> Option<RgbaImage> {
        if self.last_led_image.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.last_led_image))
    }

    pub fn last_image_id(&self) -> i32 {
        self.last_image_id
    }
}

/// Extrapolates a value within `[min, max]` to the full byte range.
fn extend256(value: u8, min: u8, max: u8) -> u8 {
    if max == min {
        max
    } else {
        ((255 * (value - min) as u32) / (max - min) as u32) as u8
    }
}
