//! LED strand layouts and their mapping onto a pixel canvas.
//!
//! A [`LedLayout`] holds the configured coordinate of every LED along every
//! strand. A [`LedLayoutMap`] derives, per controller canvas, which image
//! pixels each LED samples (first-claim over the LED's 8-neighbourhood) and
//! which LEDs sit close enough in pixel space to act as local-contrast
//! neighbours. [`LedStrands`] is the per-LED colour buffer those mappings
//! feed.

use tracing::warn;

use crate::led_pipeline::color::{hls_to_rgb, rgb_to_hls};

/// LEDs within this pixel distance of each other stretch contrast together.
pub const HDR_SIBLING_DISTANCE: i32 = 13;

/// The wire format packs one bit per strand into each output byte.
pub const MAX_STRAND_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedCoord {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedAddress {
    pub strand_id: usize,
    pub led_id: usize,
}

/// Configured coordinates of the LEDs for each strand. Ordering within a
/// strand is the physical order along the wire.
#[derive(Debug, Clone)]
pub struct LedLayout {
    strand_length: usize,
    strands: Vec<Vec<LedCoord>>,
}

impl LedLayout {
    pub fn new(strand_count: usize, strand_length: usize) -> Self {
        assert!(
            strand_count >= 1 && strand_count <= MAX_STRAND_COUNT,
            "strand count must be in 1..={MAX_STRAND_COUNT}, got {strand_count}"
        );
        assert!(strand_length >= 1, "strand length must be positive");
        Self {
            strand_length,
            strands: vec![Vec::new(); strand_count],
        }
    }

    pub fn add_coord(&mut self, strand_id: usize, x: i32, y: i32) {
        assert!(
            strand_id < self.strands.len(),
            "strand id {strand_id} out of range"
        );
        let strand = &mut self.strands[strand_id];
        if strand.len() == self.strand_length {
            warn!("Cannot add more coords to strand {}", strand_id);
            return;
        }
        strand.push(LedCoord { x, y });
    }

    pub fn strand_count(&self) -> usize {
        self.strands.len()
    }

    pub fn strand_length(&self) -> usize {
        self.strand_length
    }

    pub fn led_count(&self, strand_id: usize) -> usize {
        self.strands[strand_id].len()
    }

    pub fn coord(&self, strand_id: usize, led_id: usize) -> Option<LedCoord> {
        self.strands.get(strand_id)?.get(led_id).copied()
    }
}

#[derive(Debug, Clone, Default)]
struct LedData {
    pixel_coords: Vec<LedCoord>,
    hdr_siblings: Vec<LedAddress>,
}

/// Derived per-controller mapping from LED addresses to sampled pixels and
/// contrast neighbours.
#[derive(Debug, Clone)]
pub struct LedLayoutMap {
    width: usize,
    height: usize,
    strand_length: usize,
    strands: Vec<Vec<LedData>>,
}

/// Probe order around each configured coordinate. The centre pixel goes
/// first so it is the one an LED keeps when neighbours compete.
const CLAIM_OFFSETS: [(i32, i32); 9] = [
    (0, 0),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, -1),
    (0, 1),
];

impl LedLayoutMap {
    pub fn build(layout: &LedLayout, width: usize, height: usize) -> Self {
        assert!(width > 0 && height > 0, "canvas must be non-empty");

        let mut strands: Vec<Vec<LedData>> = (0..layout.strand_count())
            .map(|s| vec![LedData::default(); layout.led_count(s)])
            .collect();

        // First-claim pixel ownership, ascending strand order.
        let mut in_use = vec![false; width * height];
        for (strand_id, leds) in strands.iter_mut().enumerate() {
            for (led_id, led) in leds.iter_mut().enumerate() {
                let coord = layout.coord(strand_id, led_id).unwrap();
                for (dx, dy) in CLAIM_OFFSETS {
                    let x = coord.x + dx;
                    let y = coord.y + dy;
                    if x < 0 || x >= width as i32 || y < 0 || y >= height as i32 {
                        continue;
                    }
                    let pos = y as usize * width + x as usize;
                    if in_use[pos] {
                        continue;
                    }
                    in_use[pos] = true;
                    led.pixel_coords.push(LedCoord { x, y });
                }
            }
        }

        // HDR siblings, self included.
        let max_distance2 = HDR_SIBLING_DISTANCE * HDR_SIBLING_DISTANCE;
        for strand_id1 in 0..layout.strand_count() {
            for led_id1 in 0..layout.led_count(strand_id1) {
                let c1 = layout.coord(strand_id1, led_id1).unwrap();
                for strand_id2 in 0..layout.strand_count() {
                    for led_id2 in 0..layout.led_count(strand_id2) {
                        let c2 = layout.coord(strand_id2, led_id2).unwrap();
                        let dx = c2.x - c1.x;
                        let dy = c2.y - c1.y;
                        if dx * dx + dy * dy < max_distance2 {
                            strands[strand_id1][led_id1].hdr_siblings.push(LedAddress {
                                strand_id: strand_id2,
                                led_id: led_id2,
                            });
                        }
                    }
                }
            }
        }

        Self {
            width,
            height,
            strand_length: layout.strand_length(),
            strands,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn strand_count(&self) -> usize {
        self.strands.len()
    }

    pub fn strand_length(&self) -> usize {
        self.strand_length
    }

    pub fn led_count(&self, strand_id: usize) -> usize {
        self.strands[strand_id].len()
    }

    pub fn led_coords(&self, strand_id: usize, led_id: usize) -> &[LedCoord] {
        &self.strands[strand_id][led_id].pixel_coords
    }

    pub fn hdr_siblings(&self, strand_id: usize, led_id: usize) -> &[LedAddress] {
        &self.strands[strand_id][led_id].hdr_siblings
    }
}

/// Colour space tag for [`LedStrands`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Rgb,
    /// Records hold H, L, S in their first three bytes.
    Hls,
}

#[derive(Debug, Clone, Copy)]
struct StrandSpan {
    start_led: usize,
    led_count: usize,
}

/// Contiguous buffer of 4-byte colour records, one per LED, grouped by
/// strand. The fourth byte is alpha; the wire encoder ignores it.
#[derive(Debug, Clone)]
pub struct LedStrands {
    color_space: ColorSpace,
    spans: Vec<StrandSpan>,
    color_data: Vec<u8>,
}

impl LedStrands {
    pub fn from_map(map: &LedLayoutMap) -> Self {
        let mut spans = Vec::with_capacity(map.strand_count());
        let mut start_led = 0;
        for strand_id in 0..map.strand_count() {
            let led_count = map.led_count(strand_id);
            spans.push(StrandSpan {
                start_led,
                led_count,
            });
            start_led += led_count;
        }
        Self {
            color_space: ColorSpace::Rgb,
            spans,
            color_data: vec![0; start_led * 4],
        }
    }

    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    pub fn strand_count(&self) -> usize {
        self.spans.len()
    }

    pub fn led_count(&self, strand_id: usize) -> usize {
        self.spans[strand_id].led_count
    }

    pub fn total_led_count(&self) -> usize {
        self.color_data.len() / 4
    }

    pub fn color(&self, strand_id: usize, led_id: usize) -> [u8; 4] {
        let idx = self.record_index(strand_id, led_id);
        [
            self.color_data[idx],
            self.color_data[idx + 1],
            self.color_data[idx + 2],
            self.color_data[idx + 3],
        ]
    }

    pub fn set_color(&mut self, strand_id: usize, led_id: usize, color: [u8; 4]) {
        let idx = self.record_index(strand_id, led_id);
        self.color_data[idx..idx + 4].copy_from_slice(&color);
    }

    /// Converts every record between RGB and HLS in place. Alpha bytes are
    /// untouched. A no-op when the buffer is already in the requested space.
    pub fn convert_to(&mut self, space: ColorSpace) {
        if self.color_space == space {
            return;
        }
        for record in self.color_data.chunks_exact_mut(4) {
            let (a, b, c) = match space {
                ColorSpace::Hls => rgb_to_hls(record[0], record[1], record[2]),
                ColorSpace::Rgb => hls_to_rgb(record[0], record[1], record[2]),
            };
            record[0] = a;
            record[1] = b;
            record[2] = c;
        }
        self.color_space = space;
    }

    #[cfg(test)]
    pub(crate) fn force_color_space(&mut self, space: ColorSpace) {
        self.color_space = space;
    }

    fn record_index(&self, strand_id: usize, led_id: usize) -> usize {
        let span = &self.spans[strand_id];
        assert!(led_id < span.led_count, "led id {led_id} out of range");
        (span.start_led + led_id) * 4
    }
}
