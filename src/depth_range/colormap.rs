//! JET false-colour rendering of depth maps.

use crate::depth_range::types::Circle;

/// Classic jet ramp: dark blue through cyan, yellow and red.
pub fn jet_color(value: u8) -> [u8; 3] {
    let x = value as f64 / 255.0;
    let ramp = |center: f64| ((1.5 - (4.0 * x - center).abs()).clamp(0.0, 1.0) * 255.0).round();
    [ramp(3.0) as u8, ramp(2.0) as u8, ramp(1.0) as u8]
}

/// Rescales the depth map to its own min..max range and renders it through
/// the jet palette as packed RGB.
pub fn colorize_depth(depth: &[u16], width: usize, height: usize) -> Vec<u8> {
    assert_eq!(depth.len(), width * height);
    let min = depth.iter().copied().min().unwrap_or(0);
    let max = depth.iter().copied().max().unwrap_or(0);
    let scale = if max > min {
        255.0 / (max - min) as f64
    } else {
        0.0
    };

    let mut rgb = Vec::with_capacity(depth.len() * 3);
    for &value in depth {
        let scaled = ((value - min) as f64 * scale).round() as u8;
        rgb.extend_from_slice(&jet_color(scaled));
    }
    rgb
}

/// Draws a circle outline of the given thickness onto a packed RGB image,
/// clipping at the borders.
pub fn draw_circle(
    rgb: &mut [u8],
    width: usize,
    height: usize,
    circle: &Circle,
    color: [u8; 3],
    thickness: i32,
) {
    let half = thickness as f64 / 2.0;
    let reach = circle.radius + thickness;
    for dy in -reach..=reach {
        let y = circle.cy + dy;
        if y < 0 || y >= height as i32 {
            continue;
        }
        for dx in -reach..=reach {
            let x = circle.cx + dx;
            if x < 0 || x >= width as i32 {
                continue;
            }
            let distance = ((dx * dx + dy * dy) as f64).sqrt();
            if (distance - circle.radius as f64).abs() <= half {
                let idx = (y as usize * width + x as usize) * 3;
                rgb[idx..idx + 3].copy_from_slice(&color);
            }
        }
    }
}
