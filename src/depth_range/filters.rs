//! Depth-map filtering primitives: clamp, box blur, slab threshold and
//! rectangular morphology over plain row-major buffers.

/// Clamps every depth sample to the sensor's practical limits.
pub fn clamp_depth(data: &mut [u16], min: u16, max: u16) {
    for value in data.iter_mut() {
        *value = (*value).clamp(min, max);
    }
}

/// Normalized box blur with a square kernel. Border windows shrink to the
/// in-bounds pixels, so edges average over fewer samples instead of
/// inventing padding.
pub fn box_blur(src: &[u16], dst: &mut [u16], width: usize, height: usize, kernel: usize) {
    assert_eq!(src.len(), width * height);
    assert_eq!(dst.len(), src.len());
    let reach = (kernel / 2) as i64;
    for y in 0..height as i64 {
        let y0 = (y - reach).max(0) as usize;
        let y1 = ((y + reach) as usize).min(height - 1);
        for x in 0..width as i64 {
            let x0 = (x - reach).max(0) as usize;
            let x1 = ((x + reach) as usize).min(width - 1);
            let mut sum = 0u64;
            for yy in y0..=y1 {
                for xx in x0..=x1 {
                    sum += src[yy * width + xx] as u64;
                }
            }
            let count = ((y1 - y0 + 1) * (x1 - x0 + 1)) as u64;
            dst[y as usize * width + x as usize] = ((sum + count / 2) / count) as u16;
        }
    }
}

/// Binary mask of the samples inside `[min, max]`: 255 in range, 0 out.
pub fn in_range(src: &[u16], min: u16, max: u16, dst: &mut [u8]) {
    assert_eq!(src.len(), dst.len());
    for (value, out) in src.iter().zip(dst.iter_mut()) {
        *out = if (min..=max).contains(value) { 255 } else { 0 };
    }
}

/// Rectangular erosion with anchor `(kernel - 1) / 2`; even kernels reach
/// one pixel further right and down, as the usual morphology convention
/// has it. Out-of-bounds neighbours are ignored.
pub fn erode(src: &[u8], dst: &mut [u8], width: usize, height: usize, kernel: usize) {
    morphology(src, dst, width, height, kernel, false);
}

/// Rectangular dilation, same anchor convention as [`erode`].
pub fn dilate(src: &[u8], dst: &mut [u8], width: usize, height: usize, kernel: usize) {
    morphology(src, dst, width, height, kernel, true);
}

fn morphology(src: &[u8], dst: &mut [u8], width: usize, height: usize, kernel: usize, grow: bool) {
    assert_eq!(src.len(), width * height);
    assert_eq!(dst.len(), src.len());
    let anchor = ((kernel - 1) / 2) as i64;
    let lo = -anchor;
    let hi = kernel as i64 - 1 - anchor;
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let mut hit = !grow;
            'window: for dy in lo..=hi {
                let yy = y + dy;
                if yy < 0 || yy >= height as i64 {
                    continue;
                }
                for dx in lo..=hi {
                    let xx = x + dx;
                    if xx < 0 || xx >= width as i64 {
                        continue;
                    }
                    let set = src[yy as usize * width + xx as usize] != 0;
                    if grow && set {
                        hit = true;
                        break 'window;
                    }
                    if !grow && !set {
                        hit = false;
                        break 'window;
                    }
                }
            }
            dst[y as usize * width + x as usize] = if hit { 255 } else { 0 };
        }
    }
}
