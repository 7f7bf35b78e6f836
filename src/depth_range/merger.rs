//! Paced merger pulling frames from range devices into one wide canvas and
//! distilling the depth picture into person detections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::clock::now_millis;
use crate::depth_range::colormap::{colorize_depth, draw_circle};
use crate::depth_range::contours::find_person_circles;
use crate::depth_range::device::{DeviceStatus, RangeDevice, StreamInfo};
use crate::depth_range::error::{MergerError, Result};
use crate::depth_range::filters::{box_blur, clamp_depth, dilate, erode, in_range};
use crate::depth_range::types::{Circle, MergerConfig};

const DEVICE_CONNECT_TIMEOUT_MS: u64 = 15_000;
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_FPS: u32 = 15;

struct DeviceState {
    devices: Vec<Box<dyn RangeDevice>>,
    device_width: usize,
    device_height: usize,
    video_enabled: bool,
    depth_enabled: bool,
    has_started: bool,
}

struct ImageState {
    width: usize,
    height: usize,
    video: Vec<u8>,
    depth_orig: Vec<u16>,
    depth_blur: Vec<u16>,
    depth_range: Vec<u8>,
    scratch: Vec<u8>,
    circles: Vec<Circle>,
    has_new_depth_image: bool,
    has_new_video_image: bool,
    config: MergerConfig,
}

struct MergerShared {
    // Lock order: images before devices.
    images: Mutex<ImageState>,
    devices: Mutex<DeviceState>,
    should_exit: AtomicBool,
}

/// Depth-sensor merger. One paced worker thread pulls every device, merges
/// the frames side by side, and publishes snapshots any thread can read.
pub struct DepthMerger {
    shared: Arc<MergerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for DepthMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl DepthMerger {
    pub fn new() -> Self {
        Self::with_config(MergerConfig::default())
    }

    pub fn with_config(config: MergerConfig) -> Self {
        Self {
            shared: Arc::new(MergerShared {
                images: Mutex::new(ImageState {
                    width: 0,
                    height: 0,
                    video: Vec::new(),
                    depth_orig: Vec::new(),
                    depth_blur: Vec::new(),
                    depth_range: Vec::new(),
                    scratch: Vec::new(),
                    circles: Vec::new(),
                    has_new_depth_image: false,
                    has_new_video_image: false,
                    config,
                }),
                devices: Mutex::new(DeviceState {
                    devices: Vec::new(),
                    device_width: 0,
                    device_height: 0,
                    video_enabled: false,
                    depth_enabled: false,
                    has_started: false,
                }),
                should_exit: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Must be called before [`start`](DepthMerger::start).
    pub fn enable_video(&self) {
        let mut devices = self.shared.devices.lock().unwrap();
        assert!(!devices.has_started, "cannot enable streams after start");
        devices.video_enabled = true;
    }

    /// Must be called before [`start`](DepthMerger::start).
    pub fn enable_depth(&self) {
        let mut devices = self.shared.devices.lock().unwrap();
        assert!(!devices.has_started, "cannot enable streams after start");
        devices.depth_enabled = true;
    }

    /// Adopts a device, waiting up to 15 s for it to come up. A device
    /// that fails or times out is logged and discarded; the merger keeps
    /// running with whatever devices it has.
    pub fn add_device(&self, device: Box<dyn RangeDevice>) -> Result<()> {
        {
            let devices = self.shared.devices.lock().unwrap();
            assert!(!devices.has_started, "cannot add devices after start");
        }

        let device = self.wait_for_device(device)?;
        let info = merged_stream_info(device.as_ref())?;

        let mut images = self.shared.images.lock().unwrap();
        let mut devices = self.shared.devices.lock().unwrap();
        if devices.depth_enabled && device.depth_info().is_none() {
            warn!("Depth merging is enabled but the device offers no depth stream");
        }
        if devices.video_enabled && device.video_info().is_none() {
            warn!("Video merging is enabled but the device offers no video stream");
        }
        if devices.devices.is_empty() {
            devices.device_width = info.width;
            devices.device_height = info.height;
        } else if info.width != devices.device_width || info.height != devices.device_height {
            error!(
                "Range device {}x{} does not match the canvas of {}x{} devices",
                info.width, info.height, devices.device_width, devices.device_height
            );
            return Err(MergerError::CanvasMismatch(
                info.width,
                info.height,
                devices.device_width,
                devices.device_height,
            ));
        }
        devices.devices.push(device);

        // Regrow the merged canvas for the new device column.
        let width = devices.device_width * devices.devices.len();
        let height = devices.device_height;
        images.width = width;
        images.height = height;
        images.video = vec![0; width * height * 3];
        images.depth_orig = vec![0; width * height];
        images.depth_blur = vec![0; width * height];
        images.depth_range = vec![0; width * height];
        images.scratch = vec![0; width * height];

        info!(
            "Range device added; merged canvas is now {}x{}",
            width, height
        );
        Ok(())
    }

    /// Spawns the paced worker. No devices or streams can be added after
    /// this point.
    pub fn start(&self, fps: u32) {
        assert!(fps > 0, "fps must be positive");
        let mut worker = self.worker.lock().unwrap();
        {
            let _images = self.shared.images.lock().unwrap();
            let mut devices = self.shared.devices.lock().unwrap();
            if devices.has_started {
                return;
            }
            devices.has_started = true;
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("depth-merger".into())
            .spawn(move || run_merger_loop(shared, fps))
            .expect("failed to spawn merger worker");
        *worker = Some(handle);
        info!("Depth merger started at {} fps", fps);
    }

    pub fn width(&self) -> usize {
        self.shared.images.lock().unwrap().width
    }

    pub fn height(&self) -> usize {
        self.shared.images.lock().unwrap().height
    }

    /// Byte length of the raw depth snapshot.
    pub fn depth_data_len(&self) -> usize {
        let images = self.shared.images.lock().unwrap();
        images.depth_blur.len() * 2
    }

    /// Copies the blurred depth map into `dst` (as much as fits).
    pub fn get_depth_data(&self, dst: &mut [u16]) {
        let images = self.shared.images.lock().unwrap();
        let len = dst.len().min(images.depth_blur.len());
        dst[..len].copy_from_slice(&images.depth_blur[..len]);
    }

    /// Copies the merged RGB video canvas into `dst` (as much as fits).
    pub fn get_video_data(&self, dst: &mut [u8]) {
        let images = self.shared.images.lock().unwrap();
        let len = dst.len().min(images.video.len());
        dst[..len].copy_from_slice(&images.video[..len]);
    }

    /// Latest detections, largest first.
    pub fn circles(&self) -> Vec<Circle> {
        self.shared.images.lock().unwrap().circles.clone()
    }

    /// Jet-coloured depth view with detections ringed (largest in red, the
    /// rest in green), or `None` until a new depth frame has been merged.
    /// Clears the new-frame flag.
    pub fn get_and_clear_last_depth_color_image(&self) -> Option<Vec<u8>> {
        let mut images = self.shared.images.lock().unwrap();
        if !images.has_new_depth_image {
            return None;
        }
        let mut rgb = colorize_depth(&images.depth_blur, images.width, images.height);
        for (i, circle) in images.circles.iter().enumerate() {
            let color = if i == 0 { [255, 0, 0] } else { [0, 255, 0] };
            draw_circle(&mut rgb, images.width, images.height, circle, color, 3);
        }
        images.has_new_depth_image = false;
        Some(rgb)
    }

    /// Latest merged camera frame unpacked to RGBA (alpha zero), or `None`
    /// until a new video frame has arrived. Clears the new-frame flag.
    pub fn get_and_clear_last_video_image(&self) -> Option<Vec<u8>> {
        let mut images = self.shared.images.lock().unwrap();
        if !images.has_new_video_image {
            return None;
        }
        let mut rgba = Vec::with_capacity(images.width * images.height * 4);
        for pixel in images.video.chunks_exact(3) {
            rgba.extend_from_slice(pixel);
            rgba.push(0);
        }
        images.has_new_video_image = false;
        Some(rgba)
    }

    /// Normalized horizontal position of the largest detection in the
    /// merged canvas, or -1.0 when nothing is detected.
    pub fn get_person_coord_x(&self) -> f64 {
        let images = self.shared.images.lock().unwrap();
        match images.circles.first() {
            Some(circle) if images.width > 0 => circle.cx as f64 / images.width as f64,
            _ => -1.0,
        }
    }

    /// Runs one merge tick synchronously. The worker calls this on its
    /// cadence; tests call it directly.
    pub fn merge_images(&self) {
        merge_images(&self.shared);
    }

    pub fn stop(&self) {
        self.shared.should_exit.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn wait_for_device(&self, device: Box<dyn RangeDevice>) -> Result<Box<dyn RangeDevice>> {
        let start_time = now_millis();
        loop {
            match device.status() {
                DeviceStatus::Ready => return Ok(device),
                DeviceStatus::Failed => {
                    error!("Range device failed to connect");
                    return Err(MergerError::DeviceFailed);
                }
                DeviceStatus::Connecting => {
                    if now_millis().saturating_sub(start_time) > DEVICE_CONNECT_TIMEOUT_MS {
                        error!("Timed out waiting for a range device connection");
                        return Err(MergerError::DeviceTimeout(DEVICE_CONNECT_TIMEOUT_MS));
                    }
                    thread::sleep(DEVICE_POLL_INTERVAL);
                }
            }
        }
    }
}

impl Drop for DepthMerger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn merged_stream_info(device: &dyn RangeDevice) -> Result<StreamInfo> {
    match (device.video_info(), device.depth_info()) {
        (None, None) => {
            error!("Both video and depth streams are closed");
            Err(MergerError::NoStreams)
        }
        (Some(video), Some(depth)) => {
            if video.width != depth.width || video.height != depth.height {
                return Err(MergerError::StreamMismatch(
                    video.width,
                    video.height,
                    depth.width,
                    depth.height,
                ));
            }
            Ok(video)
        }
        (Some(info), None) | (None, Some(info)) => Ok(info),
    }
}

fn run_merger_loop(shared: Arc<MergerShared>, fps: u32) {
    let ms_per_frame = (1000.0 / fps as f64) as u64;
    let mut next_render_time = now_millis() + ms_per_frame;
    while !shared.should_exit.load(Ordering::Acquire) {
        let now = now_millis();
        if next_render_time > now {
            thread::sleep(Duration::from_millis(next_render_time - now));
        }
        next_render_time += ms_per_frame;

        merge_images(&shared);
    }
    info!("Depth merger worker exiting");
}

fn merge_images(shared: &MergerShared) {
    let mut images = shared.images.lock().unwrap();
    let state = &mut *images;

    let mut has_depth_update = false;
    let mut has_video_update = false;
    {
        let mut devices = shared.devices.lock().unwrap();
        let device_width = devices.device_width;
        let full_width = state.width;
        for (i, device) in devices.devices.iter_mut().enumerate() {
            let x_offset = i * device_width;
            has_depth_update |=
                device.get_and_clear_depth_data(&mut state.depth_orig[x_offset..], full_width);
            has_video_update |=
                device.get_and_clear_video_data(&mut state.video[x_offset * 3..], full_width * 3);
        }
    }

    state.circles.clear();
    if has_depth_update {
        contrast_depth(state);
        state.circles =
            find_person_circles(&state.depth_range, state.width, state.height, &state.config);
        state.has_new_depth_image = true;
    }
    if has_video_update {
        state.has_new_video_image = true;
    }
}

/// Clamp, denoise and threshold the merged depth canvas into the trigger
/// mask.
fn contrast_depth(state: &mut ImageState) {
    let config = state.config.clone();
    clamp_depth(&mut state.depth_orig, config.depth_clamp.0, config.depth_clamp.1);
    box_blur(
        &state.depth_orig,
        &mut state.depth_blur,
        state.width,
        state.height,
        config.blur_kernel,
    );
    in_range(
        &state.depth_blur,
        config.trigger_range.0,
        config.trigger_range.1,
        &mut state.depth_range,
    );
    for _ in 0..config.erode_passes {
        erode(
            &state.depth_range,
            &mut state.scratch,
            state.width,
            state.height,
            config.erode_kernel,
        );
        std::mem::swap(&mut state.depth_range, &mut state.scratch);
    }
    for _ in 0..config.dilate_passes {
        dilate(
            &state.depth_range,
            &mut state.scratch,
            state.width,
            state.height,
            config.dilate_kernel,
        );
        std::mem::swap(&mut state.depth_range, &mut state.scratch);
    }
}
