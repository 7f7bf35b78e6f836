use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::clock::now_millis;
use crate::led_pipeline::controller::TclController;
use crate::led_pipeline::layout::LedLayout;
use crate::led_pipeline::pixels::{rgba_len, RgbaImage};
use crate::led_pipeline::protocol::{frame_send_duration, ControllerLink};
use crate::led_pipeline::types::{EffectMode, HdrMode};

const DEFAULT_FPS: u32 = 15;
const DEFAULT_AUTO_RESET_MS: u64 = 5000;
const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkKind {
    Frame,
    Reset,
}

/// Queue entry, ordered by deadline with insertion order breaking ties.
struct WorkItem {
    kind: WorkKind,
    controller_index: usize,
    image: RgbaImage,
    image_id: i32,
    time_ms: u64,
    seq: u64,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.time_ms == other.time_ms && self.seq == other.seq
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time_ms
            .cmp(&other.time_ms)
            .then(self.seq.cmp(&other.seq))
    }
}

struct RendererState {
    fps: u32,
    base_time_ms: u64,
    auto_reset_after_no_data_ms: u64,
    enable_net: bool,
    is_shutting_down: bool,
    has_started_thread: bool,
    controllers_locked: bool,
    controllers: Vec<TclController>,
    queue: BinaryHeap<Reverse<WorkItem>>,
    next_seq: u64,
    frame_delays: Vec<i32>,
}

struct RendererShared {
    state: Mutex<RendererState>,
    cond: Condvar,
}

/// Thread-safe renderer facade. Owns the controllers, the deadline queue
/// and one worker thread; callers schedule frames and read back cached
/// images from any thread. Sockets live on the worker so blocking UDP I/O
/// never holds the state lock.
pub struct TclRenderer {
    shared: Arc<RendererShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TclRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TclRenderer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RendererShared {
                state: Mutex::new(RendererState {
                    fps: DEFAULT_FPS,
                    base_time_ms: now_millis(),
                    auto_reset_after_no_data_ms: DEFAULT_AUTO_RESET_MS,
                    enable_net: false,
                    is_shutting_down: false,
                    has_started_thread: false,
                    controllers_locked: false,
                    controllers: Vec::new(),
                    queue: BinaryHeap::new(),
                    next_seq: 0,
                    frame_delays: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Registers a controller. Must precede [`lock_controllers`].
    ///
    /// [`lock_controllers`]: TclRenderer::lock_controllers
    pub fn add_controller(
        &self,
        id: u8,
        width: usize,
        height: usize,
        layout: &LedLayout,
        gamma: f64,
    ) {
        let mut state = self.lock_state();
        assert!(
            !state.controllers_locked,
            "cannot add controllers after lock_controllers"
        );
        assert!(
            state.controllers.iter().all(|c| c.id() != id),
            "duplicate controller id {id}"
        );
        assert!(
            (id as u32) + 49 <= 255,
            "controller id {id} outside the addressable subnet"
        );
        state
            .controllers
            .push(TclController::new(id, width, height, layout, gamma));
    }

    /// Freezes the topology; settings and scheduling become available.
    pub fn lock_controllers(&self) {
        self.lock_state().controllers_locked = true;
    }

    /// Spawns the worker thread. Idempotent after the first call.
    pub fn start_message_loop(&self, fps: u32, enable_net: bool) {
        assert!(fps > 0, "fps must be positive");
        let mut worker = self.worker.lock().unwrap();
        let links = {
            let mut state = self.lock_state();
            assert!(
                state.controllers_locked,
                "lock_controllers must precede start_message_loop"
            );
            if state.has_started_thread {
                return;
            }
            state.fps = fps;
            state.enable_net = enable_net;
            state.has_started_thread = true;
            state
                .controllers
                .iter()
                .map(|c| ControllerLink::new(c.id()))
                .collect::<Vec<_>>()
        };
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("tcl-renderer".into())
            .spawn(move || run_worker(shared, links))
            .expect("failed to spawn renderer worker");
        *worker = Some(handle);
    }

    pub fn set_gamma(&self, gamma: f64) {
        self.set_gamma_ranges(0, 255, gamma, 0, 255, gamma, 0, 255, gamma);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_gamma_ranges(
        &self,
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
        let mut state = self.lock_state();
        assert!(state.controllers_locked, "controllers are not locked yet");
        for controller in &mut state.controllers {
            controller.set_gamma_ranges(
                r_min, r_max, r_gamma, g_min, g_max, g_gamma, b_min, b_max, b_gamma,
            );
        }
    }

    pub fn set_hdr_mode(&self, mode: HdrMode) {
        let mut state = self.lock_state();
        assert!(state.controllers_locked, "controllers are not locked yet");
        for controller in &mut state.controllers {
            controller.set_hdr_mode(mode);
        }
    }

    /// 0 disables the watchdog.
    pub fn set_auto_reset_after_no_data_ms(&self, value: u64) {
        self.lock_state().auto_reset_after_no_data_ms = value;
    }

    /// Builds the controller-fitted image on the caller thread and queues
    /// it for transmission at `target_time_ms`, aligned to the FPS grid.
    /// Undersized images and unknown controllers are logged and dropped;
    /// enqueues during shutdown are silently dropped.
    pub fn schedule_image_at(
        &self,
        controller_id: u8,
        bytes: &[u8],
        width: usize,
        height: usize,
        mode: EffectMode,
        image_id: i32,
        target_time_ms: u64,
    ) {
        let mut state = self.lock_state();
        assert!(
            state.has_started_thread,
            "start_message_loop must precede schedule_image_at"
        );
        if state.is_shutting_down {
            return;
        }
        let Some(index) = state
            .controllers
            .iter()
            .position(|c| c.id() == controller_id)
        else {
            warn!("Ignoring schedule_image_at on unknown controller {controller_id}");
            return;
        };
        if bytes.len() != rgba_len(width, height) {
            warn!(
                "Unexpected image size for controller {}: got {} bytes, expected {}",
                controller_id,
                bytes.len(),
                rgba_len(width, height)
            );
            return;
        }

        let time_ms = align_to_fps(target_time_ms, state.base_time_ms, state.fps);
        let image = match state.controllers[index].build_image(bytes, width, height, mode) {
            Ok(image) => image,
            Err(err) => {
                warn!("Failed to build image for controller {controller_id}: {err}");
                return;
            }
        };
        self.push_item(&mut state, WorkKind::Frame, index, image, image_id, time_ms);
    }

    /// Queues a controller reset; when it reaches the head of the queue it
    /// also cancels that controller's pending frames.
    pub fn schedule_reset_at(&self, controller_id: u8, target_time_ms: u64) {
        let mut state = self.lock_state();
        if state.is_shutting_down {
            return;
        }
        let Some(index) = state
            .controllers
            .iter()
            .position(|c| c.id() == controller_id)
        else {
            warn!("Ignoring schedule_reset_at on unknown controller {controller_id}");
            return;
        };
        let time_ms = align_to_fps(target_time_ms, state.base_time_ms, state.fps);
        self.push_item(
            &mut state,
            WorkKind::Reset,
            index,
            RgbaImage::default(),
            0,
            time_ms,
        );
    }

    pub fn set_effect_image(
        &self,
        controller_id: u8,
        bytes: &[u8],
        width: usize,
        height: usize,
        mode: EffectMode,
    ) {
        let mut state = self.lock_state();
        if let Some(controller) = state
            .controllers
            .iter_mut()
            .find(|c| c.id() == controller_id)
        {
            controller.set_effect_image(bytes, width, height, mode);
        }
    }

    pub fn get_and_clear_last_image(&self, controller_id: u8) -> Option<RgbaImage> {
        let mut state = self.lock_state();
        state
            .controllers
            .iter_mut()
            .find(|c| c.id() == controller_id)
            .and_then(|c| c.get_and_clear_last_image())
    }

    pub fn get_and_clear_last_led_image(&self, controller_id: u8) -> Option<RgbaImage> {
        let mut state = self.lock_state();
        state
            .controllers
            .iter_mut()
            .find(|c| c.id() == controller_id)
            .and_then(|c| c.get_and_clear_last_led_image())
    }

    /// `-1` when the controller is unknown.
    pub fn get_last_image_id(&self, controller_id: u8) -> i32 {
        self.lock_state()
            .controllers
            .iter()
            .find(|c| c.id() == controller_id)
            .map_or(-1, |c| c.last_image_id())
    }

    /// Milliseconds each transmitted frame missed its deadline by, since
    /// the previous call.
    pub fn get_and_clear_frame_delays(&self) -> Vec<i32> {
        std::mem::take(&mut self.lock_state().frame_delays)
    }

    /// Wire pacing time for the largest configured frame.
    pub fn frame_send_duration_ms(&self) -> u64 {
        let state = self.lock_state();
        state
            .controllers
            .iter()
            .map(|c| frame_send_duration(c.frame_data_len()).as_millis() as u64)
            .max()
            .unwrap_or(0)
    }

    pub fn queue_size(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub fn reset_image_queue(&self) {
        self.lock_state().queue.clear();
    }

    /// Stops the worker after at most one in-flight frame and joins it.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            state.is_shutting_down = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.lock_state().queue.clear();
    }

    fn push_item(
        &self,
        state: &mut RendererState,
        kind: WorkKind,
        controller_index: usize,
        image: RgbaImage,
        image_id: i32,
        time_ms: u64,
    ) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Reverse(WorkItem {
            kind,
            controller_index,
            image,
            image_id,
            time_ms,
            seq,
        }));
        self.shared.cond.notify_all();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RendererState> {
        self.shared.state.lock().unwrap()
    }
}

impl Drop for TclRenderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Snaps a target time onto the FPS grid anchored at `base_ms`.
fn align_to_fps(target_ms: u64, base_ms: u64, fps: u32) -> u64 {
    if target_ms <= base_ms {
        return target_ms;
    }
    let frame_num = ((target_ms - base_ms) as f64 / 1000.0 * fps as f64).round();
    base_ms + (frame_num * 1000.0 / fps as f64) as u64
}

enum Pop {
    Item(WorkItem),
    WaitUntil(u64),
    Empty,
}

/// Queue discipline: returns the newest due item (older due items are
/// stale and dropped), drains a controller's pending frames when a reset
/// reaches the head, or reports when the next item comes due.
fn pop_next_work_item(state: &mut RendererState, now_ms: u64) -> Pop {
    if state.queue.is_empty() {
        return Pop::Empty;
    }
    loop {
        {
            let Reverse(head) = state.queue.peek().unwrap();
            if head.kind == WorkKind::Reset {
                let Reverse(item) = state.queue.pop().unwrap();
                let index = item.controller_index;
                state.queue.retain(|Reverse(i)| i.controller_index != index);
                return Pop::Item(item);
            }
            if head.time_ms > now_ms {
                return Pop::WaitUntil(head.time_ms);
            }
        }
        let Reverse(item) = state.queue.pop().unwrap();
        match state.queue.peek() {
            None => return Pop::Item(item),
            Some(Reverse(next)) if next.time_ms > now_ms => return Pop::Item(item),
            // Another due item is closer to the present; skip to it.
            _ => {}
        }
    }
}

enum Step {
    Shutdown,
    Reset(usize),
    Frame(WorkItem, Option<Vec<u8>>),
}

fn run_worker(shared: Arc<RendererShared>, mut links: Vec<ControllerLink>) {
    info!("Renderer worker started with {} controllers", links.len());
    loop {
        let (enable_net, auto_reset_ms) = {
            let state = shared.state.lock().unwrap();
            if state.is_shutting_down {
                break;
            }
            (state.enable_net, state.auto_reset_after_no_data_ms)
        };

        if enable_net {
            for link in &mut links {
                link.update_auto_reset(auto_reset_ms);
            }
            let mut failed_init = false;
            for link in &mut links {
                failed_init |= !link.init();
            }
            if failed_init {
                thread::sleep(INIT_RETRY_DELAY);
                continue;
            }
        }

        let step = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.is_shutting_down {
                    break Step::Shutdown;
                }
                match pop_next_work_item(&mut state, now_millis()) {
                    Pop::Item(mut item) => {
                        if item.kind == WorkKind::Reset {
                            break Step::Reset(item.controller_index);
                        }
                        if item.image.is_empty() {
                            break Step::Frame(item, None);
                        }
                        let index = item.controller_index;
                        let frame = match state.controllers[index]
                            .build_frame_data_for_image(&mut item.image, item.image_id)
                        {
                            Ok(frame) => Some(frame),
                            Err(err) => {
                                warn!("Failed to build frame data: {err}");
                                None
                            }
                        };
                        break Step::Frame(item, frame);
                    }
                    Pop::WaitUntil(time_ms) => {
                        let wait = Duration::from_millis(time_ms.saturating_sub(now_millis()));
                        let (guard, _) = shared.cond.wait_timeout(state, wait).unwrap();
                        state = guard;
                    }
                    Pop::Empty => {
                        state = shared.cond.wait(state).unwrap();
                    }
                }
            }
        };

        match step {
            Step::Shutdown => break,
            Step::Reset(index) => links[index].schedule_reset(),
            Step::Frame(item, Some(frame)) => {
                // Transmit without the state lock so schedulers stay
                // responsive through the paced send.
                let sent = if enable_net {
                    links[item.controller_index].send_frame(&frame)
                } else {
                    true
                };
                if sent {
                    let delay = (now_millis() as i64 - item.time_ms as i64) as i32;
                    shared.state.lock().unwrap().frame_delays.push(delay);
                } else {
                    warn!(
                        "Scheduling reset after failed frame on controller {}",
                        links[item.controller_index].controller_id()
                    );
                    links[item.controller_index].schedule_reset();
                }
            }
            Step::Frame(_, None) => {}
        }
    }
    info!("Renderer worker exiting");
}
