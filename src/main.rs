use tcl_show_rs::clock::now_millis;
use tcl_show_rs::led_pipeline::{EffectMode, HdrMode, LedLayout, TclRenderer};
use tcl_show_rs::logger;

use std::thread;
use std::time::Duration;
use tracing::info;

const WIDTH: usize = 64;
const HEIGHT: usize = 32;
const STRAND_COUNT: usize = 8;
const STRAND_LENGTH: usize = 256;
const FPS: u32 = 15;
const DEMO_FRAMES: u32 = 30;

/// Serpentine layout: each strand covers four image rows, alternating
/// direction so the wire path matches a physical zigzag mounting.
fn serpentine_layout() -> LedLayout {
    let mut layout = LedLayout::new(STRAND_COUNT, STRAND_LENGTH);
    for strand_id in 0..STRAND_COUNT {
        for row in 0..(HEIGHT / STRAND_COUNT) {
            let y = strand_id * (HEIGHT / STRAND_COUNT) + row;
            for col in 0..WIDTH {
                let x = if row % 2 == 0 { col } else { WIDTH - 1 - col };
                layout.add_coord(strand_id, x as i32, y as i32);
            }
        }
    }
    layout
}

fn gradient_frame(phase: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(WIDTH * HEIGHT * 4);
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let v = ((x as u32 * 4 + phase * 8) % 256) as u8;
            data.push(v);
            data.push((y * 255 / (HEIGHT - 1)) as u8);
            data.push(255 - v);
            data.push(255);
        }
    }
    data
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logger::init();

    info!("Starting tcl_show...");

    let renderer = TclRenderer::new();
    renderer.add_controller(0, WIDTH, HEIGHT, &serpentine_layout(), 2.4);
    renderer.lock_controllers();
    renderer.set_hdr_mode(HdrMode::Saturation);

    let enable_net = std::env::var("TCL_ENABLE_NET").map_or(false, |v| v == "1");
    renderer.start_message_loop(FPS, enable_net);

    info!(
        "Renderer started: {}x{}, {} fps, network {}",
        WIDTH,
        HEIGHT,
        FPS,
        if enable_net { "enabled" } else { "disabled" }
    );

    let start = now_millis();
    for frame in 0..DEMO_FRAMES {
        let deadline = start + (frame as u64 + 1) * 1000 / FPS as u64;
        renderer.schedule_image_at(
            0,
            &gradient_frame(frame),
            WIDTH,
            HEIGHT,
            EffectMode::Overlay,
            frame as i32,
            deadline,
        );
    }

    thread::sleep(Duration::from_millis(
        (DEMO_FRAMES as u64 + 2) * 1000 / FPS as u64,
    ));

    let delays = renderer.get_and_clear_frame_delays();
    info!(
        "Sent {} frames, last image id {}",
        delays.len(),
        renderer.get_last_image_id(0)
    );
    if let Some(max) = delays.iter().max() {
        info!("Worst frame delay: {} ms", max);
    }

    renderer.shutdown();
    Ok(())
}
