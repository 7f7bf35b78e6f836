#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::clock::now_millis;
    use crate::led_pipeline::controller::TclController;
    use crate::led_pipeline::gamma::RgbGamma;
    use crate::led_pipeline::layout::{ColorSpace, LedLayout, LedLayoutMap, LedStrands};
    use crate::led_pipeline::pixels::RgbaImage;
    use crate::led_pipeline::protocol::{
        ControllerLink, FrameTransport, LinkTiming, DATA_CHUNK_LEN, FRAME_MSG_PREFIX, MSG_END_FRAME,
        MSG_INIT, MSG_RESET, MSG_START_FRAME,
    };
    use crate::led_pipeline::scheduler::TclRenderer;
    use crate::led_pipeline::types::{EffectMode, HdrMode};

    struct MockTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
        fail_sends: bool,
    }

    impl MockTransport {
        fn new(
            sent: Arc<Mutex<Vec<Vec<u8>>>>,
            replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
        ) -> Self {
            Self {
                sent,
                replies,
                fail_sends: false,
            }
        }
    }

    impl FrameTransport for MockTransport {
        fn connect(&mut self, _controller_id: u8) -> io::Result<()> {
            Ok(())
        }

        fn send(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.fail_sends {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock send error"));
            }
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.replies.lock().unwrap().pop_front() {
                Some(reply) => {
                    buf[..reply.len()].copy_from_slice(&reply);
                    Ok(reply.len())
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no pending data")),
            }
        }

        fn disconnect(&mut self) {}
    }

    type ReplyQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

    fn mock_link() -> (
        ControllerLink<MockTransport>,
        Arc<Mutex<Vec<Vec<u8>>>>,
        ReplyQueue,
    ) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let replies: ReplyQueue = Arc::new(Mutex::new(VecDeque::new()));
        let link = ControllerLink::with_transport(
            0,
            MockTransport::new(sent.clone(), replies.clone()),
            LinkTiming::immediate(),
        );
        (link, sent, replies)
    }

    /// One strand, one LED at the origin, on a 1x1 canvas.
    fn single_led_controller(gamma: f64) -> TclController {
        let mut layout = LedLayout::new(8, 2);
        layout.add_coord(0, 0, 0);
        TclController::new(0, 1, 1, &layout, gamma)
    }

    fn solid_image(width: usize, height: usize, color: [u8; 4]) -> Vec<u8> {
        color
            .iter()
            .copied()
            .cycle()
            .take(width * height * 4)
            .collect()
    }

    // ---- layout mapping ----

    #[test]
    fn test_pixel_ownership_is_unique() {
        // Two strands of adjacent LEDs with heavily overlapping
        // neighbourhoods.
        let mut layout = LedLayout::new(2, 16);
        for i in 0..8 {
            layout.add_coord(0, i, 1);
            layout.add_coord(1, i, 2);
        }
        let map = LedLayoutMap::build(&layout, 10, 6);

        let mut seen = std::collections::HashSet::new();
        for strand_id in 0..map.strand_count() {
            for led_id in 0..map.led_count(strand_id) {
                for coord in map.led_coords(strand_id, led_id) {
                    assert!(
                        seen.insert((coord.x, coord.y)),
                        "pixel ({}, {}) owned twice",
                        coord.x,
                        coord.y
                    );
                }
            }
        }
    }

    #[test]
    fn test_center_pixel_claimed_first() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 2, 2);
        let map = LedLayoutMap::build(&layout, 5, 5);
        let coords = map.led_coords(0, 0);
        assert_eq!(coords.len(), 9);
        assert_eq!((coords[0].x, coords[0].y), (2, 2));
    }

    #[test]
    fn test_fully_claimed_led_renders_black() {
        // Both strands configure the same coordinate; the second strand's
        // LED finds every pixel already claimed.
        let mut layout = LedLayout::new(2, 4);
        layout.add_coord(0, 1, 1);
        layout.add_coord(1, 1, 1);
        let map = LedLayoutMap::build(&layout, 3, 3);
        assert_eq!(map.led_coords(0, 0).len(), 9);
        assert!(map.led_coords(1, 0).is_empty());

        let controller = TclController::new(0, 3, 3, &layout, 1.0);
        let image = RgbaImage::from_raw(solid_image(3, 3, [200, 200, 200, 255]), 3, 3).unwrap();
        let strands = controller.image_to_strands(&image).unwrap();
        assert_eq!(strands.color(1, 0), [0, 0, 0, 255]);
        assert_eq!(strands.color(0, 0), [200, 200, 200, 255]);
    }

    #[test]
    fn test_hdr_siblings_respect_distance_cutoff() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);
        layout.add_coord(0, 12, 0);
        layout.add_coord(0, 13, 0);
        let map = LedLayoutMap::build(&layout, 40, 4);

        // Self plus the LED 12 pixels away; 13 is at the cutoff and out.
        let siblings = map.hdr_siblings(0, 0);
        assert_eq!(siblings.len(), 2);
        assert!(siblings.iter().all(|s| s.strand_id == 0));
        assert!(siblings.iter().any(|s| s.led_id == 1));
        assert!(!siblings.iter().any(|s| s.led_id == 2));
    }

    // ---- effect geometry ----

    #[test]
    fn test_effect_mirror_reflects_right_half() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);
        let controller = TclController::new(0, 4, 1, &layout, 1.0);

        let a = [10, 20, 30, 255];
        let b = [40, 50, 60, 255];
        let src: Vec<u8> = [a, b].concat();
        let image = controller
            .build_image(&src, 2, 1, EffectMode::Mirror)
            .unwrap();
        assert_eq!(image.pixel(0, 0), a);
        assert_eq!(image.pixel(1, 0), b);
        assert_eq!(image.pixel(2, 0), b);
        assert_eq!(image.pixel(3, 0), a);
    }

    #[test]
    fn test_effect_duplicate_repeats_left_half() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);
        let controller = TclController::new(0, 4, 1, &layout, 1.0);

        let a = [10, 20, 30, 255];
        let b = [40, 50, 60, 255];
        let src: Vec<u8> = [a, b].concat();
        let image = controller
            .build_image(&src, 2, 1, EffectMode::Duplicate)
            .unwrap();
        assert_eq!(image.pixel(0, 0), a);
        assert_eq!(image.pixel(1, 0), b);
        assert_eq!(image.pixel(2, 0), a);
        assert_eq!(image.pixel(3, 0), b);
    }

    #[test]
    fn test_effect_overlay_same_size_is_identity() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);
        let controller = TclController::new(0, 2, 2, &layout, 1.0);

        let src: Vec<u8> = (0u8..16).collect();
        let image = controller
            .build_image(&src, 2, 2, EffectMode::Overlay)
            .unwrap();
        assert_eq!(image.data(), &src[..]);
    }

    #[test]
    fn test_bilinear_downscale_averages_neighbours() {
        let src = RgbaImage::from_raw(
            vec![0, 0, 0, 255, 255, 255, 255, 255],
            2,
            1,
        )
        .unwrap();
        let dst = src.resize(1, 1);
        assert_eq!(dst.pixel(0, 0), [128, 128, 128, 255]);
    }

    #[test]
    fn test_paste_merge_blends_by_alpha() {
        let mut dst = RgbaImage::from_raw(solid_image(3, 1, [100, 100, 100, 255]), 3, 1).unwrap();
        let overlay = RgbaImage::from_raw(
            vec![
                200, 0, 0, 255, // opaque: replaces
                200, 0, 0, 0, // transparent: preserved
                200, 100, 100, 128, // half: blended
            ],
            3,
            1,
        )
        .unwrap();
        dst.paste(&overlay, 0, 0, true);
        assert_eq!(dst.pixel(0, 0), [200, 0, 0, 255]);
        assert_eq!(dst.pixel(1, 0), [100, 100, 100, 255]);
        let blended = dst.pixel(2, 0);
        assert_eq!(blended[0] as u32, (200 * 128 + 100 * 127) / 255);
        assert_eq!(blended[3], 255);
    }

    #[test]
    fn test_effect_image_overlays_scheduled_frames() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);
        let mut controller = TclController::new(0, 2, 1, &layout, 1.0);
        controller.set_effect_image(
            &[255, 0, 0, 255, 0, 0, 0, 0],
            2,
            1,
            EffectMode::Overlay,
        );

        let mut image = RgbaImage::from_raw(solid_image(2, 1, [0, 200, 0, 255]), 2, 1).unwrap();
        controller.apply_effect(&mut image);
        assert_eq!(image.pixel(0, 0), [255, 0, 0, 255]);
        assert_eq!(image.pixel(1, 0), [0, 200, 0, 255]);
    }

    // ---- gamma ----

    #[test]
    fn test_gamma_identity() {
        let gamma = RgbGamma::new(1.0);
        for v in [0u8, 1, 17, 100, 200, 255] {
            assert_eq!(gamma.apply([v, v, v, 42]), [v, v, v, 42]);
        }
    }

    #[test]
    fn test_gamma_curve_dims_midrange() {
        let gamma = RgbGamma::new(2.0);
        assert_eq!(gamma.apply([128, 0, 255, 9]), [64, 0, 255, 9]);
    }

    #[test]
    fn test_gamma_ranges_clamp_input() {
        let mut gamma = RgbGamma::new(1.0);
        gamma.set_gamma_ranges(50, 200, 1.0, 0, 255, 1.0, 0, 255, 1.0);
        assert_eq!(gamma.apply([20, 0, 0, 255])[0], 0);
        assert_eq!(gamma.apply([230, 0, 0, 255])[0], 255);
        assert_eq!(gamma.apply([125, 0, 0, 255])[0], 128);
    }

    // ---- HDR ----

    #[test]
    fn test_hdr_none_is_a_no_op() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);
        layout.add_coord(0, 4, 0);
        let controller = TclController::new(0, 16, 1, &layout, 1.0);

        // The two LEDs are siblings with very different L and S; a stretch
        // would move both, but the default mode must not touch anything.
        let mut strands = LedStrands::from_map(controller.layout());
        strands.force_color_space(ColorSpace::Hls);
        strands.set_color(0, 0, [17, 100, 40, 255]);
        strands.set_color(0, 1, [90, 220, 250, 255]);
        let before = strands.clone();

        controller.perform_hdr(&mut strands);
        for led_id in 0..strands.led_count(0) {
            assert_eq!(strands.color(0, led_id), before.color(0, led_id));
        }
    }

    #[test]
    fn test_hdr_lsat_stretches_to_extremes() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);
        layout.add_coord(0, 5, 0);
        let mut controller = TclController::new(0, 16, 1, &layout, 1.0);
        controller.set_hdr_mode(HdrMode::Lsat);

        let map = controller.layout();
        assert_eq!(map.hdr_siblings(0, 0).len(), 2);

        let mut strands = LedStrands::from_map(map);
        strands.force_color_space(ColorSpace::Hls);
        strands.set_color(0, 0, [0, 100, 100, 255]);
        strands.set_color(0, 1, [0, 200, 200, 255]);
        controller.perform_hdr(&mut strands);
        assert_eq!(strands.color(0, 0), [0, 0, 0, 255]);
        assert_eq!(strands.color(0, 1), [0, 255, 255, 255]);
    }

    #[test]
    fn test_hdr_luminance_leaves_saturation_alone() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);
        layout.add_coord(0, 5, 0);
        let mut controller = TclController::new(0, 16, 1, &layout, 1.0);
        controller.set_hdr_mode(HdrMode::Luminance);

        let mut strands = LedStrands::from_map(controller.layout());
        strands.force_color_space(ColorSpace::Hls);
        strands.set_color(0, 0, [7, 100, 100, 255]);
        strands.set_color(0, 1, [9, 200, 200, 255]);
        controller.perform_hdr(&mut strands);
        assert_eq!(strands.color(0, 0), [7, 0, 100, 255]);
        assert_eq!(strands.color(0, 1), [9, 255, 200, 255]);
    }

    // ---- wire encoding ----

    #[test]
    fn test_single_led_frame_bit_planes() {
        let mut controller = single_led_controller(1.0);
        let mut image = RgbaImage::from_raw(vec![0x80, 0, 0, 255], 1, 1).unwrap();
        let frame = controller.build_frame_data_for_image(&mut image, 7).unwrap();

        assert_eq!(frame.len(), 2 * 8 * 3);
        // Only the R plane's top bit carries strand 0; everything else is
        // the black offset.
        for (i, byte) in frame.iter().enumerate() {
            if i == 16 {
                assert_eq!(*byte, 0x2D, "byte {i}");
            } else {
                assert_eq!(*byte, 0x2C, "byte {i}");
            }
        }
        assert_eq!(controller.last_image_id(), 7);
    }

    #[test]
    fn test_bit_transpose_addresses_every_plane() {
        // Eight strands of two LEDs each, far enough apart not to share
        // pixels.
        let mut layout = LedLayout::new(8, 2);
        for strand_id in 0..8 {
            layout.add_coord(strand_id, 0, strand_id as i32 * 3);
            layout.add_coord(strand_id, 4, strand_id as i32 * 3);
        }
        let controller = TclController::new(0, 8, 24, &layout, 1.0);
        let map = controller.layout();

        for (strand_id, led_id, component, bit) in
            [(0usize, 0usize, 2usize, 7u32), (3, 1, 1, 4), (7, 0, 0, 0)]
        {
            let mut strands = LedStrands::from_map(map);
            let mut color = [0u8; 4];
            color[component] = 1 << bit;
            strands.set_color(strand_id, led_id, color);

            let frame = controller.strands_to_frame(&strands);
            let channel_slot = match component {
                2 => 0, // blue goes first
                1 => 1,
                _ => 2,
            };
            let expected_pos = led_id * 24 + channel_slot * 8 + (7 - bit) as usize;
            for (i, byte) in frame.iter().enumerate() {
                let expected = if i == expected_pos {
                    (1u8 << strand_id).wrapping_add(0x2C)
                } else {
                    0x2C
                };
                assert_eq!(*byte, expected, "byte {i}");
            }
        }
    }

    #[test]
    fn test_short_strands_leave_missing_leds_dark() {
        let mut layout = LedLayout::new(2, 3);
        layout.add_coord(0, 0, 0); // strand 0 has one LED, strand 1 none
        let controller = TclController::new(0, 4, 4, &layout, 1.0);
        let mut strands = LedStrands::from_map(controller.layout());
        strands.set_color(0, 0, [255, 255, 255, 255]);

        let frame = controller.strands_to_frame(&strands);
        assert_eq!(frame.len(), 3 * 8 * 3);
        // LED 0 planes carry strand 0 on every bit; LEDs 1 and 2 are black.
        for (i, byte) in frame.iter().enumerate() {
            let expected = if i < 24 { 0x01u8.wrapping_add(0x2C) } else { 0x2C };
            assert_eq!(*byte, expected, "byte {i}");
        }
    }

    // ---- protocol link ----

    #[test]
    fn test_first_init_sends_reset_then_init() {
        let (mut link, sent, _replies) = mock_link();
        assert!(link.init());
        let packets = sent.lock().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], MSG_RESET.to_vec());
        assert_eq!(packets[1], MSG_INIT.to_vec());
    }

    #[test]
    fn test_init_is_idempotent_until_reset_requested() {
        let (mut link, sent, _replies) = mock_link();
        assert!(link.init());
        assert!(link.init());
        assert_eq!(sent.lock().unwrap().len(), 2);

        link.schedule_reset();
        assert!(link.init());
        let packets = sent.lock().unwrap();
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[2], MSG_RESET.to_vec());
        assert_eq!(packets[3], MSG_INIT.to_vec());
    }

    #[test]
    fn test_send_frame_packet_sequence() {
        let (mut link, sent, _replies) = mock_link();
        assert!(link.init());
        sent.lock().unwrap().clear();

        let frame: Vec<u8> = (0..12 * DATA_CHUNK_LEN).map(|i| (i % 251) as u8).collect();
        assert!(link.send_frame(&frame));

        let packets = sent.lock().unwrap();
        assert_eq!(packets.len(), 14);
        assert_eq!(packets[0], MSG_START_FRAME.to_vec());
        assert_eq!(packets[13], MSG_END_FRAME.to_vec());
        for (idx, packet) in packets[1..13].iter().enumerate() {
            assert_eq!(packet.len(), 12 + DATA_CHUNK_LEN + 4);
            assert_eq!(packet[0], FRAME_MSG_PREFIX[0]);
            assert_eq!(packet[1], idx as u8);
            assert_eq!(&packet[2..12], &FRAME_MSG_PREFIX[2..12]);
            assert_eq!(
                &packet[12..12 + DATA_CHUNK_LEN],
                &frame[idx * DATA_CHUNK_LEN..(idx + 1) * DATA_CHUNK_LEN]
            );
            assert_eq!(&packet[12 + DATA_CHUNK_LEN..], &[0, 0, 0, 0]);
        }
    }

    #[test]
    fn test_short_frame_pads_final_chunk() {
        let (mut link, sent, _replies) = mock_link();
        assert!(link.init());
        sent.lock().unwrap().clear();

        let frame = vec![0xAB; 48];
        assert!(link.send_frame(&frame));

        let packets = sent.lock().unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(&packets[1][12..12 + 48], &frame[..]);
        assert!(packets[1][12 + 48..12 + DATA_CHUNK_LEN].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_send_failure_requires_reset() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let replies: ReplyQueue = Arc::new(Mutex::new(VecDeque::new()));
        let mut transport = MockTransport::new(sent.clone(), replies);
        transport.fail_sends = true;
        let mut link = ControllerLink::with_transport(0, transport, LinkTiming::immediate());
        assert!(!link.init());
        assert!(link.require_reset());
    }

    #[test]
    fn test_replies_clear_frame_counter() {
        let (mut link, _sent, replies) = mock_link();
        assert!(link.init());
        let frame = vec![0u8; 48];
        for _ in 0..3 {
            assert!(link.send_frame(&frame));
        }
        assert_eq!(link.frames_sent_after_reply(), 3);

        // Any datagram from the controller counts as a liveness signal and
        // restarts the counter during the next frame's drain.
        replies.lock().unwrap().push_back(vec![0x55, 0, 0, 0, 0]);
        assert!(link.send_frame(&frame));
        assert_eq!(link.frames_sent_after_reply(), 1);
    }

    #[test]
    fn test_watchdog_resets_after_silence() {
        let (mut link, sent, _replies) = mock_link();
        assert!(link.init());
        let frame = vec![0u8; 48];
        for _ in 0..5 {
            assert!(link.send_frame(&frame));
        }

        // Quiet link but below the threshold: no reset yet.
        link.update_auto_reset(1000);
        assert!(!link.require_reset());

        // Push the last reply into the past and run the watchdog again.
        link.backdate_last_reply(1500);
        link.update_auto_reset(1000);
        assert!(link.require_reset());

        sent.lock().unwrap().clear();
        assert!(link.init());
        let packets = sent.lock().unwrap();
        assert_eq!(packets[0], MSG_RESET.to_vec());
        assert_eq!(packets[1], MSG_INIT.to_vec());
    }

    #[test]
    fn test_watchdog_disabled_with_zero_threshold() {
        let (mut link, _sent, _replies) = mock_link();
        assert!(link.init());
        let frame = vec![0u8; 48];
        for _ in 0..5 {
            assert!(link.send_frame(&frame));
        }
        link.backdate_last_reply(60_000);
        link.update_auto_reset(0);
        assert!(!link.require_reset());
    }

    // ---- renderer facade ----

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = now_millis() + 2000;
        while now_millis() < deadline {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn test_renderer_delivers_frames_in_order() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);
        layout.add_coord(0, 3, 0);

        let renderer = TclRenderer::new();
        renderer.add_controller(3, 4, 1, &layout, 1.0);
        renderer.lock_controllers();
        renderer.start_message_loop(100, false);

        let start = now_millis();
        for (i, id) in [(1u64, 11), (2, 12), (3, 13)] {
            renderer.schedule_image_at(
                3,
                &solid_image(4, 1, [i as u8 * 10, 0, 0, 255]),
                4,
                1,
                EffectMode::Overlay,
                id,
                start + i * 40,
            );
        }

        wait_for("all frames to be rendered", || {
            renderer.get_last_image_id(3) == 13
        });
        wait_for("frame delays to be recorded", || {
            renderer.queue_size() == 0
        });

        let last = renderer.get_and_clear_last_image(3).expect("cached image");
        assert_eq!(last.pixel(0, 0), [30, 0, 0, 255]);
        assert!(renderer.get_and_clear_last_image(3).is_none());
        assert!(renderer.get_and_clear_last_led_image(3).is_some());

        renderer.shutdown();
        // Scheduling after shutdown is silently dropped.
        renderer.schedule_image_at(
            3,
            &solid_image(4, 1, [1, 2, 3, 255]),
            4,
            1,
            EffectMode::Overlay,
            99,
            now_millis(),
        );
        assert_eq!(renderer.queue_size(), 0);
    }

    #[test]
    fn test_renderer_ignores_bad_schedules() {
        let mut layout = LedLayout::new(1, 4);
        layout.add_coord(0, 0, 0);

        let renderer = TclRenderer::new();
        renderer.add_controller(0, 4, 1, &layout, 1.0);
        renderer.lock_controllers();
        renderer.start_message_loop(30, false);

        // Unknown controller and wrong byte length are both dropped.
        renderer.schedule_image_at(9, &[0; 16], 2, 2, EffectMode::Overlay, 1, now_millis());
        renderer.schedule_image_at(0, &[0; 7], 2, 2, EffectMode::Overlay, 2, now_millis());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(renderer.get_last_image_id(0), 0);
        assert_eq!(renderer.get_last_image_id(9), -1);
        renderer.shutdown();
    }

    #[test]
    fn test_frame_send_duration_scales_with_strand_length() {
        let mut layout = LedLayout::new(8, 512);
        layout.add_coord(0, 0, 0);
        let renderer = TclRenderer::new();
        renderer.add_controller(0, 16, 16, &layout, 1.0);
        renderer.lock_controllers();
        // 12288 bytes -> 12 chunks at 1.5 ms plus the 0.5 ms start delay.
        assert_eq!(renderer.frame_send_duration_ms(), 18);
    }
}
