//! UDP wire protocol for TCL pixel controllers.
//!
//! Controllers listen on `192.168.60.(49 + id):5000`. All control messages
//! are 5-byte datagrams; frame data goes out as 1040-byte datagrams (12-byte
//! prefix whose second byte is the chunk index, 1024 payload bytes, 4 zero
//! bytes). Any datagram the controller sends back counts as a liveness
//! signal.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::clock::now_millis;

pub const MSG_INIT: [u8; 5] = [0xC5, 0x77, 0x88, 0x00, 0x00];
pub const MSG_RESET: [u8; 5] = [0xC2, 0x77, 0x88, 0x00, 0x00];
/// Same bytes as INIT; the controller distinguishes them by protocol phase.
pub const MSG_START_FRAME: [u8; 5] = MSG_INIT;
pub const MSG_END_FRAME: [u8; 5] = [0xAA, 0x01, 0x8C, 0x01, 0x55];
pub const FRAME_MSG_PREFIX: [u8; 12] = [
    0x88, 0x00, 0x68, 0x3F, 0x2B, 0xFD, 0x60, 0x8B, 0x95, 0xEF, 0x04, 0x69,
];
pub const FRAME_MSG_SUFFIX: [u8; 4] = [0x00, 0x00, 0x00, 0x00];
pub const DATA_CHUNK_LEN: usize = 1024;

const CONTROLLER_PORT: u16 = 5000;
const CONTROLLER_HOST_BASE: u8 = 49;

pub const MSG_START_DELAY: Duration = Duration::from_micros(500);
pub const MSG_DATA_DELAY: Duration = Duration::from_micros(1500);
const MSG_INIT_DELAY: Duration = Duration::from_millis(100);
const MSG_RESET_DELAY: Duration = Duration::from_secs(5);

/// Time spent pacing one frame onto the wire.
pub fn frame_send_duration(frame_data_len: usize) -> Duration {
    MSG_START_DELAY + MSG_DATA_DELAY * frame_data_len.div_ceil(DATA_CHUNK_LEN) as u32
}

/// Protocol pacing knobs. Production uses the controller's required delays;
/// tests zero them out.
#[derive(Debug, Clone)]
pub struct LinkTiming {
    pub reset_delay: Duration,
    pub init_delay: Duration,
    pub start_delay: Duration,
    pub data_delay: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            reset_delay: MSG_RESET_DELAY,
            init_delay: MSG_INIT_DELAY,
            start_delay: MSG_START_DELAY,
            data_delay: MSG_DATA_DELAY,
        }
    }
}

impl LinkTiming {
    pub fn immediate() -> Self {
        Self {
            reset_delay: Duration::ZERO,
            init_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
            data_delay: Duration::ZERO,
        }
    }
}

/// Datagram transport to one controller.
pub trait FrameTransport {
    fn connect(&mut self, controller_id: u8) -> io::Result<()>;
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;
    /// Non-blocking receive; `WouldBlock` when nothing is pending.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn disconnect(&mut self);
}

/// The production transport: a connected, non-blocking UDP socket bound to
/// an ephemeral local port.
#[derive(Debug, Default)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
}

impl FrameTransport for UdpTransport {
    fn connect(&mut self, controller_id: u8) -> io::Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let remote = SocketAddrV4::new(
            Ipv4Addr::new(192, 168, 60, CONTROLLER_HOST_BASE + controller_id),
            CONTROLLER_PORT,
        );
        socket.connect(remote)?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        match &self.socket {
            Some(socket) => socket.send(data),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is not connected",
            )),
        }
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.socket {
            Some(socket) => socket.recv(buf),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is not connected",
            )),
        }
    }

    fn disconnect(&mut self) {
        self.socket = None;
    }
}

/// Connection state machine for one controller, owned by the renderer
/// worker thread. Tracks liveness from reply traffic and recovers through
/// the reset handshake when the controller goes quiet or a send fails.
pub struct ControllerLink<T: FrameTransport = UdpTransport> {
    controller_id: u8,
    transport: T,
    timing: LinkTiming,
    connected: bool,
    init_sent: bool,
    require_reset: bool,
    last_reply_time: u64,
    frames_sent_after_reply: u32,
}

impl ControllerLink<UdpTransport> {
    pub fn new(controller_id: u8) -> Self {
        Self::with_transport(controller_id, UdpTransport::default(), LinkTiming::default())
    }
}

impl<T: FrameTransport> ControllerLink<T> {
    pub fn with_transport(controller_id: u8, transport: T, timing: LinkTiming) -> Self {
        Self {
            controller_id,
            transport,
            timing,
            connected: false,
            init_sent: false,
            // A fresh link always resets the controller before first use.
            require_reset: true,
            last_reply_time: 0,
            frames_sent_after_reply: 0,
        }
    }

    pub fn controller_id(&self) -> u8 {
        self.controller_id
    }

    pub fn require_reset(&self) -> bool {
        self.require_reset
    }

    pub fn schedule_reset(&mut self) {
        self.require_reset = true;
    }

    /// Watchdog: once more than two frames have gone out with no reply
    /// traffic for longer than the threshold, force a reset.
    pub fn update_auto_reset(&mut self, auto_reset_after_no_data_ms: u64) {
        if auto_reset_after_no_data_ms == 0 || self.require_reset || self.frames_sent_after_reply <= 2
        {
            return;
        }
        let reply_delay = now_millis().saturating_sub(self.last_reply_time);
        if reply_delay > auto_reset_after_no_data_ms {
            warn!(
                "No reply from controller {} in {} ms and {} frames, resetting",
                self.controller_id, reply_delay, self.frames_sent_after_reply
            );
            self.require_reset = true;
        }
    }

    /// Brings the link up: connect, run the reset handshake if one is
    /// pending, then send INIT. Returns false on any failure; the caller
    /// retries on its own schedule.
    pub fn init(&mut self) -> bool {
        if !self.connect() {
            return false;
        }
        if self.init_sent && !self.require_reset {
            return true;
        }

        if self.require_reset {
            if self.init_sent {
                warn!("Performing a requested reset on controller {}", self.controller_id);
            }
            if !self.send_packet(&MSG_RESET) {
                return false;
            }
            self.require_reset = false;
            thread::sleep(self.timing.reset_delay);
        }

        if !self.send_packet(&MSG_INIT) {
            return false;
        }
        thread::sleep(self.timing.init_delay);

        self.init_sent = true;
        self.set_last_reply_time();
        true
    }

    /// Transmits one packed frame: drain replies, START, paced data chunks,
    /// END, drain again. Returns false and flags a reset when any packet
    /// fails to go out whole.
    pub fn send_frame(&mut self, frame_data: &[u8]) -> bool {
        self.consume_reply_data();
        if !self.send_packet(&MSG_START_FRAME) {
            return false;
        }
        thread::sleep(self.timing.start_delay);

        let mut packet = [0u8; FRAME_MSG_PREFIX.len() + DATA_CHUNK_LEN + FRAME_MSG_SUFFIX.len()];
        packet[..FRAME_MSG_PREFIX.len()].copy_from_slice(&FRAME_MSG_PREFIX);

        for (message_idx, chunk) in frame_data.chunks(DATA_CHUNK_LEN).enumerate() {
            packet[1] = message_idx as u8;
            let payload =
                &mut packet[FRAME_MSG_PREFIX.len()..FRAME_MSG_PREFIX.len() + DATA_CHUNK_LEN];
            payload[..chunk.len()].copy_from_slice(chunk);
            payload[chunk.len()..].fill(0);
            if !self.send_packet(&packet) {
                return false;
            }
            thread::sleep(self.timing.data_delay);
        }

        if !self.send_packet(&MSG_END_FRAME) {
            return false;
        }
        self.consume_reply_data();
        self.frames_sent_after_reply += 1;
        true
    }

    fn connect(&mut self) -> bool {
        if self.connected {
            return true;
        }
        match self.transport.connect(self.controller_id) {
            Ok(()) => {
                self.connected = true;
                true
            }
            Err(err) => {
                warn!("Connect to controller {} failed: {}", self.controller_id, err);
                self.transport.disconnect();
                false
            }
        }
    }

    fn send_packet(&mut self, data: &[u8]) -> bool {
        match self.transport.send(data) {
            Ok(sent) if sent == data.len() => true,
            Ok(sent) => {
                warn!(
                    "Short UDP write to controller {}: {} of {} bytes",
                    self.controller_id,
                    sent,
                    data.len()
                );
                self.require_reset = true;
                false
            }
            Err(err) => {
                warn!("Send to controller {} failed: {}", self.controller_id, err);
                self.require_reset = true;
                false
            }
        }
    }

    fn consume_reply_data(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            match self.transport.try_recv(&mut buf) {
                Ok(_) => self.set_last_reply_time(),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("Recv from controller {} failed: {}", self.controller_id, err);
                    break;
                }
            }
        }
    }

    fn set_last_reply_time(&mut self) {
        self.last_reply_time = now_millis();
        self.frames_sent_after_reply = 0;
    }

    #[cfg(test)]
    pub(crate) fn frames_sent_after_reply(&self) -> u32 {
        self.frames_sent_after_reply
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_reply(&mut self, ms: u64) {
        self.last_reply_time = self.last_reply_time.saturating_sub(ms);
    }
}
