//! Client side of the compositor bridge.
//!
//! When the windowing server the application talks to cannot receive
//! dma-buf buffers directly, frames are handed to the compositor process
//! over an out-of-band `SOCK_SEQPACKET` socket instead: the fixed-size
//! packet describes the frame, the plane fds ride along as `SCM_RIGHTS`
//! ancillary data, and the compositor reports per-frame acceptance
//! asynchronously through `Feedback` packets.
//!
//! Connection management is deliberately pessimistic: one failed connect
//! makes the client give up for its whole lifetime (no retry storms), and
//! any I/O error tears the connection down and forgets every negotiated
//! capability, so the next send re-probes from scratch.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{
    connect, recv, sendmsg, socket, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType,
    UnixAddr,
};
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::protocol::{
    Opcode, Packet, PlaneSlot, FEEDBACK_CAP_SYNC, FEEDBACK_FAILED, HELLO_FRAME_ID, MAX_PLANES,
    PACKET_SIZE,
};

/// Bounded wait for the capability probe reply.
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Process-wide "the bridge broke at runtime" switch.
///
/// A sustained bridge malfunction disables the fast path once per process
/// rather than retrying per call; swapchains consult the flag at creation
/// time and fall back to the shared-memory path. The flag is an explicit
/// shared handle so tests can inject an already-disabled instance.
#[derive(Clone, Debug, Default)]
pub struct BridgeAvailability {
    disabled: Arc<AtomicBool>,
}

impl BridgeAvailability {
    /// A fresh, enabled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that is already tripped.
    pub fn already_disabled() -> Self {
        let availability = Self::new();
        availability.disabled.store(true, Ordering::Release);
        availability
    }

    /// The shared per-process instance.
    pub fn process_wide() -> Self {
        static PROCESS: OnceLock<BridgeAvailability> = OnceLock::new();
        PROCESS.get_or_init(BridgeAvailability::new).clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Trip the flag; returns whether it was already tripped, so the
    /// caller can log the disable exactly once.
    pub fn disable(&self) -> bool {
        self.disabled.swap(true, Ordering::AcqRel)
    }
}

/// A decoded `Feedback` reply.
#[derive(Debug, Clone, Copy)]
pub struct Feedback {
    pub flags: u32,
    pub xid: u32,
}

/// One plane of an outgoing frame.
pub struct FramePlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub offset: u32,
    pub stride: i32,
}

/// Stateful client of the bridge socket.
///
/// The socket fd is owned by exactly one client and only ever touched by
/// the thread performing the present, so the frame-id counter and the
/// connection flags are effectively single-writer.
pub struct BridgeClient {
    socket_path: PathBuf,
    feedback_timeout: Duration,
    socket: Option<OwnedFd>,
    connect_failed: bool,
    feedback_probe_done: bool,
    feedback_sync_enabled: bool,
    next_frame_id: u32,
}

impl BridgeClient {
    pub fn new(socket_path: PathBuf, feedback_timeout: Duration) -> Self {
        Self {
            socket_path,
            feedback_timeout,
            socket: None,
            connect_failed: false,
            feedback_probe_done: false,
            feedback_sync_enabled: false,
            next_frame_id: 1,
        }
    }

    /// A client for the configured socket, or `None` when the bridge path
    /// is not configured at all.
    pub fn from_config(config: &BridgeConfig) -> Option<Self> {
        config
            .socket_path
            .as_ref()
            .map(|path| Self::new(path.clone(), config.feedback_timeout))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether ack-based pacing was negotiated and is still trusted.
    pub fn is_feedback_sync_enabled(&self) -> bool {
        self.feedback_sync_enabled
    }

    /// Submit one frame.
    ///
    /// Returns `true` when the frame was handed to the compositor. A
    /// feedback timeout still counts as submitted: it permanently disables
    /// feedback pacing for this client but does not un-send the frame,
    /// and a feedback reply carrying the failure flag is logged without
    /// failing the call for the same reason.
    pub fn present_frame(
        &mut self,
        xid: u32,
        width: u32,
        height: u32,
        fourcc: u32,
        modifier: u64,
        planes: &[FramePlane<'_>],
    ) -> bool {
        if planes.is_empty() || planes.len() > MAX_PLANES {
            return false;
        }
        if planes.iter().any(|plane| plane.stride < 0) {
            return false;
        }

        let frame_id = self.allocate_frame_id();

        let mut packet = Packet::control(Opcode::Frame, xid);
        packet.width = width;
        packet.height = height;
        packet.format = fourcc;
        packet.num_planes = planes.len() as u32;
        packet.frame_id = frame_id;
        for (slot, plane) in packet.planes.iter_mut().zip(planes) {
            *slot = PlaneSlot::new(plane.offset, plane.stride as u32, modifier);
        }

        let fds: Vec<RawFd> = planes.iter().map(|plane| plane.fd.as_raw_fd()).collect();
        if !self.send_packet(&packet, &fds) {
            return false;
        }

        if !self.feedback_sync_enabled {
            return true;
        }

        match self.wait_for_feedback(frame_id, self.feedback_timeout) {
            None => {
                warn!(
                    frame_id,
                    xid, "feedback timed out, disabling ack-based pacing for this connection"
                );
                self.feedback_sync_enabled = false;
                true
            }
            Some(feedback) => {
                if feedback.flags & FEEDBACK_FAILED != 0 {
                    warn!(
                        frame_id,
                        xid,
                        ack_xid = feedback.xid,
                        "compositor rejected frame via feedback"
                    );
                }
                true
            }
        }
    }

    /// Best-effort notification that `xid` will receive no further
    /// frames. Failures are ignored; teardown is imminent anyway.
    pub fn stop_stream(&mut self, xid: u32) {
        let packet = Packet::control(Opcode::Stop, xid);
        let _ = self.send_packet(&packet, &[]);
    }

    /// Non-zero frame id from a wrapping counter.
    fn allocate_frame_id(&mut self) -> u32 {
        let mut id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        if id == 0 {
            id = self.next_frame_id;
            self.next_frame_id = self.next_frame_id.wrapping_add(1);
        }
        id
    }

    fn ensure_connected(&mut self) -> bool {
        if self.socket.is_some() {
            return true;
        }
        if self.connect_failed {
            return false;
        }

        let fd = match socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        ) {
            Ok(fd) => fd,
            Err(err) => {
                warn!("bridge socket() failed: {}", err);
                self.connect_failed = true;
                return false;
            }
        };

        let addr = match UnixAddr::new(self.socket_path.as_path()) {
            Ok(addr) => addr,
            Err(err) => {
                warn!(
                    "bridge socket path {} is unusable: {}",
                    self.socket_path.display(),
                    err
                );
                self.connect_failed = true;
                return false;
            }
        };

        if let Err(err) = connect(fd.as_raw_fd(), &addr) {
            warn!(
                "bridge connect({}) failed: {}",
                self.socket_path.display(),
                err
            );
            self.connect_failed = true;
            return false;
        }

        self.socket = Some(fd);
        self.connect_failed = false;
        self.feedback_probe_done = false;
        self.feedback_sync_enabled = false;
        info!(
            "connected to compositor bridge at {}",
            self.socket_path.display()
        );
        let _ = self.probe_feedback_support();
        true
    }

    /// Ask a fresh connection whether it supports ack-based pacing.
    fn probe_feedback_support(&mut self) -> bool {
        if self.feedback_probe_done {
            return self.feedback_sync_enabled;
        }
        self.feedback_probe_done = true;

        let mut packet = Packet::control(Opcode::Hello, 0);
        packet.frame_id = HELLO_FRAME_ID;
        if !self.send_packet(&packet, &[]) {
            return false;
        }

        match self.wait_for_feedback(HELLO_FRAME_ID, PROBE_TIMEOUT) {
            Some(feedback) if feedback.flags & FEEDBACK_CAP_SYNC != 0 => {
                self.feedback_sync_enabled = true;
                info!("bridge sync feedback enabled (ack-based pacing)");
                true
            }
            _ => {
                info!("bridge sync feedback unsupported by server, using fallback pacing");
                false
            }
        }
    }

    /// Wait for a `Feedback` packet matching `expected_frame_id`.
    ///
    /// Foreign packets, wrong opcodes and unmatched frame ids are skipped
    /// without ending the wait; only the deadline or a connection-level
    /// failure does. The poll-based wait stays responsive to the peer
    /// closing the socket mid-wait.
    fn wait_for_feedback(&mut self, expected_frame_id: u32, timeout: Duration) -> Option<Feedback> {
        let deadline = Instant::now() + timeout;

        loop {
            let raw = self.socket.as_ref()?.as_raw_fd();

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining_ms = (deadline - now).as_millis().clamp(1, i32::MAX as u128) as i32;

            let mut pollfd = libc::pollfd {
                fd: raw,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: pollfd is valid and on the stack.
            let rc = unsafe { libc::poll(&mut pollfd, 1, remaining_ms) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                warn!("bridge poll() failed while waiting for feedback: {}", err);
                self.reset_connection();
                return None;
            }
            if rc == 0 {
                continue; // deadline re-checked at the top
            }
            if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                warn!(
                    "bridge feedback channel closed (revents={:#x})",
                    pollfd.revents
                );
                self.reset_connection();
                return None;
            }
            if pollfd.revents & libc::POLLIN == 0 {
                continue;
            }

            let mut buf = [0u8; PACKET_SIZE];
            let received = match recv(raw, &mut buf, MsgFlags::MSG_DONTWAIT) {
                Ok(n) => n,
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(err) => {
                    warn!("bridge recv() failed while waiting for feedback: {}", err);
                    self.reset_connection();
                    return None;
                }
            };
            if received == 0 {
                self.reset_connection();
                return None;
            }
            if received != PACKET_SIZE {
                warn!(
                    "bridge feedback packet size mismatch: expected={} got={}",
                    PACKET_SIZE, received
                );
                continue;
            }

            let packet = match Packet::decode(&buf) {
                Ok(packet) => packet,
                // Foreign or skewed traffic is not ours to fail on.
                Err(_) => continue,
            };
            if packet.opcode != Opcode::Feedback {
                continue;
            }
            if packet.frame_id != expected_frame_id {
                continue;
            }

            return Some(Feedback {
                flags: packet.flags,
                xid: packet.xid,
            });
        }
    }

    /// Send one packet, with `fds` attached as ancillary data. Any
    /// failure (including a short send - the transport preserves message
    /// boundaries, so a short send is a broken peer) tears the
    /// connection down.
    fn send_packet(&mut self, packet: &Packet, fds: &[RawFd]) -> bool {
        if fds.len() > MAX_PLANES {
            return false;
        }
        if !self.ensure_connected() {
            return false;
        }
        let raw = match &self.socket {
            Some(socket) => socket.as_raw_fd(),
            None => return false,
        };

        let encoded = packet.encode();
        let iov = [IoSlice::new(&encoded)];
        let cmsg_holder = (!fds.is_empty()).then(|| ControlMessage::ScmRights(fds));
        let cmsgs: &[ControlMessage] = match cmsg_holder.as_ref() {
            Some(cmsg) => std::slice::from_ref(cmsg),
            None => &[],
        };

        match sendmsg::<()>(raw, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(sent) if sent == encoded.len() => true,
            Ok(sent) => {
                warn!(
                    "bridge short send: expected={} sent={}",
                    encoded.len(),
                    sent
                );
                self.reset_connection();
                false
            }
            Err(err) => {
                warn!("bridge sendmsg failed: {}", err);
                self.reset_connection();
                false
            }
        }
    }

    /// Tear the connection down and forget every negotiated capability.
    /// The sticky `connect_failed` flag is left alone: reconnects within
    /// one client lifetime happen only if connecting never failed.
    fn reset_connection(&mut self) {
        self.socket = None;
        self.feedback_probe_done = false;
        self.feedback_sync_enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_ids_skip_zero_across_wrap() {
        let mut client = BridgeClient::new(PathBuf::from("/nonexistent"), PROBE_TIMEOUT);
        client.next_frame_id = u32::MAX;
        assert_eq!(client.allocate_frame_id(), u32::MAX);
        // The counter wrapped to 0; the id must not be 0.
        assert_eq!(client.allocate_frame_id(), 1);
        assert_eq!(client.allocate_frame_id(), 2);
    }

    #[test]
    fn failed_connect_is_sticky() {
        let mut client = BridgeClient::new(
            PathBuf::from("/nonexistent/wsi-bridge.sock"),
            PROBE_TIMEOUT,
        );
        assert!(!client.ensure_connected());
        assert!(client.connect_failed);
        // No second attempt is made.
        assert!(!client.ensure_connected());
        assert!(!client.present_frame(1, 64, 64, 0, 0, &[]));
    }

    #[test]
    fn availability_disable_reports_prior_state() {
        let availability = BridgeAvailability::new();
        assert!(!availability.is_disabled());
        assert!(!availability.disable());
        assert!(availability.disable());
        assert!(availability.is_disabled());

        let pre_disabled = BridgeAvailability::already_disabled();
        assert!(pre_disabled.is_disabled());
    }

    #[test]
    fn availability_clones_share_state() {
        let availability = BridgeAvailability::new();
        let clone = availability.clone();
        availability.disable();
        assert!(clone.is_disabled());
    }
}
