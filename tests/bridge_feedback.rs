//! Exercise the real bridge client against an in-process compositor stub.
//!
//! The stub owns a `SOCK_SEQPACKET` listener and scripts its replies per
//! test: acknowledge the capability probe (or not), answer frame
//! feedback (or not, or with garbage first) and record everything it
//! received, including the passed file descriptors.

use std::io::{IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use nix::cmsg_space;
use nix::sys::socket::{
    accept, bind, listen, recvmsg, send, socket, AddressFamily, Backlog, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};

use wsi_bridge::bridge::{BridgeClient, FramePlane};
use wsi_bridge::protocol::{
    Opcode, Packet, FEEDBACK_CAP_SYNC, FEEDBACK_FAILED, HELLO_FRAME_ID, PACKET_SIZE,
};

/// Route client logs to the test output; `RUST_LOG=debug` shows the
/// connection lifecycle.
fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn unique_socket_path(tag: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "wsi-bridge-test-{}-{}-{}.sock",
        std::process::id(),
        tag,
        n
    ))
}

struct StubServer {
    listener: OwnedFd,
    path: PathBuf,
}

impl StubServer {
    fn bind(tag: &str) -> Self {
        let path = unique_socket_path(tag);
        let _ = std::fs::remove_file(&path);
        let listener = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .expect("socket");
        let addr = UnixAddr::new(path.as_path()).expect("addr");
        bind(listener.as_raw_fd(), &addr).expect("bind");
        listen(&listener, Backlog::new(4).expect("backlog")).expect("listen");
        Self { listener, path }
    }

    fn accept(&self) -> OwnedFd {
        let fd = accept(self.listener.as_raw_fd()).expect("accept");
        // SAFETY: accept returned a fresh descriptor we now own.
        unsafe { OwnedFd::from_raw_fd(fd) }
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn recv_packet(conn: &OwnedFd) -> (Packet, Vec<OwnedFd>) {
    let mut buf = [0u8; PACKET_SIZE];
    let (bytes, fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buffer = cmsg_space!([RawFd; 4]);
        let msg = recvmsg::<()>(
            conn.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )
        .expect("recvmsg");
        let mut fds = Vec::new();
        for cmsg in msg.cmsgs().expect("cmsgs") {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                for raw in raw_fds {
                    // SAFETY: SCM_RIGHTS delivered a fresh descriptor.
                    fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
        (msg.bytes, fds)
    };
    (Packet::decode(&buf[..bytes]).expect("decode"), fds)
}

fn send_feedback(conn: &OwnedFd, frame_id: u32, flags: u32, xid: u32) {
    let mut reply = Packet::control(Opcode::Feedback, xid);
    reply.frame_id = frame_id;
    reply.flags = flags;
    let encoded = reply.encode();
    send(conn.as_raw_fd(), &encoded, MsgFlags::empty()).expect("send feedback");
}

fn send_raw(conn: &OwnedFd, raw: &[u8]) {
    send(conn.as_raw_fd(), raw, MsgFlags::empty()).expect("send raw");
}

/// A pipe pair standing in for a dma-buf: the read end travels over the
/// bridge, the write end stays here to prove it is the same object.
fn fake_dmabuf() -> (OwnedFd, OwnedFd) {
    let mut fds = [0i32; 2];
    // SAFETY: plain pipe creation; both ends adopted below.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    // SAFETY: fresh descriptors from pipe().
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn present_one(client: &mut BridgeClient, plane_fd: &OwnedFd, xid: u32) -> bool {
    let planes = [FramePlane {
        fd: plane_fd.as_fd(),
        offset: 0,
        stride: 256 * 4,
    }];
    client.present_frame(xid, 256, 256, 0x3432_5258, 0, &planes)
}

#[test]
fn probe_and_frame_with_feedback() {
    init_logging();
    let server = StubServer::bind("probe");
    let path = server.path.clone();

    let server_thread = std::thread::spawn(move || {
        let conn = server.accept();

        let (hello, hello_fds) = recv_packet(&conn);
        assert_eq!(hello.opcode, Opcode::Hello);
        assert_eq!(hello.frame_id, HELLO_FRAME_ID);
        assert!(hello_fds.is_empty());
        send_feedback(&conn, HELLO_FRAME_ID, FEEDBACK_CAP_SYNC, 0);

        let (frame, frame_fds) = recv_packet(&conn);
        assert_eq!(frame.opcode, Opcode::Frame);
        assert_eq!(frame.xid, 0x77);
        assert_eq!(frame.width, 256);
        assert_eq!(frame.num_planes, 1);
        assert_ne!(frame.frame_id, 0);
        assert_eq!(frame_fds.len(), 1);
        send_feedback(&conn, frame.frame_id, 0, frame.xid);

        frame_fds
    });

    let mut client = BridgeClient::new(path, Duration::from_millis(500));
    let (read_end, write_end) = fake_dmabuf();
    assert!(present_one(&mut client, &read_end, 0x77));
    assert!(client.is_feedback_sync_enabled());

    // The descriptor that arrived is the same pipe: bytes written here
    // come out of the transferred fd.
    let received = server_thread.join().unwrap();
    let mut writer = std::fs::File::from(write_end);
    writer.write_all(b"zero-copy").unwrap();
    let mut transferred = std::fs::File::from(received.into_iter().next().unwrap());
    let mut contents = [0u8; 9];
    transferred.read_exact(&mut contents).unwrap();
    assert_eq!(&contents, b"zero-copy");
}

#[test]
fn frame_ids_are_unique_and_nonzero() {
    let server = StubServer::bind("frameid");
    let path = server.path.clone();
    const FRAMES: usize = 8;

    let server_thread = std::thread::spawn(move || {
        let conn = server.accept();
        let (hello, _) = recv_packet(&conn);
        assert_eq!(hello.opcode, Opcode::Hello);
        send_feedback(&conn, HELLO_FRAME_ID, FEEDBACK_CAP_SYNC, 0);

        let mut seen = Vec::new();
        for _ in 0..FRAMES {
            let (frame, _fds) = recv_packet(&conn);
            assert_eq!(frame.opcode, Opcode::Frame);
            assert_ne!(frame.frame_id, 0);
            assert!(
                !seen.contains(&frame.frame_id),
                "frame id {} reused",
                frame.frame_id
            );
            seen.push(frame.frame_id);
            send_feedback(&conn, frame.frame_id, 0, frame.xid);
        }
    });

    let mut client = BridgeClient::new(path, Duration::from_millis(500));
    let (read_end, _write_end) = fake_dmabuf();
    for _ in 0..FRAMES {
        assert!(present_one(&mut client, &read_end, 1));
    }
    server_thread.join().unwrap();
}

#[test]
fn feedback_timeout_permanently_disables_sync() {
    init_logging();
    let server = StubServer::bind("timeout");
    let path = server.path.clone();

    let server_thread = std::thread::spawn(move || {
        let conn = server.accept();
        let (hello, _) = recv_packet(&conn);
        assert_eq!(hello.opcode, Opcode::Hello);
        send_feedback(&conn, HELLO_FRAME_ID, FEEDBACK_CAP_SYNC, 0);

        // Swallow frames without ever acknowledging them.
        let (first, _) = recv_packet(&conn);
        assert_eq!(first.opcode, Opcode::Frame);
        let (second, _) = recv_packet(&conn);
        assert_eq!(second.opcode, Opcode::Frame);
    });

    let timeout = Duration::from_millis(80);
    let mut client = BridgeClient::new(path, timeout);
    let (read_end, _write_end) = fake_dmabuf();

    // First present blocks for the full feedback timeout, still counts
    // as submitted, and trips the permanent fallback.
    let start = Instant::now();
    assert!(present_one(&mut client, &read_end, 1));
    assert!(start.elapsed() >= timeout);
    assert!(!client.is_feedback_sync_enabled());

    // Later presents no longer block on feedback.
    let start = Instant::now();
    assert!(present_one(&mut client, &read_end, 1));
    assert!(start.elapsed() < timeout);
    assert!(!client.is_feedback_sync_enabled());

    server_thread.join().unwrap();
}

#[test]
fn unanswered_probe_falls_back_to_timer_pacing() {
    let server = StubServer::bind("noprobe");
    let path = server.path.clone();

    let server_thread = std::thread::spawn(move || {
        let conn = server.accept();
        let (hello, _) = recv_packet(&conn);
        assert_eq!(hello.opcode, Opcode::Hello);
        // Stay silent: this server predates feedback.
        let (frame, _) = recv_packet(&conn);
        assert_eq!(frame.opcode, Opcode::Frame);
    });

    let mut client = BridgeClient::new(path, Duration::from_millis(500));
    let (read_end, _write_end) = fake_dmabuf();
    assert!(present_one(&mut client, &read_end, 1));
    assert!(!client.is_feedback_sync_enabled());
    server_thread.join().unwrap();
}

#[test]
fn malformed_packets_are_skipped_without_killing_the_wait() {
    let server = StubServer::bind("garbage");
    let path = server.path.clone();

    let server_thread = std::thread::spawn(move || {
        let conn = server.accept();
        let (hello, _) = recv_packet(&conn);
        assert_eq!(hello.opcode, Opcode::Hello);
        send_feedback(&conn, HELLO_FRAME_ID, FEEDBACK_CAP_SYNC, 0);

        let (frame, _) = recv_packet(&conn);

        // Wrong magic.
        let mut bad_magic = Packet::control(Opcode::Feedback, 0).encode();
        bad_magic[0] ^= 0xff;
        send_raw(&conn, &bad_magic);

        // Wrong version.
        let mut bad_version = Packet::control(Opcode::Feedback, 0).encode();
        bad_version[4] = 0x7f;
        send_raw(&conn, &bad_version);

        // Right shape, wrong frame id.
        send_feedback(&conn, frame.frame_id.wrapping_add(1), FEEDBACK_FAILED, 0);

        // Finally the real answer.
        send_feedback(&conn, frame.frame_id, 0, frame.xid);
    });

    let mut client = BridgeClient::new(path, Duration::from_millis(1000));
    let (read_end, _write_end) = fake_dmabuf();
    let start = Instant::now();
    assert!(present_one(&mut client, &read_end, 1));
    // The matching reply ended the wait early; the garbage neither
    // terminated the loop nor burned the whole timeout.
    assert!(start.elapsed() < Duration::from_millis(900));
    assert!(client.is_feedback_sync_enabled());
    server_thread.join().unwrap();
}

#[test]
fn feedback_failure_flag_does_not_fail_the_present() {
    let server = StubServer::bind("rejected");
    let path = server.path.clone();

    let server_thread = std::thread::spawn(move || {
        let conn = server.accept();
        let (hello, _) = recv_packet(&conn);
        assert_eq!(hello.opcode, Opcode::Hello);
        send_feedback(&conn, HELLO_FRAME_ID, FEEDBACK_CAP_SYNC, 0);

        let (frame, _) = recv_packet(&conn);
        send_feedback(&conn, frame.frame_id, FEEDBACK_FAILED, frame.xid);
    });

    let mut client = BridgeClient::new(path, Duration::from_millis(500));
    let (read_end, _write_end) = fake_dmabuf();
    // The frame was already submitted; rejection only informs pacing.
    assert!(present_one(&mut client, &read_end, 1));
    assert!(client.is_feedback_sync_enabled());
    server_thread.join().unwrap();
}

#[test]
fn stop_stream_reaches_the_server() {
    let server = StubServer::bind("stop");
    let path = server.path.clone();

    let server_thread = std::thread::spawn(move || {
        let conn = server.accept();
        let (hello, _) = recv_packet(&conn);
        assert_eq!(hello.opcode, Opcode::Hello);
        // No probe reply; stop must still arrive.
        let (stop, _) = recv_packet(&conn);
        assert_eq!(stop.opcode, Opcode::Stop);
        assert_eq!(stop.xid, 0xabcd);
    });

    let mut client = BridgeClient::new(path, Duration::from_millis(500));
    client.stop_stream(0xabcd);
    server_thread.join().unwrap();
}

#[test]
fn zero_or_too_many_planes_are_rejected_locally() {
    let mut client = BridgeClient::new(unique_socket_path("planes"), Duration::from_millis(50));
    assert!(!client.present_frame(1, 64, 64, 0, 0, &[]));

    let pipes: Vec<(OwnedFd, OwnedFd)> = (0..5).map(|_| fake_dmabuf()).collect();
    let planes: Vec<FramePlane<'_>> = pipes
        .iter()
        .map(|(read_end, _)| FramePlane {
            fd: read_end.as_fd(),
            offset: 0,
            stride: 64,
        })
        .collect();
    assert!(!client.present_frame(1, 64, 64, 0, 0, &planes));
}
