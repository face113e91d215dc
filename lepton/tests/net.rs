//! Socket wrappers over loopback TCP, plus the task-blocking epoll_wait.

use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

use lepton::RuntimeConfig;

fn loopback_addr(port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
        },
        sin_zero: [0; 8],
    }
}

fn bound_listener() -> (RawFd, u16) {
    let fd = lepton::io::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    let addr = loopback_addr(0);
    // SAFETY: addr is a valid sockaddr_in.
    unsafe {
        lepton::io::bind(
            fd,
            (&addr as *const libc::sockaddr_in).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
        .unwrap();
    }
    lepton::io::listen(fd, 8).unwrap();
    // Recover the assigned port.
    let mut out: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    // SAFETY: out/len are valid out-parameters.
    let r = unsafe {
        libc::getsockname(fd, (&mut out as *mut libc::sockaddr_in).cast(), &mut len)
    };
    assert_eq!(r, 0);
    (fd, u16::from_be(out.sin_port))
}

#[test]
fn net_suite() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _scope = RuntimeConfig::new(1, 2).bootstrap();

    tcp_echo_round_trip();
    epoll_wait_wrapper();
}

// accept parks until a connection arrives; connect takes the EINPROGRESS
// path; send/recv echo through the wrappers.
fn tcp_echo_round_trip() {
    let (listener, port) = bound_listener();

    let server = lepton::spawn(move || {
        let conn = lepton::io::accept(listener).unwrap();
        let mut buf = [0u8; 16];
        let n = lepton::io::recv(conn, &mut buf, 0).unwrap();
        let sent = lepton::io::send(conn, &buf[..n], 0).unwrap();
        lepton::io::close(conn).unwrap();
        (n, sent)
    });

    let client = lepton::spawn(move || {
        let fd = lepton::io::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let addr = loopback_addr(port);
        // SAFETY: addr is a valid sockaddr_in.
        unsafe {
            lepton::io::connect(
                fd,
                (&addr as *const libc::sockaddr_in).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
            .unwrap();
        }
        assert_eq!(lepton::io::send(fd, b"ping-pong", 0).unwrap(), 9);
        let mut buf = [0u8; 16];
        let n = lepton::io::recv(fd, &mut buf, 0).unwrap();
        lepton::io::close(fd).unwrap();
        (n, buf)
    });

    let (received, echoed) = server.join().unwrap();
    let (n, buf) = client.join().unwrap();
    assert_eq!((received, echoed, n), (9, 9, 9));
    assert_eq!(&buf[..9], b"ping-pong");
    lepton::io::close(listener).unwrap();
}

// The epoll_wait wrapper parks the task, not the worker: the writer task
// shares the same runtime and still gets to run.
fn epoll_wait_wrapper() {
    // SAFETY: plain syscall.
    let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    assert!(epfd >= 0);
    let (rd, wr) = lepton::io::pipe(0).unwrap();
    let mut ev = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: rd as u64,
    };
    // SAFETY: ev outlives the call.
    let r = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, rd, &mut ev) };
    assert_eq!(r, 0);

    let waiter = lepton::spawn(move || {
        let mut events: [libc::epoll_event; 8] = unsafe { std::mem::zeroed() };
        lepton::io::epoll_wait(epfd, &mut events, 1000).unwrap()
    });
    lepton::sleep(Duration::from_millis(10));
    assert_eq!(lepton::io::write(wr, &[1]).unwrap(), 1);
    assert_eq!(waiter.join().unwrap(), 1);

    // Zero timeout stays nonblocking: drain the pipe first.
    let mut buf = [0u8; 4];
    lepton::io::read(rd, &mut buf).unwrap();
    let mut events: [libc::epoll_event; 8] = unsafe { std::mem::zeroed() };
    assert_eq!(lepton::io::epoll_wait(epfd, &mut events, 0).unwrap(), 0);

    lepton::io::close(rd).unwrap();
    lepton::io::close(wr).unwrap();
    lepton::io::close(epfd).unwrap();
}
