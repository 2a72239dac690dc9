//! End-to-end scenarios for the readiness loop: parked callbacks and
//! fibers woken by real descriptors, cancellation semantics, timers
//! driven through the event loop, and a small HTTP echo server.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use weft::error::Error;
use weft::fiber;
use weft::io::{Event, IoManager};

fn pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

#[test]
fn callback_fires_exactly_once() {
    let io = IoManager::new(1, false, "once").unwrap();
    let (mut a, b) = pair();
    let fd = b.as_raw_fd();

    let (tx, rx) = mpsc::channel();
    io.add_event(
        fd,
        Event::READ,
        Some(Box::new(move || tx.send(()).unwrap())),
    )
    .unwrap();

    // The same bit cannot be armed twice.
    match io
        .add_event(fd, Event::READ, Some(Box::new(|| {})))
        .unwrap_err()
    {
        Error::EventAlreadyRegistered(got_fd, ev) => {
            assert_eq!(got_fd, fd);
            assert_eq!(ev, Event::READ);
        }
        other => panic!("expected duplicate registration error, got {}", other),
    }

    a.write_all(b"x").unwrap();
    rx.recv_timeout(Duration::from_secs(8))
        .expect("callback never fired");

    // The subscription was consumed by the first edge; more data must
    // not fire it again.
    a.write_all(b"y").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    assert_eq!(io.pending_events(), 0);

    io.stop();
}

#[test]
fn parked_fiber_resumes_on_readiness() {
    let io = IoManager::new(2, false, "park").unwrap();
    let (mut a, b) = pair();

    let (tx, rx) = mpsc::channel();
    io.spawn(move || {
        let io = IoManager::current().expect("worker knows its io manager");
        let mut b = b;
        io.add_event(b.as_raw_fd(), Event::READ, None).unwrap();
        fiber::yield_now();
        // Back here only once the descriptor signalled.
        let mut buf = [0u8; 8];
        let n = b.read(&mut buf).unwrap();
        tx.send((n, buf[0])).unwrap();
    });

    std::thread::sleep(Duration::from_millis(300));
    a.write_all(b"ping").unwrap();

    let (n, first) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("fiber was not resumed");
    assert_eq!(n, 4);
    assert_eq!(first, b'p');

    io.stop();
}

#[test]
fn cancel_fires_pending_work() {
    let io = IoManager::new(1, false, "cancel").unwrap();
    let (_a, b) = pair();
    let fd = b.as_raw_fd();

    let (tx, rx) = mpsc::channel();
    io.add_event(
        fd,
        Event::READ,
        Some(Box::new(move || tx.send("cancelled").unwrap())),
    )
    .unwrap();

    // No data was ever written; cancel means "fire now, don't wait".
    assert!(io.cancel_event(fd, Event::READ));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(8)).unwrap(),
        "cancelled"
    );
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(!io.cancel_event(fd, Event::READ), "bit is already clear");
    assert_eq!(io.pending_events(), 0);

    io.stop();
}

#[test]
fn del_event_discards_pending_work() {
    let io = IoManager::new(1, false, "del").unwrap();
    let (mut a, b) = pair();
    let fd = b.as_raw_fd();

    let (tx, rx) = mpsc::channel::<()>();
    io.add_event(fd, Event::READ, Some(Box::new(move || tx.send(()).unwrap())))
        .unwrap();

    assert!(io.del_event(fd, Event::READ));
    assert!(!io.del_event(fd, Event::READ), "second removal finds no bit");

    // Even with readable data the discarded handler stays silent.
    a.write_all(b"x").unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
    assert_eq!(io.pending_events(), 0);

    io.stop();
}

#[test]
fn cancel_all_fires_all_directions() {
    let io = IoManager::new(1, false, "all").unwrap();
    let (_a, b) = pair();
    let fd = b.as_raw_fd();

    let (tx, rx) = mpsc::channel();
    io.add_event(fd, Event::READ, Some(Box::new(move || tx.send(()).unwrap())))
        .unwrap();

    assert!(io.cancel_all(fd));
    rx.recv_timeout(Duration::from_secs(8))
        .expect("pending read handler must fire");
    assert!(!io.cancel_all(fd), "nothing left to cancel");

    io.stop();
}

#[test]
fn recurring_timer_ticks_through_the_loop() {
    let io = IoManager::new(1, false, "tick").unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let timer = io.add_timer(
        Duration::from_millis(200),
        {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        },
        true,
    );

    // The first wakeup can take a full idle timeout; after that the
    // loop keys its waits off the timer deadline.
    let deadline = Instant::now() + Duration::from_secs(15);
    while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(count.load(Ordering::SeqCst) >= 3, "timer never got going");

    assert!(timer.cancel());
    io.stop();
}

////////////////////////////////////////////////////////////////////////////////
// Echo server
////////////////////////////////////////////////////////////////////////////////

fn arm_accept(io: &Arc<IoManager>, listener: Arc<TcpListener>) {
    let io_again = io.clone();
    io.add_event(
        listener.as_raw_fd(),
        Event::READ,
        Some(Box::new(move || {
            // Edge-triggered and one-shot: re-register before draining
            // the backlog.
            arm_accept(&io_again, listener.clone());
            loop {
                match listener.accept() {
                    Ok((stream, _)) => serve(&io_again, stream),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        })),
    )
    .unwrap();
}

fn serve(io: &Arc<IoManager>, stream: TcpStream) {
    stream.set_nonblocking(true).unwrap();
    let fd = stream.as_raw_fd();
    let mut stream = stream;
    io.add_event(
        fd,
        Event::READ,
        Some(Box::new(move || {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => return,
                }
            }
            let body = "Hello, World!";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
            // Dropping the stream closes the connection.
        })),
    )
    .unwrap();
}

#[test]
fn echo_server_answers_http() {
    let io = IoManager::new(2, false, "echo").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let listener_fd = listener.as_raw_fd();
    arm_accept(&io, Arc::new(listener));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(
        response.starts_with("HTTP/1.1 200 OK"),
        "unexpected response: {}",
        response
    );
    assert!(response.ends_with("Hello, World!"));

    // Drop the standing accept subscription so the loop can wind down.
    assert!(io.del_event(listener_fd, Event::READ));
    io.stop();
}
