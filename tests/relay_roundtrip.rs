//! Relay behavior against a fake daemon on the other end of real fds.

use std::os::fd::{AsFd, AsRawFd};
use std::thread;
use std::time::{Duration, Instant};

use luxdm::common::fdio;
use luxdm::relay::{DaemonCommand, DaemonLink, DaemonMsg, NotifyEvent, NotifyQueue, Relay};

fn relay_with_fake_daemon() -> (Relay, std::os::fd::OwnedFd, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("fifo");
    std::fs::write(&fifo, b"").unwrap();

    let (notify_rx, notify_tx) = nix::unistd::pipe().expect("pipe");
    fdio::set_nonblocking(notify_rx.as_raw_fd()).unwrap();

    let link = DaemonLink::open(&fifo).with_pid(1000);
    let relay = Relay::new(link, NotifyQueue::from_fd(notify_rx));
    (relay, notify_tx, dir)
}

#[test]
fn send_without_ack_returns_immediately() {
    let (mut relay, _notify_tx, dir) = relay_with_fake_daemon();
    let started = Instant::now();
    relay.send(&DaemonMsg::XPid(4321), false).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    let written = std::fs::read_to_string(dir.path().join("fifo")).unwrap();
    assert_eq!(written, "\nXPID 1000 4321\n");
}

#[test]
fn ack_wait_completes_when_daemon_answers() {
    let (mut relay, notify_tx, _dir) = relay_with_fake_daemon();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        fdio::write_line(notify_tx.as_fd(), "A").unwrap();
        notify_tx
    });

    let started = Instant::now();
    relay.send(&DaemonMsg::Cookie("deadbeef".into()), true).unwrap();
    assert!(relay.notify.got_ack());
    assert!(started.elapsed() < Duration::from_secs(5));
    let _tx = writer.join().unwrap();
}

#[test]
fn notifications_arriving_with_the_ack_are_not_lost() {
    let (mut relay, notify_tx, _dir) = relay_with_fake_daemon();

    fdio::write_line(notify_tx.as_fd(), "!AllowRoot 0").unwrap();
    fdio::write_line(notify_tx.as_fd(), "A").unwrap();
    fdio::write_line(notify_tx.as_fd(), "#DIRTY_SERVERS").unwrap();

    relay.send(&DaemonMsg::LoggedIn(true), true).unwrap();
    assert!(relay.notify.got_ack());

    let events: Vec<NotifyEvent> = std::iter::from_fn(|| relay.notify.next_event()).collect();
    assert_eq!(
        events,
        vec![
            NotifyEvent::KeyChanged { key: "AllowRoot".into(), value: "0".into() },
            NotifyEvent::Command(DaemonCommand::DirtyServers),
        ]
    );
}

#[test]
fn messages_accumulate_in_order_on_the_fifo() {
    let (mut relay, _notify_tx, dir) = relay_with_fake_daemon();
    relay.send(&DaemonMsg::GreetPid(100), false).unwrap();
    relay.send(&DaemonMsg::LoggedIn(true), false).unwrap();
    relay.send(&DaemonMsg::Login("alice".into()), false).unwrap();
    relay.send(&DaemonMsg::LoggedIn(false), false).unwrap();
    relay.send(&DaemonMsg::Login(String::new()), false).unwrap();

    let written = std::fs::read_to_string(dir.path().join("fifo")).unwrap();
    let lines: Vec<&str> = written.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(
        lines,
        vec![
            "GREETPID 1000 100",
            "LOGGED_IN 1000 1",
            "LOGIN 1000 alice",
            "LOGGED_IN 1000 0",
            "LOGIN 1000 ",
        ]
    );
}

#[test]
fn held_notifications_survive_a_whole_conversation_window() {
    let (mut relay, notify_tx, _dir) = relay_with_fake_daemon();

    // Conversation starts: immediate processing off.
    relay.notify.disable();
    fdio::write_line(notify_tx.as_fd(), "!Greeter /usr/libexec/other-greeter").unwrap();
    fdio::write_line(notify_tx.as_fd(), "!TimedLoginEnable 1").unwrap();
    relay.notify.drain();
    assert!(relay.notify.next_event().is_none());

    // More arrive mid-window.
    fdio::write_line(notify_tx.as_fd(), "!TimedLogin kiosk").unwrap();
    relay.notify.drain();
    assert!(relay.notify.next_event().is_none());

    // Conversation over: everything replays in arrival order.
    relay.notify.enable();
    let keys: Vec<String> = std::iter::from_fn(|| relay.notify.next_event())
        .map(|event| match event {
            NotifyEvent::KeyChanged { key, .. } => key,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(keys, ["Greeter", "TimedLoginEnable", "TimedLogin"]);
}
