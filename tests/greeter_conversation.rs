//! End-to-end greeter conversations over real pipes.
//!
//! A scripted greeter runs on a thread behind a pipe pair and answers
//! the slave's control requests, exercising the full framing path:
//! request encoding, noise skipping, STX framing and BEL interrupts.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::thread;

use luxdm::common::fdio;
use luxdm::greeter::{GreeterChannel, Opcode};

const STX: u8 = 0x02;
const BEL: u8 = 0x07;

/// A scripted greeter: reads framed requests, answers from a playbook
/// keyed by opcode byte.
fn scripted_greeter(
    responses: Vec<(u8, Vec<u8>)>,
) -> (GreeterChannel, thread::JoinHandle<Vec<Vec<u8>>>) {
    let (reply_rx, reply_tx) = nix::unistd::pipe().expect("pipe");
    let (req_rx, req_tx) = nix::unistd::pipe().expect("pipe");

    let handle = thread::spawn(move || {
        let mut seen = Vec::new();
        let mut reply_file = std::fs::File::from(reply_tx);
        let reader = BufReader::new(std::fs::File::from(req_rx));
        let mut playbook = responses.into_iter();
        for line in reader.split(b'\n') {
            let Ok(line) = line else { break };
            seen.push(line.clone());
            // Request lines are STX + opcode + argument.
            let opcode = line.get(1).copied().unwrap_or(0);
            match playbook.next() {
                Some((expect, reply)) => {
                    assert_eq!(opcode, expect, "greeter got unexpected opcode");
                    if reply_file.write_all(&reply).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        seen
    });

    (GreeterChannel::from_fds(reply_rx, req_tx), handle)
}

fn framed(text: &str) -> Vec<u8> {
    let mut out = vec![STX];
    out.extend_from_slice(text.as_bytes());
    out.push(b'\n');
    out
}

#[test]
fn username_password_exchange() {
    let (mut chan, greeter) = scripted_greeter(vec![
        (b'N', framed("alice")),
        (b'U', framed("hunter2")),
        (b'P', framed("")),
    ]);

    assert_eq!(chan.ctl(Opcode::Prompt, "Username:"), Some("alice".into()));
    assert_eq!(chan.ctl(Opcode::NoEcho, "Password:"), Some("hunter2".into()));
    chan.quit();
    drop(chan);

    let seen = greeter.join().unwrap();
    assert_eq!(seen[0], b"\x02NUsername:");
    assert_eq!(seen[1], b"\x02UPassword:");
    assert_eq!(seen[2], b"\x02P");
}

#[test]
fn noise_before_the_frame_is_skipped() {
    let mut reply = b"Gtk-WARNING: something leaked\n".to_vec();
    reply.extend_from_slice(&framed("bob"));
    let (mut chan, greeter) = scripted_greeter(vec![(b'N', reply)]);

    assert_eq!(chan.ctl(Opcode::Prompt, "Username:"), Some("bob".into()));
    assert!(!chan.interrupted());
    drop(chan);
    let _ = greeter.join();
}

#[test]
fn timed_login_interrupt_aborts_the_prompt() {
    let mut reply = vec![STX, BEL, b'T', b'\n'];
    reply.extend_from_slice(&framed("ignored"));
    let (mut chan, greeter) = scripted_greeter(vec![(b'N', reply)]);

    // The interrupt wins even though a well-formed answer follows.
    assert_eq!(chan.ctl(Opcode::Prompt, "Username:"), None);
    assert!(chan.take_interrupted());
    assert!(chan.flags().do_timed_login);
    assert!(chan.alive());
    drop(chan);
    let _ = greeter.join();
}

#[test]
fn greeter_death_mid_conversation_is_an_interruption() {
    // Playbook runs dry after the first answer; the thread closes its
    // end of the pipes, which the channel must treat as "greeter gone".
    let (mut chan, greeter) = scripted_greeter(vec![(b'N', framed("alice"))]);

    assert_eq!(chan.ctl(Opcode::Prompt, "Username:"), Some("alice".into()));
    assert_eq!(chan.ctl(Opcode::NoEcho, "Password:"), None);
    assert!(chan.interrupted());
    assert!(!chan.alive());
    // Once gone, further calls short-circuit.
    assert_eq!(chan.ctl(Opcode::Msg, "hello?"), None);
    let _ = greeter.join();
}

#[test]
fn cancel_interrupt_sets_only_the_cancel_flag() {
    let (mut chan, greeter) = scripted_greeter(vec![(b'U', vec![STX, BEL, b'X', b'\n'])]);

    assert_eq!(chan.ctl(Opcode::NoEcho, "Password:"), None);
    let flags = chan.take_flags();
    assert!(flags.do_cancel);
    assert!(!flags.do_timed_login);
    assert!(!flags.do_configurator);
    drop(chan);
    let _ = greeter.join();
}

#[test]
fn fdio_line_helpers_interoperate_with_the_channel() {
    let (rx, tx) = nix::unistd::pipe().expect("pipe");
    fdio::write_line(tx.as_fd(), "plain line").unwrap();
    let got = fdio::read_line(rx.as_fd()).unwrap().unwrap();
    assert_eq!(got, b"plain line");
    let _keep: (OwnedFd, OwnedFd) = (rx, tx);
}
