//! Property tests for the greeter wire framing.

use proptest::prelude::*;

use luxdm::common::fdio;
use luxdm::greeter::{GreeterChannel, Opcode};
use std::os::fd::AsFd;

fn channel_with_bytes(bytes: &[u8]) -> (GreeterChannel, std::os::fd::OwnedFd) {
    let (reply_rx, reply_tx) = nix::unistd::pipe().expect("pipe");
    let (req_rx, req_tx) = nix::unistd::pipe().expect("pipe");
    fdio::write_all(reply_tx.as_fd(), bytes).expect("preload");
    drop(reply_tx);
    (GreeterChannel::from_fds(reply_rx, req_tx), req_rx)
}

proptest! {
    /// Whatever junk precedes the first STX, the framed answer survives.
    #[test]
    fn garbage_prefix_never_corrupts_the_answer(
        prefix in proptest::collection::vec(any::<u8>(), 0..64),
        answer in "[a-zA-Z0-9 _.-]{0,40}",
    ) {
        // Keep the noise free of STX so the real frame is the first one.
        let prefix: Vec<u8> = prefix.into_iter().filter(|&b| b != 0x02).collect();

        let mut script = prefix;
        script.push(0x02);
        script.extend_from_slice(answer.as_bytes());
        script.push(b'\n');

        let (mut chan, _req_rx) = channel_with_bytes(&script);
        let got = chan.ctl(Opcode::Prompt, "Username:");
        if answer.is_empty() {
            prop_assert_eq!(got, None);
            prop_assert!(!chan.interrupted());
        } else {
            prop_assert_eq!(got, Some(answer));
        }
    }

    /// A BEL reply is always an interruption, no matter the payload.
    #[test]
    fn bel_interrupts_regardless_of_trailing_bytes(
        trailing in "[a-zA-Z0-9 ]{0,40}",
    ) {
        let mut script = vec![0x02, 0x07, b'T'];
        script.extend_from_slice(trailing.as_bytes());
        script.push(b'\n');

        let (mut chan, _req_rx) = channel_with_bytes(&script);
        prop_assert_eq!(chan.ctl(Opcode::Prompt, "Username:"), None);
        prop_assert!(chan.take_interrupted());
        prop_assert!(chan.flags().do_timed_login);
    }

    /// Request encoding is always STX + opcode + argument + newline.
    #[test]
    fn requests_are_always_framed(arg in "[a-zA-Z0-9 :._-]{0,60}") {
        let encoded = luxdm::greeter::protocol::encode_request(Opcode::Msg, &arg);
        prop_assert_eq!(encoded[0], 0x02);
        prop_assert_eq!(encoded[1], b'D');
        prop_assert_eq!(*encoded.last().unwrap(), b'\n');
        prop_assert_eq!(&encoded[2..encoded.len() - 1], arg.as_bytes());
    }
}
