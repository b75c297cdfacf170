//! Reconstructs typed command lines from raw terminal keystrokes.
//!
//! Shells run without line editing, so the kernel's canonical-mode line
//! discipline is the only editor between the keyboard and the shell. This
//! buffer mirrors it: erase, word erase, and kill are applied here and
//! forwarded; control bytes the tty would act on in ways not modelled here
//! (literal-next, flow control, EOF mid-line, suspend) are dropped. Only the
//! line terminator is held back until the reconstructed line has been checked.

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;
const TAB: u8 = b'\t';
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const CTRL_U: u8 = 0x15;
const CTRL_W: u8 = 0x17;
const ESC: u8 = 0x1b;

/// Piece of keyboard input after line reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keystrokes {
    /// Bytes to hand to the shell immediately.
    Forward(Vec<u8>),
    /// A finished logical line. `terminator` goes to the shell only if the line is allowed.
    Submit {
        line: String,
        terminator: u8,
        /// Earlier physical lines of this command already reached the shell.
        continued: bool,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Escape {
    #[default]
    None,
    /// Saw ESC, waiting for the introducer.
    Start,
    /// Inside `ESC [ ...` until a final byte.
    Csi,
    /// `ESC O x`: exactly one more byte.
    Ss3,
}

/// Per-terminal line accumulator.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Bytes of `pending` that belong to physical lines already sent to the shell.
    sealed: usize,
    escape: Escape,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical line typed since the last submit, joined across continuations.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Keystrokes> {
        let mut out = Vec::new();
        let mut forward = Vec::new();

        for &byte in data {
            if self.escape != Escape::None {
                self.escape = next_escape_state(self.escape, byte);
                continue;
            }

            match byte {
                b'\r' | b'\n' if self.ends_with_continuation() => {
                    self.pending.pop();
                    self.sealed = self.pending.len();
                    forward.push(byte);
                }
                b'\r' | b'\n' => {
                    if !forward.is_empty() {
                        out.push(Keystrokes::Forward(std::mem::take(&mut forward)));
                    }
                    let line = String::from_utf8_lossy(&self.pending).into_owned();
                    out.push(Keystrokes::Submit {
                        line,
                        terminator: byte,
                        continued: self.sealed > 0,
                    });
                    self.reset();
                }
                DELETE | BACKSPACE => {
                    let erased = self.erase_char();
                    forward.extend(std::iter::repeat_n(DELETE, erased));
                }
                CTRL_W => {
                    self.erase_word();
                    forward.push(byte);
                }
                CTRL_U => {
                    self.pending.truncate(self.sealed);
                    forward.push(byte);
                }
                CTRL_C => {
                    self.reset();
                    forward.push(byte);
                }
                CTRL_D if self.pending.is_empty() => forward.push(byte),
                ESC => self.escape = Escape::Start,
                TAB => {
                    self.pending.push(byte);
                    forward.push(byte);
                }
                byte if byte < 0x20 => {}
                byte => {
                    self.pending.push(byte);
                    forward.push(byte);
                }
            }
        }

        if !forward.is_empty() {
            out.push(Keystrokes::Forward(forward));
        }
        out
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.sealed = 0;
    }

    /// An odd run of trailing backslashes escapes the newline.
    fn ends_with_continuation(&self) -> bool {
        let editable = &self.pending[self.sealed..];
        editable.iter().rev().take_while(|byte| **byte == b'\\').count() % 2 == 1
    }

    /// Removes one UTF-8 character from the editable tail and returns its byte length.
    fn erase_char(&mut self) -> usize {
        let mut erased = 0;
        while self.pending.len() > self.sealed {
            let Some(byte) = self.pending.pop() else {
                break;
            };
            erased += 1;
            if byte & 0b1100_0000 != 0b1000_0000 {
                break;
            }
        }
        erased
    }

    /// Word erase as the Linux tty does it: trailing non-word bytes, then the word.
    fn erase_word(&mut self) {
        let mut seen_word = false;
        while self.pending.len() > self.sealed {
            let Some(&byte) = self.pending.last() else {
                break;
            };
            if byte.is_ascii_alphanumeric() || byte == b'_' {
                seen_word = true;
            } else if seen_word {
                break;
            }
            self.pending.pop();
        }
    }
}

fn next_escape_state(state: Escape, byte: u8) -> Escape {
    match state {
        Escape::Start => match byte {
            b'[' => Escape::Csi,
            b'O' => Escape::Ss3,
            _ => Escape::None,
        },
        Escape::Csi if (0x40..=0x7e).contains(&byte) => Escape::None,
        Escape::Csi => Escape::Csi,
        Escape::Ss3 | Escape::None => Escape::None,
    }
}

#[cfg(test)]
mod tests {
    use super::{Keystrokes, LineBuffer};

    fn submit(line: &str) -> Keystrokes {
        Keystrokes::Submit {
            line: line.to_string(),
            terminator: b'\r',
            continued: false,
        }
    }

    #[test]
    fn line_is_held_until_terminator() {
        let mut buffer = LineBuffer::new();
        assert_eq!(
            buffer.feed(b"ls -l"),
            vec![Keystrokes::Forward(b"ls -l".to_vec())]
        );
        assert_eq!(buffer.pending(), "ls -l");
        assert_eq!(buffer.feed(b"a\r"), vec![
            Keystrokes::Forward(b"a".to_vec()),
            submit("ls -la"),
        ]);
        assert_eq!(buffer.pending(), "");
    }

    #[test]
    fn backspace_and_kill_edit_the_line() {
        let mut buffer = LineBuffer::new();
        buffer.feed(b"sudp\x7fo x");
        assert_eq!(buffer.pending(), "sudo x");

        buffer.feed(b"\x15");
        assert_eq!(buffer.pending(), "");

        buffer.feed("caf\u{e9}\x08e".as_bytes());
        assert_eq!(buffer.pending(), "cafe");

        buffer.feed(b"\x03");
        assert_eq!(buffer.pending(), "");
    }

    #[test]
    fn erasing_a_multibyte_character_forwards_one_delete_per_byte() {
        let mut buffer = LineBuffer::new();
        buffer.feed("cur\u{e9}".as_bytes());
        assert_eq!(
            buffer.feed(b"\x08"),
            vec![Keystrokes::Forward(b"\x7f\x7f".to_vec())]
        );
        assert_eq!(buffer.pending(), "cur");
        assert_eq!(buffer.feed(b"\x7f\x7f\x7f\x7f"), vec![Keystrokes::Forward(
            b"\x7f\x7f\x7f".to_vec()
        )]);
    }

    #[test]
    fn word_erase_follows_the_tty() {
        let mut buffer = LineBuffer::new();
        buffer.feed(b"cat src/main_rs  ");
        buffer.feed(b"\x17");
        assert_eq!(buffer.pending(), "cat src/");
        buffer.feed(b"\x17");
        assert_eq!(buffer.pending(), "cat ");
    }

    #[test]
    fn yank_and_completion_keys_cannot_resurrect_killed_text() {
        let mut buffer = LineBuffer::new();
        let out = buffer.feed(b"echo pwned > f.txt\x15\x19\x12\r");
        assert_eq!(out.last(), Some(&submit("")));
        assert!(
            !out.iter()
                .any(|piece| matches!(piece, Keystrokes::Forward(bytes) if bytes.contains(&0x19))),
            "yank must not reach the shell"
        );

        buffer.feed(b"l\ts");
        assert_eq!(buffer.pending(), "l\ts");
    }

    #[test]
    fn flow_control_and_literal_next_are_dropped() {
        let mut buffer = LineBuffer::new();
        let out = buffer.feed(b"cu\x13rl\x16\x15");
        assert_eq!(out, vec![Keystrokes::Forward(b"curl\x15".to_vec())]);
        assert_eq!(buffer.pending(), "");
    }

    #[test]
    fn eof_is_forwarded_only_on_an_empty_line() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.feed(b"ls\x04"), vec![Keystrokes::Forward(
            b"ls".to_vec()
        )]);
        buffer.feed(b"\x15");
        assert_eq!(buffer.feed(b"\x04"), vec![Keystrokes::Forward(
            b"\x04".to_vec()
        )]);
    }

    #[test]
    fn backslash_newline_joins_physical_lines() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.feed(b"cu\\\r"), vec![Keystrokes::Forward(
            b"cu\\\r".to_vec()
        )]);
        assert_eq!(buffer.pending(), "cu");

        buffer.feed(b"x\x7f\x7f\x7f\x15");
        assert_eq!(buffer.pending(), "cu", "earlier lines are out of reach");

        let out = buffer.feed(b"rl --version\r");
        assert_eq!(out.last(), Some(&Keystrokes::Submit {
            line: "curl --version".to_string(),
            terminator: b'\r',
            continued: true,
        }));

        assert_eq!(buffer.feed(b"echo a\\\\\r").last(), Some(&submit("echo a\\\\")));
    }

    #[test]
    fn interrupt_abandons_a_continued_command() {
        let mut buffer = LineBuffer::new();
        buffer.feed(b"su\\\r");
        buffer.feed(b"\x03");
        assert_eq!(buffer.feed(b"do\r").last(), Some(&submit("do")));
    }

    #[test]
    fn escape_sequences_are_dropped() {
        let mut buffer = LineBuffer::new();
        let out = buffer.feed(b"ls\x1b[A\x1bOB\x1b[1;5C -a");
        assert_eq!(buffer.pending(), "ls -a");
        assert_eq!(out, vec![Keystrokes::Forward(b"ls -a".to_vec())]);

        assert!(buffer.feed(b"\x1b[0>x").is_empty());
        assert_eq!(buffer.pending(), "ls -a");
    }

    #[test]
    fn escape_state_survives_split_reads() {
        let mut buffer = LineBuffer::new();
        buffer.feed(b"pw\x1b");
        buffer.feed(b"[");
        buffer.feed(b"Dd");
        assert_eq!(buffer.pending(), "pwd");
    }

    #[test]
    fn pasted_block_yields_one_submit_per_line() {
        let mut buffer = LineBuffer::new();
        let out = buffer.feed(b"echo one\recho two\r");
        assert_eq!(out, vec![
            Keystrokes::Forward(b"echo one".to_vec()),
            submit("echo one"),
            Keystrokes::Forward(b"echo two".to_vec()),
            submit("echo two"),
        ]);
    }
}
