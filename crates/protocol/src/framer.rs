//! TELNET stream framer.
//!
//! # Stream Format
//!
//! The remote side sends plain bytes interleaved with TELNET command
//! sequences, all introduced by the IAC byte (255):
//! - `IAC IAC`: a literal 0xFF data byte
//! - `IAC <WILL|WONT|DO|DONT> <option>`: option negotiation
//! - `IAC SB <option> ... IAC SE`: subnegotiation
//! - `IAC <command>`: any other one-byte command (NOP, GA, ...)
//!
//! # Negotiation Policy
//!
//! Every option request is declined: `DO x` is answered with `WONT x` and
//! `WILL x` with `DONT x`. `WONT` and `DONT` already describe the state we
//! keep, so they are never answered, which keeps both sides out of
//! negotiation loops.

use crate::error::{ProtocolError, Result};

/// Interpret As Command.
pub const IAC: u8 = 255;
/// Refuse to let the peer perform an option.
pub const DONT: u8 = 254;
/// Ask the peer to perform an option.
pub const DO: u8 = 253;
/// Refuse to perform an option.
pub const WONT: u8 = 252;
/// Offer to perform an option.
pub const WILL: u8 = 251;
/// Start of subnegotiation.
pub const SB: u8 = 250;
/// Go ahead.
pub const GA: u8 = 249;
/// No operation.
pub const NOP: u8 = 241;
/// End of subnegotiation.
pub const SE: u8 = 240;

/// Option code for ECHO (RFC 857).
pub const OPT_ECHO: u8 = 1;
/// Option code for SUPPRESS-GO-AHEAD (RFC 858).
pub const OPT_SUPPRESS_GO_AHEAD: u8 = 3;
/// Option code for TERMINAL-TYPE (RFC 1091).
pub const OPT_TERMINAL_TYPE: u8 = 24;
/// Option code for NAWS (RFC 1073).
pub const OPT_NAWS: u8 = 31;

/// Largest subnegotiation payload kept; further bytes up to `IAC SE` are dropped.
pub const MAX_SUBNEGOTIATION_SIZE: usize = 1024;

/// Line terminator appended to every command.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0;

/// Negotiation verb carried by an `IAC <verb> <option>` sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Will,
    Wont,
    Do,
    Dont,
}

impl Verb {
    /// Parse a verb from its command byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            WILL => Some(Verb::Will),
            WONT => Some(Verb::Wont),
            DO => Some(Verb::Do),
            DONT => Some(Verb::Dont),
            _ => None,
        }
    }

    /// The command byte for this verb.
    pub fn as_byte(self) -> u8 {
        match self {
            Verb::Will => WILL,
            Verb::Wont => WONT,
            Verb::Do => DO,
            Verb::Dont => DONT,
        }
    }
}

/// A protocol-level event decoded from the raw stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Plain output bytes with TELNET escaping removed.
    Data(Vec<u8>),
    /// An option negotiation request or acknowledgement.
    Negotiation { verb: Verb, option: u8 },
    /// A complete subnegotiation block.
    Subnegotiation { option: u8, payload: Vec<u8> },
    /// Any other `IAC <command>` sequence.
    Command(u8),
}

impl FrameEvent {
    /// Returns `true` for output bytes.
    pub fn is_data(&self) -> bool {
        matches!(self, FrameEvent::Data(_))
    }
}

/// Decoder position within the byte stream.
///
/// Kept across calls to [`Framer::decode`] so that a sequence split over
/// two reads decodes the same as an unsplit one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum DecodeState {
    #[default]
    Data,
    /// Last data byte was CR; a following NUL is dropped.
    Cr,
    Iac,
    Verb(Verb),
    SbOption,
    Sb { option: u8, payload: Vec<u8> },
    SbIac { option: u8, payload: Vec<u8> },
}

/// Incremental decoder turning raw bytes into [`FrameEvent`]s.
///
/// The framer owns no I/O. Callers feed it whatever a read produced and
/// act on the returned events.
#[derive(Debug, Clone, Default)]
pub struct Framer {
    state: DecodeState,
}

impl Framer {
    /// Create a framer positioned at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when no partial command sequence is pending.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Data | DecodeState::Cr)
    }

    /// Decode a chunk of input into events.
    ///
    /// Adjacent data bytes are merged into a single `Data` event.
    pub fn decode(&mut self, input: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        let mut data = Vec::with_capacity(input.len());

        for &byte in input {
            self.step(byte, &mut data, &mut events);
        }

        flush_data(&mut data, &mut events);
        events
    }

    fn step(&mut self, byte: u8, data: &mut Vec<u8>, events: &mut Vec<FrameEvent>) {
        match std::mem::take(&mut self.state) {
            DecodeState::Data => self.data_byte(byte, data),
            DecodeState::Cr => {
                if byte != NUL {
                    self.data_byte(byte, data);
                }
            }
            DecodeState::Iac => self.after_iac(byte, data, events),
            DecodeState::Verb(verb) => {
                flush_data(data, events);
                events.push(FrameEvent::Negotiation { verb, option: byte });
            }
            DecodeState::SbOption => {
                self.state = DecodeState::Sb {
                    option: byte,
                    payload: Vec::new(),
                };
            }
            DecodeState::Sb {
                option,
                mut payload,
            } => {
                if byte == IAC {
                    self.state = DecodeState::SbIac { option, payload };
                } else {
                    push_bounded(&mut payload, byte);
                    self.state = DecodeState::Sb { option, payload };
                }
            }
            DecodeState::SbIac {
                option,
                mut payload,
            } => match byte {
                IAC => {
                    push_bounded(&mut payload, IAC);
                    self.state = DecodeState::Sb { option, payload };
                }
                SE => {
                    flush_data(data, events);
                    events.push(FrameEvent::Subnegotiation { option, payload });
                }
                other => {
                    // Unterminated block: close it and treat the byte as
                    // the command that interrupted it.
                    flush_data(data, events);
                    events.push(FrameEvent::Subnegotiation { option, payload });
                    self.after_iac(other, data, events);
                }
            },
        }
    }

    fn data_byte(&mut self, byte: u8, data: &mut Vec<u8>) {
        match byte {
            IAC => self.state = DecodeState::Iac,
            CR => {
                data.push(CR);
                self.state = DecodeState::Cr;
            }
            other => data.push(other),
        }
    }

    fn after_iac(&mut self, byte: u8, data: &mut Vec<u8>, events: &mut Vec<FrameEvent>) {
        if let Some(verb) = Verb::from_byte(byte) {
            self.state = DecodeState::Verb(verb);
            return;
        }
        match byte {
            IAC => data.push(IAC),
            SB => self.state = DecodeState::SbOption,
            SE => {}
            other => {
                flush_data(data, events);
                events.push(FrameEvent::Command(other));
            }
        }
    }
}

fn push_bounded(payload: &mut Vec<u8>, byte: u8) {
    if payload.len() < MAX_SUBNEGOTIATION_SIZE {
        payload.push(byte);
    }
}

fn flush_data(data: &mut Vec<u8>, events: &mut Vec<FrameEvent>) {
    if !data.is_empty() {
        events.push(FrameEvent::Data(std::mem::take(data)));
    }
}

/// The reply owed for a negotiation request, if any.
///
/// `DO` is declined with `WONT` and `WILL` with `DONT`. Acknowledgements
/// (`WONT`, `DONT`) get no reply.
pub fn refusal(verb: Verb, option: u8) -> Option<[u8; 3]> {
    match verb {
        Verb::Do => Some([IAC, WONT, option]),
        Verb::Will => Some([IAC, DONT, option]),
        Verb::Wont | Verb::Dont => None,
    }
}

/// Collect the refusals owed for a batch of events into one write.
pub fn refusals(events: &[FrameEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            FrameEvent::Negotiation { verb, option } => refusal(*verb, *option),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Encode a command line for the wire.
///
/// The line must not contain CR or LF. Literal 0xFF bytes are doubled
/// and CR LF is appended.
pub fn encode_command(line: &[u8]) -> Result<Vec<u8>> {
    if line.iter().any(|&b| b == CR || b == LF) {
        return Err(ProtocolError::InvalidCommand(format!(
            "command {:?} contains a line terminator",
            String::from_utf8_lossy(line)
        )));
    }

    let mut output = Vec::with_capacity(line.len() + LINE_TERMINATOR.len());
    for &byte in line {
        if byte == IAC {
            output.push(IAC);
        }
        output.push(byte);
    }
    output.extend_from_slice(LINE_TERMINATOR);
    Ok(output)
}
