#![no_std]

//! Line protocol between the host computer and the watchdog MCU.
//!
//! Frames are ASCII lines of `;`-separated fields terminated by `\n` (or
//! NUL): `<fno>;<cmd>;<payload...>;<crc>;\n`. The CRC-16/X.25 covers every
//! byte up to and including the `;` in front of the CRC token. Frame numbers
//! are 16 bit, must match the receiver's expectation exactly and advance only
//! on accepted requests.
//!
//! The crate is transport-agnostic: [`LineBuffer`] turns a byte stream into
//! frames, [`Engine`] turns frames into response lines, and the device side
//! plugs in through the [`Station`] trait.

use heapless::Vec;

/// Maximum request length in bytes, terminator not included.
pub const MAX_REQUEST_LEN: usize = 20;
/// Maximum response length in bytes, including the trailing `\n`.
pub const MAX_RESPONSE_LEN: usize = 60;

/// Number of host-settable outputs. The watchdog relay sits behind this
/// range on purpose: no `S` frame can ever address it.
pub const SUPPORTED_OUTPUTS: u16 = 7;
/// Number of host-readable inputs.
pub const SUPPORTED_INPUTS: u16 = 4;

pub const CRC16_X25_INIT: u16 = 0xFFFF;

/// One step of the reflected CRC-16/X.25 (poly 0x1021 -> 0x8408), without
/// the final XOR. The receiver folds bytes with this while scanning and
/// applies the XOR once at the end.
pub fn crc16_x25_step(byte: u8, running: u16) -> u16 {
    let mut crc = running ^ byte as u16;
    for _ in 0..8 {
        if (crc & 0x0001) != 0 {
            crc = (crc >> 1) ^ 0x8408;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// CRC-16/X.25 over a whole buffer, final XOR applied.
pub fn crc16_x25(bytes: &[u8]) -> u16 {
    let mut crc = CRC16_X25_INIT;
    for &b in bytes {
        crc = crc16_x25_step(b, crc);
    }
    crc ^ 0xFFFF
}

/// NACK codes as they appear on the wire.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum NackCode {
    UnknownCommand = 1,
    UnknownState = 2,
    InvalidFrameNumber = 3,
    UnexpectedFrameNumber = 4,
    InvalidValue = 5,
    InvalidIndex = 6,
    InvalidCrc = 7,
    Overflow = 8,
    /// `W` received before any successful `V`.
    InvalidStartup = 9,
}

/// A completed receive event.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineEvent {
    /// A terminator arrived; the bytes in front of it (terminator stripped).
    Frame(Vec<u8, MAX_REQUEST_LEN>),
    /// More than [`MAX_REQUEST_LEN`] bytes arrived without a terminator.
    /// Everything up to the next terminator has been discarded.
    Overflow,
}

/// Byte-at-a-time frame assembler with overflow resynchronisation.
///
/// A full buffer is the overflow state: further payload bytes are dropped
/// and the next terminator yields exactly one [`LineEvent::Overflow`].
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8, MAX_REQUEST_LEN>,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, byte: u8) -> Option<LineEvent> {
        let terminator = byte == b'\n' || byte == 0;
        if self.buf.is_full() {
            if terminator {
                self.buf.clear();
                return Some(LineEvent::Overflow);
            }
            return None;
        }
        if terminator {
            let frame = self.buf.clone();
            self.buf.clear();
            return Some(LineEvent::Frame(frame));
        }
        // cannot fail, fullness checked above
        let _ = self.buf.push(byte);
        None
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// A decoded command, payload fields still unvalidated.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    GetVersion,
    SetWatchdog { run: u16 },
    SetOutput { index: u16, value: u16 },
    ReadInput { index: u16 },
    GetDiagnoses,
    ExecuteTest,
}

impl Command {
    fn letter(&self) -> u8 {
        match self {
            Command::GetVersion => b'V',
            Command::SetWatchdog { .. } => b'W',
            Command::SetOutput { .. } => b'S',
            Command::ReadInput { .. } => b'R',
            Command::GetDiagnoses => b'D',
            Command::ExecuteTest => b'T',
        }
    }
}

/// Result of scanning one frame. `error` holds the first problem detected
/// while tokenizing; later checks (CRC, frame number, ranges) never override
/// an earlier one.
#[derive(Clone, Copy, Debug)]
pub struct ScannedRequest {
    pub frame_number: u16,
    pub command: Option<Command>,
    /// CRC over the bytes up to and including the `;` in front of the CRC
    /// token, final XOR applied.
    pub computed_crc: u16,
    pub received_crc: u16,
    pub error: Option<NackCode>,
}

// Tokenizer positions. Which field follows a `;` depends on the command,
// mirroring the positional grammar of the wire format.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    FrameNumber,
    CommandLetter,
    WatchdogValue,
    OutputIndex,
    OutputValue,
    InputIndex,
    Crc,
    End,
    Trailing,
}

// Leftmost-first unsigned decimal accumulation with 16-bit overflow
// detection. Returns false on a non-digit or on wraparound.
fn push_decimal(value: &mut u16, byte: u8) -> bool {
    if !byte.is_ascii_digit() {
        return false;
    }
    let digit = (byte - b'0') as u16;
    match value.checked_mul(10).and_then(|v| v.checked_add(digit)) {
        Some(v) => {
            *value = v;
            true
        }
        None => false,
    }
}

fn first_error(slot: &mut Option<NackCode>, code: NackCode) {
    if slot.is_none() {
        *slot = Some(code);
    }
}

/// Single-pass tokenizer over one frame (terminator already stripped).
pub fn scan_request(raw: &[u8]) -> ScannedRequest {
    let mut crc = CRC16_X25_INIT;
    let mut crc_frozen = false;

    let mut field = Field::FrameNumber;
    let mut error: Option<NackCode> = None;
    let mut frame_number: u16 = 0;
    let mut command: Option<Command> = None;
    let mut index: u16 = 0;
    let mut value: u16 = 0;
    let mut received_crc: u16 = 0;

    for &byte in raw {
        if error.is_some() {
            break;
        }
        if !crc_frozen {
            crc = crc16_x25_step(byte, crc);
        }

        if byte == b';' {
            field = match (field, command) {
                (Field::FrameNumber, _) => Field::CommandLetter,
                (Field::CommandLetter, Some(Command::SetWatchdog { .. })) => Field::WatchdogValue,
                (Field::CommandLetter, Some(Command::SetOutput { .. })) => Field::OutputIndex,
                (Field::CommandLetter, Some(Command::ReadInput { .. })) => Field::InputIndex,
                // V, D and T carry no payload; the CRC token is next and the
                // `;` just folded in is the last covered byte.
                (Field::CommandLetter, _) => Field::Crc,
                (Field::WatchdogValue, _) | (Field::OutputValue, _) | (Field::InputIndex, _) => {
                    Field::Crc
                }
                (Field::OutputIndex, _) => Field::OutputValue,
                (Field::Crc, _) => Field::End,
                (Field::End, _) | (Field::Trailing, _) => Field::Trailing,
            };
            if field == Field::Crc {
                crc_frozen = true;
            }
            continue;
        }

        match field {
            Field::FrameNumber => {
                if !push_decimal(&mut frame_number, byte) {
                    first_error(&mut error, NackCode::InvalidFrameNumber);
                }
            }
            Field::CommandLetter => {
                if command.is_some() {
                    // second character in the command token, e.g. `1;WW;...`
                    first_error(&mut error, NackCode::UnknownCommand);
                    continue;
                }
                command = match byte {
                    b'V' => Some(Command::GetVersion),
                    b'W' => Some(Command::SetWatchdog { run: 0 }),
                    b'S' => Some(Command::SetOutput { index: 0, value: 0 }),
                    b'R' => Some(Command::ReadInput { index: 0 }),
                    b'D' => Some(Command::GetDiagnoses),
                    b'T' => Some(Command::ExecuteTest),
                    _ => {
                        first_error(&mut error, NackCode::UnknownCommand);
                        None
                    }
                };
            }
            Field::WatchdogValue | Field::OutputValue => {
                if !push_decimal(&mut value, byte) {
                    first_error(&mut error, NackCode::InvalidValue);
                }
            }
            Field::OutputIndex | Field::InputIndex => {
                if !push_decimal(&mut index, byte) {
                    first_error(&mut error, NackCode::InvalidIndex);
                }
            }
            Field::Crc => {
                if !push_decimal(&mut received_crc, byte) {
                    first_error(&mut error, NackCode::InvalidCrc);
                }
            }
            Field::End => {}
            Field::Trailing => {
                // more fields than any command defines
                first_error(&mut error, NackCode::UnknownState);
            }
        }
    }

    let command = command.map(|cmd| match cmd {
        Command::SetWatchdog { .. } => Command::SetWatchdog { run: value },
        Command::SetOutput { .. } => Command::SetOutput { index, value },
        Command::ReadInput { .. } => Command::ReadInput { index },
        other => other,
    });

    ScannedRequest {
        frame_number,
        command,
        computed_crc: crc ^ 0xFFFF,
        received_crc,
        error,
    }
}

/// Reply to a `W` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogReply {
    pub old_running: bool,
    pub new_running: bool,
    pub lock_required: bool,
}

/// Reply to an `S` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputReply {
    pub old_state: bool,
    pub new_state: bool,
}

/// Reply to a `D` frame; every field is consumed-and-cleared device side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DiagReport {
    pub diagnoses: u16,
    pub first_error: u16,
    pub executed_tests: u16,
}

/// Device-side effects a validated request may have. Implemented by the
/// firmware over its shared stores and by test stubs on the host.
pub trait Station {
    fn version(&mut self) -> &'static str;
    fn set_watchdog(&mut self, run: bool) -> WatchdogReply;
    fn set_output(&mut self, index: u8, on: bool) -> OutputReply;
    fn read_input(&mut self, index: u8) -> bool;
    fn diagnoses(&mut self) -> DiagReport;
    fn request_test(&mut self) -> bool;
}

pub type ResponseLine = Vec<u8, MAX_RESPONSE_LEN>;

// Response tokens. The buffer is sized for the worst case (bracketed echo of
// a maximum-length request); a push past the end is dropped rather than
// propagated, the same contract as the fixed response buffer on the wire.
fn put(line: &mut ResponseLine, byte: u8) {
    let _ = line.push(byte);
}

fn put_int(line: &mut ResponseLine, value: u16) {
    let mut digits = [0u8; 5];
    let mut n = 0;
    let mut v = value;
    loop {
        digits[n] = b'0' + (v % 10) as u8;
        v /= 10;
        n += 1;
        if v == 0 {
            break;
        }
    }
    while n > 0 {
        n -= 1;
        put(line, digits[n]);
    }
    put(line, b';');
}

fn put_char(line: &mut ResponseLine, c: u8) {
    put(line, c);
    put(line, b';');
}

fn put_str(line: &mut ResponseLine, s: &str) {
    for &b in s.as_bytes() {
        put(line, b);
    }
    put(line, b';');
}

fn put_flag(line: &mut ResponseLine, flag: bool) {
    put_int(line, flag as u16);
}

// Bracketed echo of the offending request. Only the printable prefix is
// quoted; the first control byte ends the echo.
fn put_echo(line: &mut ResponseLine, raw: &[u8]) {
    put(line, b'[');
    for &b in raw {
        if b < b' ' {
            break;
        }
        put(line, b);
    }
    put(line, b']');
    put(line, b';');
}

// Every response line ends with the CRC over everything in front of it,
// then the line terminator.
fn seal(mut line: ResponseLine) -> ResponseLine {
    let crc = crc16_x25(&line);
    put_int(&mut line, crc);
    put(&mut line, b'\n');
    line
}

/// Protocol sequencing state: the expected frame number and the `V`-before-`W`
/// startup gate. One engine per serial link.
pub struct Engine {
    next_expected_frame_number: u16,
    version_seen: bool,
}

impl Engine {
    pub const fn new() -> Self {
        Self {
            next_expected_frame_number: 0,
            version_seen: false,
        }
    }

    pub fn next_expected_frame_number(&self) -> u16 {
        self.next_expected_frame_number
    }

    // CRC first, then sequencing, then command-specific ranges; the scan
    // error (if any) outranks them all.
    fn validate(&self, scanned: &ScannedRequest) -> Result<Command, NackCode> {
        if let Some(code) = scanned.error {
            return Err(code);
        }
        #[cfg(not(feature = "ignore-crc"))]
        if scanned.computed_crc != scanned.received_crc {
            return Err(NackCode::InvalidCrc);
        }
        #[cfg(not(feature = "ignore-frame-number"))]
        if scanned.frame_number != self.next_expected_frame_number {
            return Err(NackCode::UnexpectedFrameNumber);
        }
        let command = scanned.command.ok_or(NackCode::UnknownCommand)?;
        match command {
            Command::SetWatchdog { run } => {
                if !self.version_seen {
                    Err(NackCode::InvalidStartup)
                } else if run > 1 {
                    Err(NackCode::InvalidValue)
                } else {
                    Ok(command)
                }
            }
            Command::SetOutput { index, value } => {
                if index >= SUPPORTED_OUTPUTS {
                    Err(NackCode::InvalidIndex)
                } else if value > 1 {
                    Err(NackCode::InvalidValue)
                } else {
                    Ok(command)
                }
            }
            Command::ReadInput { index } => {
                if index >= SUPPORTED_INPUTS {
                    Err(NackCode::InvalidIndex)
                } else {
                    Ok(command)
                }
            }
            _ => Ok(command),
        }
    }

    /// Handles one complete frame and renders the response line.
    ///
    /// The frame counter advances on ACK only; every NACK leaves it
    /// untouched and quotes the offending request.
    pub fn handle<S: Station>(&mut self, raw: &[u8], station: &mut S) -> ResponseLine {
        let scanned = scan_request(raw);

        let mut line = ResponseLine::new();
        put_int(&mut line, self.next_expected_frame_number);

        match self.validate(&scanned) {
            Err(code) => {
                put_char(&mut line, b'E');
                put_int(&mut line, code as u16);
                put_echo(&mut line, raw);
            }
            Ok(command) => {
                put_char(&mut line, command.letter());
                match command {
                    Command::GetVersion => {
                        put_str(&mut line, station.version());
                        self.version_seen = true;
                    }
                    Command::SetWatchdog { run } => {
                        let reply = station.set_watchdog(run != 0);
                        put_flag(&mut line, reply.old_running);
                        put_flag(&mut line, reply.new_running);
                        put_flag(&mut line, reply.lock_required);
                    }
                    Command::SetOutput { index, value } => {
                        let reply = station.set_output(index as u8, value != 0);
                        put_int(&mut line, index);
                        put_flag(&mut line, reply.old_state);
                        put_flag(&mut line, reply.new_state);
                    }
                    Command::ReadInput { index } => {
                        put_int(&mut line, index);
                        put_flag(&mut line, station.read_input(index as u8));
                    }
                    Command::GetDiagnoses => {
                        let report = station.diagnoses();
                        put_int(&mut line, report.diagnoses);
                        put_int(&mut line, report.first_error);
                        put_int(&mut line, report.executed_tests);
                    }
                    Command::ExecuteTest => {
                        put_flag(&mut line, station.request_test());
                    }
                }
                self.next_expected_frame_number = self.next_expected_frame_number.wrapping_add(1);
            }
        }

        seal(line)
    }

    /// Canned NACK for a receive-buffer overflow. The discarded bytes cannot
    /// be quoted, so the echo token is omitted.
    pub fn overflow_response(&self) -> ResponseLine {
        let mut line = ResponseLine::new();
        put_int(&mut line, self.next_expected_frame_number);
        put_char(&mut line, b'E');
        put_int(&mut line, NackCode::Overflow as u16);
        seal(line)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use std::format;
    use std::vec::Vec as StdVec;

    // Hand-verified against the serial examples of the legacy handler.
    #[test]
    fn crc16_x25_known_vectors() {
        assert_eq!(crc16_x25(b"0;V;"), 5971);
        assert_eq!(crc16_x25(b"1;W;1;"), 43612);
        assert_eq!(crc16_x25(b"2;W;1;"), 42529);
        assert_eq!(crc16_x25(b"3;S;0;1;"), 22546);
        assert_eq!(crc16_x25(b"6;R;0;"), 49410);
        assert_eq!(crc16_x25(b"0;V;1.0_4xUNPULSED;"), 63918);
    }

    #[test]
    fn crc16_x25_step_matches_whole() {
        let bytes = b"7;S;3;1;";
        let mut running = CRC16_X25_INIT;
        for &b in bytes.iter() {
            running = crc16_x25_step(b, running);
        }
        assert_eq!(running ^ 0xFFFF, crc16_x25(bytes));
    }

    fn feed(line: &mut LineBuffer, bytes: &[u8]) -> StdVec<LineEvent> {
        let mut events = StdVec::new();
        for &b in bytes {
            if let Some(ev) = line.push(b) {
                events.push(ev);
            }
        }
        events
    }

    #[test]
    fn line_buffer_frames_on_newline_and_nul() {
        let mut line = LineBuffer::new();
        let events = feed(&mut line, b"0;V;5971;\n1;D;123;\0");
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            LineEvent::Frame(Vec::from_slice(b"0;V;5971;").unwrap())
        );
        assert_eq!(
            events[1],
            LineEvent::Frame(Vec::from_slice(b"1;D;123;").unwrap())
        );
    }

    #[test]
    fn line_buffer_overflow_resyncs_once() {
        let mut line = LineBuffer::new();
        // more than MAX_REQUEST_LEN bytes without a terminator
        let mut events = feed(&mut line, &[b'x'; 30]);
        events.extend(feed(&mut line, b"still-lost\n"));
        assert_eq!(events, [LineEvent::Overflow]);

        // fully resynchronised afterwards
        let events = feed(&mut line, b"0;V;5971;\n");
        assert_eq!(
            events,
            [LineEvent::Frame(Vec::from_slice(b"0;V;5971;").unwrap())]
        );
    }

    #[test]
    fn scan_decodes_every_command() {
        let scanned = scan_request(b"0;V;5971;");
        assert_eq!(scanned.error, None);
        assert_eq!(scanned.command, Some(Command::GetVersion));
        assert_eq!(scanned.computed_crc, 5971);
        assert_eq!(scanned.received_crc, 5971);

        let scanned = scan_request(b"1;W;1;43612;");
        assert_eq!(scanned.command, Some(Command::SetWatchdog { run: 1 }));
        assert_eq!(scanned.frame_number, 1);
        assert_eq!(scanned.computed_crc, 43612);

        let scanned = scan_request(b"3;S;0;1;22546;");
        assert_eq!(
            scanned.command,
            Some(Command::SetOutput { index: 0, value: 1 })
        );
        assert_eq!(scanned.computed_crc, 22546);

        let scanned = scan_request(b"6;R;0;49410;");
        assert_eq!(scanned.command, Some(Command::ReadInput { index: 0 }));
        assert_eq!(scanned.computed_crc, 49410);

        let scanned = scan_request(b"4;D;0;");
        assert_eq!(scanned.error, None);
        assert_eq!(scanned.command, Some(Command::GetDiagnoses));
        assert_eq!(scanned.computed_crc, crc16_x25(b"4;D;"));

        let scanned = scan_request(b"9;T;0;");
        assert_eq!(scanned.command, Some(Command::ExecuteTest));
        assert_eq!(scanned.computed_crc, crc16_x25(b"9;T;"));
    }

    #[test]
    fn scan_rejects_bad_tokens() {
        // non-digit in the frame number
        let scanned = scan_request(b"1x;W;1;0;");
        assert_eq!(scanned.error, Some(NackCode::InvalidFrameNumber));

        // unknown command letter
        let scanned = scan_request(b"0;Q;0;");
        assert_eq!(scanned.error, Some(NackCode::UnknownCommand));

        // two characters in the command token
        let scanned = scan_request(b"0;WW;1;0;");
        assert_eq!(scanned.error, Some(NackCode::UnknownCommand));

        // 16-bit overflow in a value field
        let scanned = scan_request(b"0;W;65536;0;");
        assert_eq!(scanned.error, Some(NackCode::InvalidValue));

        // 16-bit overflow in an index field
        let scanned = scan_request(b"0;S;99999;1;0;");
        assert_eq!(scanned.error, Some(NackCode::InvalidIndex));

        // surplus field after the CRC token
        let scanned = scan_request(b"0;R;0;1;2;x;");
        assert_eq!(scanned.error, Some(NackCode::UnknownState));
    }

    #[test]
    fn decimal_roundtrip_covers_u16() {
        for value in 0..=u16::MAX {
            let mut line = ResponseLine::new();
            put_int(&mut line, value);
            let mut parsed: u16 = 0;
            for &b in line.iter().take(line.len() - 1) {
                assert!(push_decimal(&mut parsed, b));
            }
            assert_eq!(parsed, value);
        }
    }

    // ---- engine ------------------------------------------------------------

    struct StubStation {
        outputs: [bool; 7],
        inputs: [bool; 4],
        running: bool,
        lock: bool,
        diag: DiagReport,
        test_accepted: bool,
    }

    impl StubStation {
        fn new() -> Self {
            Self {
                outputs: [false; 7],
                inputs: [false; 4],
                running: false,
                lock: false,
                diag: DiagReport::default(),
                test_accepted: true,
            }
        }
    }

    impl Station for StubStation {
        fn version(&mut self) -> &'static str {
            "1.0_4xUNPULSED"
        }

        fn set_watchdog(&mut self, run: bool) -> WatchdogReply {
            let old_running = self.running;
            self.running = run;
            if run {
                self.lock = true;
            }
            WatchdogReply {
                old_running,
                new_running: self.running,
                lock_required: self.lock,
            }
        }

        fn set_output(&mut self, index: u8, on: bool) -> OutputReply {
            let old_state = self.outputs[index as usize];
            self.outputs[index as usize] = on;
            OutputReply {
                old_state,
                new_state: on,
            }
        }

        fn read_input(&mut self, index: u8) -> bool {
            self.inputs[index as usize]
        }

        fn diagnoses(&mut self) -> DiagReport {
            core::mem::take(&mut self.diag)
        }

        fn request_test(&mut self) -> bool {
            self.test_accepted
        }
    }

    // Builds `<body><crc>;` the way the host does.
    fn with_crc(body: &str) -> StdVec<u8> {
        let mut raw: StdVec<u8> = body.as_bytes().into();
        raw.extend_from_slice(format!("{}", crc16_x25(body.as_bytes())).as_bytes());
        raw.push(b';');
        raw
    }

    fn as_str(line: &ResponseLine) -> &str {
        core::str::from_utf8(line).unwrap()
    }

    fn expect_sealed(line: &ResponseLine, body: &str) {
        let expected = format!("{body}{};\n", crc16_x25(body.as_bytes()));
        assert_eq!(as_str(line), expected);
    }

    #[test]
    fn version_fetch_opens_the_startup_gate() {
        let mut engine = Engine::new();
        let mut station = StubStation::new();

        let response = engine.handle(b"0;V;5971;", &mut station);
        expect_sealed(&response, "0;V;1.0_4xUNPULSED;");
        assert_eq!(engine.next_expected_frame_number(), 1);

        let response = engine.handle(&with_crc("1;W;1;"), &mut station);
        expect_sealed(&response, "1;W;0;1;1;");
        assert_eq!(engine.next_expected_frame_number(), 2);
    }

    #[test]
    fn watchdog_before_version_is_rejected() {
        let mut engine = Engine::new();
        let mut station = StubStation::new();

        let raw = with_crc("0;W;1;");
        let response = engine.handle(&raw, &mut station);
        let body = format!("0;E;9;[{}];", core::str::from_utf8(&raw).unwrap());
        expect_sealed(&response, &body);
        // NACK: counter untouched, no effect on the station
        assert_eq!(engine.next_expected_frame_number(), 0);
        assert!(!station.running);
    }

    #[test]
    fn set_output_roundtrip_and_repeat() {
        let mut engine = Engine::new();
        let mut station = StubStation::new();
        engine.handle(b"0;V;5971;", &mut station);

        let response = engine.handle(&with_crc("1;S;0;1;"), &mut station);
        expect_sealed(&response, "1;S;0;0;1;");
        assert!(station.outputs[0]);

        // same command again: old == new == 1, still an ACK
        let response = engine.handle(&with_crc("2;S;0;1;"), &mut station);
        expect_sealed(&response, "2;S;0;1;1;");
        assert!(station.outputs[0]);
        assert_eq!(engine.next_expected_frame_number(), 3);
    }

    #[test]
    fn out_of_range_index_and_value_nack() {
        let mut engine = Engine::new();
        let mut station = StubStation::new();
        engine.handle(b"0;V;5971;", &mut station);

        // the slot past the logical outputs is the watchdog relay
        let raw = with_crc("1;S;7;1;");
        let response = engine.handle(&raw, &mut station);
        assert!(as_str(&response).starts_with("1;E;6;["));
        assert_eq!(engine.next_expected_frame_number(), 1);

        let raw = with_crc("1;S;0;2;");
        let response = engine.handle(&raw, &mut station);
        assert!(as_str(&response).starts_with("1;E;5;["));

        let raw = with_crc("1;R;4;");
        let response = engine.handle(&raw, &mut station);
        assert!(as_str(&response).starts_with("1;E;6;["));
        assert_eq!(engine.next_expected_frame_number(), 1);
    }

    #[test]
    fn crc_mismatch_nacks_and_quotes_request() {
        let mut engine = Engine::new();
        let mut station = StubStation::new();
        engine.handle(b"0;V;5971;", &mut station);

        let response = engine.handle(b"2;W;0;1;333;", &mut station);
        expect_sealed(&response, "1;E;7;[2;W;0;1;333;];");
        assert_eq!(engine.next_expected_frame_number(), 1);
    }

    #[test]
    fn wrong_frame_number_reports_the_expected_one() {
        let mut engine = Engine::new();
        let mut station = StubStation::new();
        engine.handle(b"0;V;5971;", &mut station);
        engine.handle(&with_crc("1;W;1;"), &mut station);
        engine.handle(&with_crc("2;S;0;1;"), &mut station);
        engine.handle(&with_crc("3;R;0;"), &mut station);
        assert_eq!(engine.next_expected_frame_number(), 4);

        // expected 4, received 5
        let raw = with_crc("5;R;0;");
        let response = engine.handle(&raw, &mut station);
        let body = format!("4;E;4;[{}];", core::str::from_utf8(&raw).unwrap());
        expect_sealed(&response, &body);
        assert_eq!(engine.next_expected_frame_number(), 4);
    }

    #[test]
    fn diagnoses_and_test_bodies() {
        let mut engine = Engine::new();
        let mut station = StubStation::new();
        station.diag = DiagReport {
            diagnoses: 1,
            first_error: 0x1001,
            executed_tests: 1,
        };

        let response = engine.handle(&with_crc("0;D;"), &mut station);
        expect_sealed(&response, "0;D;1;4097;1;");
        // consumed: the next read reports everything cleared
        let response = engine.handle(&with_crc("1;D;"), &mut station);
        expect_sealed(&response, "1;D;0;0;0;");

        let response = engine.handle(&with_crc("2;T;"), &mut station);
        expect_sealed(&response, "2;T;1;");

        station.test_accepted = false;
        let response = engine.handle(&with_crc("3;T;"), &mut station);
        expect_sealed(&response, "3;T;0;");
    }

    #[test]
    fn frame_counter_wraps_at_u16() {
        let mut engine = Engine::new();
        let mut station = StubStation::new();
        engine.next_expected_frame_number = u16::MAX;

        let response = engine.handle(&with_crc("65535;D;"), &mut station);
        assert!(as_str(&response).starts_with("65535;D;"));
        assert_eq!(engine.next_expected_frame_number(), 0);
    }

    #[test]
    fn overflow_response_is_canned() {
        let engine = Engine::new();
        let response = engine.overflow_response();
        expect_sealed(&response, "0;E;8;");
    }

    #[test]
    fn responses_fit_the_wire_budget() {
        let mut engine = Engine::new();
        let mut station = StubStation::new();

        // worst case: NACK quoting a maximum-length request
        let raw = [b'9'; MAX_REQUEST_LEN];
        let response = engine.handle(&raw, &mut station);
        assert!(response.len() <= MAX_RESPONSE_LEN);
        assert!(response.ends_with(b"\n"));
    }
}
