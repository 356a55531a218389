//! Host abstraction.
//!
//! The machine never talks to hardware or an operating system directly;
//! everything leaving the VM goes through this trait. On an MCU the
//! implementation forwards to the board-support layer, on a PC to whatever
//! the embedding application wants. Default implementations make every
//! callback optional.

/// Callbacks the runtime invokes on its host.
pub trait Host {
    /// A program wrote a snapshot buffer back to the device.
    fn write_snapshot(&mut self, _bytes: &[u8]) {}

    /// A program wrote bytes to a serial-like stream port.
    fn write_stream(&mut self, _port: i32, _bytes: &[u8]) {}

    /// A program wrote an event frame to a CAN/modbus-like port.
    fn write_event(&mut self, _port: i32, _event: i32, _bytes: &[u8]) {}

    /// A fatal fault occurred; the machine halts after this call.
    fn report_error(&mut self, _il_offset: i32, _message: &str) {}

    /// `Console.WriteLine` output.
    fn print_line(&mut self, _line: &str) {}

    /// Milliseconds since the cyclic executive started.
    fn cyclic_millis(&mut self) -> i32 {
        0
    }

    /// Microseconds since the cyclic executive started.
    fn cyclic_micros(&mut self) -> i32 {
        0
    }

    /// Seconds since the cyclic executive started.
    fn cyclic_seconds(&mut self) -> i32 {
        0
    }
}

/// A host that discards all output.
#[derive(Debug, Default)]
pub struct NullHost;

impl Host for NullHost {}

/// A recording host for tests: every callback is captured for assertion.
#[derive(Debug, Default)]
pub struct MockHost {
    pub snapshots: Vec<Vec<u8>>,
    pub streams: Vec<(i32, Vec<u8>)>,
    pub events: Vec<(i32, i32, Vec<u8>)>,
    pub errors: Vec<(i32, String)>,
    pub lines: Vec<String>,
    pub millis: i32,
    pub micros: i32,
    pub seconds: i32,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for MockHost {
    fn write_snapshot(&mut self, bytes: &[u8]) {
        self.snapshots.push(bytes.to_vec());
    }

    fn write_stream(&mut self, port: i32, bytes: &[u8]) {
        self.streams.push((port, bytes.to_vec()));
    }

    fn write_event(&mut self, port: i32, event: i32, bytes: &[u8]) {
        self.events.push((port, event, bytes.to_vec()));
    }

    fn report_error(&mut self, il_offset: i32, message: &str) {
        self.errors.push((il_offset, message.to_string()));
    }

    fn print_line(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn cyclic_millis(&mut self) -> i32 {
        self.millis
    }

    fn cyclic_micros(&mut self) -> i32 {
        self.micros
    }

    fn cyclic_seconds(&mut self) -> i32 {
        self.seconds
    }
}
