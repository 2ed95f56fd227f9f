//! Kernel console and log backend
//!
//! Keeps the most recent console output in a fixed-size buffer and forwards
//! every write to an optional sink (the UART writer on hardware, stderr in a
//! hosted run). Also serves as the `log` backend for the VM core.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Bytes of console history kept
pub const CONSOLE_BUFFER: usize = 1024;

/// Output sink for console text
pub type ConsoleSink = fn(&str);

/// Console writer interface
pub struct Console {
    buffer: heapless::String<CONSOLE_BUFFER>,
    sink: Option<ConsoleSink>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            buffer: heapless::String::new(),
            sink: None,
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        if let Some(sink) = self.sink {
            sink(s);
        }
        for c in s.chars() {
            if self.buffer.push(c).is_err() {
                // History full: start over
                self.buffer.clear();
                let _ = self.buffer.push(c);
            }
        }
    }

    /// Clear the history
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn set_sink(&mut self, sink: Option<ConsoleSink>) {
        self.sink = sink;
    }

    /// Recent output
    pub fn history(&self) -> &str {
        &self.buffer
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Copy of the recent console output
pub fn history() -> heapless::String<CONSOLE_BUFFER> {
    let console = CONSOLE.lock();
    let mut copy = heapless::String::new();
    let _ = copy.push_str(console.history());
    copy
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// ============================================================================
// Log Backend
// ============================================================================

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{:<5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Initialize the console and route `log` output through it at `level`
pub fn init(level: LevelFilter, sink: Option<ConsoleSink>) {
    {
        let mut console = CONSOLE.lock();
        console.clear();
        console.set_sink(sink);
    }
    // A logger may already be installed (e.g. a second init); keep it
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_write() {
        let mut console = Console::new();
        console.write_str("Hello, pager!");
        assert!(console.history().contains("Hello, pager!"));
    }

    #[test]
    fn test_console_formatting() {
        let mut console = Console::new();
        write!(&mut console, "Test {}", 42).unwrap();
        assert!(console.history().contains("Test 42"));
    }

    #[test]
    fn test_console_wraps_when_full() {
        let mut console = Console::new();
        for _ in 0..CONSOLE_BUFFER {
            console.write_str("x");
        }
        console.write_str("y");
        assert_eq!(console.history(), "y");
    }
}
