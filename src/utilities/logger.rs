//! Logger used to route worker `print` output through the engine.
//!
//! Worker output goes through here rather than raw stdout so every line is
//! timestamped and tagged with the clone identity that produced it.

use chrono::Local;

use crate::utilities::printer::{Printer, PrinterColor};

/// Logger with optional verbose output and timestamps.
#[derive(Debug, Clone)]
pub struct Logger {
    /// Enables echoing worker output to stdout.
    pub verbose: bool,
    /// Default color for worker output.
    pub default_color: PrinterColor,
    printer: Printer,
}

impl Default for Logger {
    fn default() -> Self {
        Self {
            verbose: true,
            default_color: PrinterColor::BoldYellow,
            printer: Printer,
        }
    }
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Self::default()
        }
    }

    /// Emit a line on behalf of an entity, tagged with its identity.
    pub fn entity_print(&self, identity: &str, message: &str) {
        log::info!("{identity}: {message}");
        if self.verbose {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            let formatted = format!("[{timestamp}][{identity}]: {message}");
            self.printer.print(&formatted, self.default_color);
        }
    }
}
