//! Cross-cutting utilities: errors, logging, printing.

pub mod errors;
pub mod logger;
pub mod printer;

pub use errors::{
    BoardError, EngineError, RegistrationError, SnapshotError, TemporaryError, WaitError,
};
pub use logger::Logger;
pub use printer::{Printer, PrinterColor};
