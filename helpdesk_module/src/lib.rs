pub mod accounts;
pub mod clients;
pub mod convert;
pub mod dedupe;
pub mod email_queue;
pub mod fetch;
pub mod inbound;
pub mod mail;
pub mod processor;
pub mod routing;
pub mod run_lock;
pub mod service;

pub use convert::{ConversionOutcome, ConvertError, ServiceBackend, TicketBackend};
pub use dedupe::{DuplicateDetector, DuplicateVerdict};
pub use processor::{BatchReport, Processor};
