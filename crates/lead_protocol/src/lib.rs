pub mod message;

pub use message::{
    DeadLetter, ProtocolError, TaskEnvelope, TaskOutcome, TaskReport, VerificationReport,
};
