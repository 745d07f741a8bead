//! Timed follow-up and abandoned-cart sequences.

pub mod model;
pub mod scheduler;

pub use model::{
    CartDetails, SequenceFamily, SequenceRule, SequenceRun, SequenceStatus, SequenceStepJob,
    StepTarget,
};
pub use scheduler::{SequenceScheduler, render_template};
