//! Participant domain module.

mod model;

pub use model::{ParticipantProfile, fields};
