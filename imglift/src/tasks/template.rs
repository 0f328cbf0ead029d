//! No-op template task set for unrecognized guests.
//!
//! Such images still migrate (the operator may have prepared them by
//! hand), but no guest modification is attempted.

use super::OsTask;

pub static TASKS: &[OsTask] = &[];
