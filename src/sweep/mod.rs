//! Sequential resume sweep.
//!
//! An independent path from the chunked executor: items are processed one at
//! a time straight from the source, with progress kept in a resume pointer
//! and terminal failures collected in a queue for a later retry pass.

mod command;
mod engine;
mod state;

pub use command::CommandHandler;
pub use engine::{load_items, Item, ItemHandler, Sweep, SweepMode, SweepOptions, SweepStats};
pub use state::{FailedEntry, FailedQueue, ResumePointer, SweepState};
