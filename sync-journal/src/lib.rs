pub mod journal;
pub mod record;

pub use journal::Journal;
pub use record::{
    CompactionMark, ConflictRow, ConflictStatus, HeldEntry, JournalSide, NewConflict, PairStateRow,
};
