//! C5: custody transfer timer bookkeeping (spec §4.5).

pub mod timers;
