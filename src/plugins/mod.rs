//! Ledger subsystems: the record store, admission control, and the
//! integration points (failure hook, process work units).

pub mod admission;
pub mod exec;
pub mod hooks;
pub mod memory;
pub mod records;
