//! Block index, chain selection, and UTXO state management.

pub mod blockindex;
pub mod chain;
pub mod checkqueue;
pub mod coins;
pub mod coinview;
pub mod flatfiles;
pub mod genesis;
pub mod notify;
pub mod orphans;
pub mod state;
pub mod txindex;
pub mod undo;
pub mod validation;
pub mod warnings;
