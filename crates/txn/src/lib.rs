//! Two-phase transaction manager and its supporting per-store
//! collaborators (C6, C7, C9, C10).
//!
//! `cowtree-core` defines the collaborator contracts and `cowtree-txlog`
//! sequences stage entries; this crate is where they come together into
//! an actual transaction: [`item_tracker::ItemActionTracker`] (item-level
//! intents and locking), [`node::NodeRepository`] (per-store node
//! staging and commit sub-protocols), [`transaction::Transaction`] (the
//! two-phase commit/rollback driver), and [`recovery`] (the background
//! scanner that finishes or undoes what a crashed process left behind).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod item_tracker;
pub mod node;
pub mod recovery;
pub mod transaction;

pub use item_tracker::ItemActionTracker;
pub use node::NodeRepository;
pub use recovery::{recover_one, run_recovery_loop};
pub use transaction::{BTreeCallback, Phase, Transaction};
