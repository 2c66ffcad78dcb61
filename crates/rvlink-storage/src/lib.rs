//! Encrypted client database for rvlink.
//!
//! A single sled tree holds every record, keyed by a typed prefix.
//! Values are bincode-encoded and sealed with XChaCha20-Poly1305 under
//! a key derived from the caller's master key. All access goes through
//! [`ClientDb::view`] (read-only) and [`ClientDb::update`] (read-write)
//! transaction scopes; an update either commits every write it made or
//! none of them.
//!
//! # Record families
//!
//! - [`addressbook`]: address book entries and per-peer ratchets
//! - [`kx`]: in-flight KX records, KX searches, unKX'd member info
//! - [`actions`]: post-KX actions before and after linking
//! - [`posts`]: post subscription flags
//! - [`identity`]: the local identity

pub mod actions;
pub mod addressbook;
pub mod engine;
pub mod identity;
pub mod kx;
pub mod posts;

pub use actions::{PostKxAction, PostKxActionKind};
pub use addressbook::AddressBookEntry;
pub use engine::{ClientDb, Tx};
pub use kx::{KxRecord, KxSearch, KxStage, UnkxdUserInfo};
