//! Trikey Keybox
//!
//! The account's key configuration: one active 2-of-3 keyset plus every
//! keyset it has superseded.
//!
//! # Descriptor
//!
//! ```text
//! wsh(sortedmulti(2, [app]xpub/0/*, [hw]xpub/0/*, [server]xpub/0/*))
//! ```
//!
//! Change uses `/1/*`. `sortedmulti` keeps the script independent of the
//! order in which the factors are listed.

pub mod descriptor;
pub mod keybox;
pub mod keyset;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use descriptor::{DescriptorError, SpendingDescriptor, WalletDescriptor, WatchingDescriptor};
pub use keybox::{Keybox, KeyboxError};
pub use keyset::{KeysetError, SpendingKeyset};
pub use store::{AppKeyStore, KeyboxStore, MemoryAppKeyStore, StoreError};
