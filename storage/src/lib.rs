pub mod crypto;
pub mod index;
pub mod repo;
pub mod snapshot;
pub mod wal;

pub use crypto::{AtRestCipher, KmsHookCipher, NoOpCipher};
pub use index::LinearAnnIndex;
pub use repo::{Repository, RepoError, SnapshotView};
pub use snapshot::SnapshotManager;
pub use wal::{Wal, WalError};
