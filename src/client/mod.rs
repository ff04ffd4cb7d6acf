//! Client-side replica sync, remote room subscriptions, and transclusion
//! resolution (§4.5, §4.7).

pub mod remote;
pub mod sync;
pub mod transclusion;

pub use remote::RemoteRoomClient;
pub use sync::{SyncConfig, SyncManager};
pub use transclusion::TranscludeResolver;
