mod layout;
mod manifest;
mod retry;
mod settings;

pub use layout::InstallLayout;
pub use manifest::{
    validate_item_for_phase, FailPolicy, Item, ItemType, Manifest, Phase, SkipIf,
};
pub use retry::{
    current_unix_timestamp, FsRetryStore, MemoryRetryStore, RetryCounter, RetryState, RetryStore,
    RETRY_CAP,
};
pub use settings::{ManagedOutcome, Mode, Settings};
