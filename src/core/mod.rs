pub mod detector;
pub mod engine;
pub mod fingerprint;
pub mod lock;
pub mod metadata;
pub mod policy;
pub mod progress;
pub mod retry;
pub mod scanner;
pub mod worker;

pub use detector::{Change, ChangeDetector};
pub use engine::{analyze_folder, PassOutcome, PathMessage, SyncEngine, SyncResult, SyncStats};
pub use fingerprint::{fingerprint, fingerprint_file};
pub use lock::{lock_file_path, FolderGuard, FolderLocks};
pub use metadata::{MetadataStore, RecordMap, RecordState, SyncPolicy, SyncRecord, METADATA_FILE_NAME};
pub use policy::PolicyResolver;
pub use progress::{FileOutcome, ProgressEvent, ProgressReporter};
pub use retry::{Backoff, RetryPolicy, RetryingStore};
pub use scanner::{FolderScanner, FolderSnapshot, SnapshotEntry};
pub use worker::SyncWorker;
