// Backup artifacts - naming, production, verification and listing

pub mod catalog;
pub mod compression;
pub mod producer;
pub mod types;
pub mod verify;

pub use catalog::{newest_first, ArtifactCatalog, Listing, UnclassifiedEntry};
pub use producer::{BackupPlan, BackupProducer, BackupReport, UploadOutcome};
pub use types::{
    format_stamp, manifest_path, ArtifactLocation, ArtifactManifest, ArtifactName, BackupArtifact,
    DatabaseKind, DumpMethod, StorageTier, MANIFEST_SUFFIX, REMOTE_ROOT, SAFETY_PREFIX,
};
pub use verify::IntegrityVerifier;
