//! Content-Addressable Blob Store and Metadata Index
//!
//! - SHA-256 content addressing over pre-compression bytes
//! - Sharded blob directories, gzip for compressible content
//! - Persisted reference counts with explicit garbage collection
//! - Single writer thread for every mutation
//! - SQLite index of attachment records
//!
//! ## Architecture
//!
//! ```text
//! <base>/
//! ├── attachments.db            # SQLite metadata index
//! ├── reference_counts.json     # hash -> count
//! ├── blobs/
//! │   └── a3/
//! │       └── a3f2e1d4...       # full SHA-256 hash as filename
//! └── metadata/
//!     └── a3f2e1d4....meta      # blob descriptor (JSON)
//! ```

pub mod cas;
pub mod codec;
mod gc;
pub mod integrity;
pub mod layout;
pub mod metadata_store;
pub mod reference_counts;
mod writer;

pub use cas::BlobStore;
pub use codec::{compute_hash, CompressionPolicy};
pub use integrity::{verify_integrity, ValidationReport};
pub use layout::StorageLayout;
pub use metadata_store::{now_millis, MetadataStore};
