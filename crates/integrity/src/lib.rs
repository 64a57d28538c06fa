//! Server-side re-derivation and cross-checking of evidence facts.
//!
//! Everything in this crate is synchronous and free of I/O: callers feed
//! chunks into a [`stream::HashingStream`], then hand the buffered bytes to
//! [`mime::sniff_mime`], [`metadata::extract_exif`] and finally
//! [`validator::validate_integrity`].

pub mod metadata;
pub mod mime;
pub mod policy;
pub mod stream;
pub mod validator;

pub use metadata::{ExifMetadata, extract_exif};
pub use mime::sniff_mime;
pub use policy::{EvidencePolicy, IntegrityThresholds, global_max_size_bytes, policy_for};
pub use stream::{FileTooLarge, HashingStream, StreamedPayload, check_content_length};
pub use validator::{IntegrityInput, IntegrityVerdict, failed_checks, validate_integrity};
