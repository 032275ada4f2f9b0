//! KERI Codec - wire format for key event messages
//!
//! A message on the wire is a versioned body followed by attachment groups:
//!
//! ```text
//! {"v":"KERI10JSON0000fd_","t":"icp",...}-AAB<indexed signature>...
//! ```
//!
//! - [`version`]: the version marker and first-byte stream classification
//! - [`event`]: body records, seals and the typed key event sum type
//! - [`serder`]: exact body bytes, SAID computation and verification
//! - [`attachments`]: count-prefixed signature and receipt groups
//! - [`parser`]: incremental parsing of a byte stream into messages
//! - [`builder`]: construction of new events and receipts

#![forbid(unsafe_code)]

pub mod attachments;
pub mod builder;
pub mod error;
pub mod event;
pub mod parser;
pub mod serder;
pub mod version;

pub use attachments::{
    Attachments, Counter, CounterCode, FirstSeen, SourceSeal, TransReceipt,
};
pub use builder::{
    next_digests, receipt, InceptionBuilder, InteractionBuilder, RotationBuilder,
};
pub use error::{CodecError, Result};
pub use event::{
    format_sn, parse_sn, ConfigTrait, EventBody, EventKind, EventSeal, Ilk, InceptionEvent,
    InteractionEvent, KeyConfig, KeyEvent, ReceiptBody, RotationEvent, Seal,
};
pub use parser::{Message, Parser};
pub use serder::Serder;
pub use version::{smell, Kind, Smellage};
