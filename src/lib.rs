//! Decoder for WMO FM-94 BUFR, editions 2 through 4.
//!
//! A message is parsed into its sections eagerly, while the descriptor
//! tree, bit layout and decoded values are built lazily against a set of
//! lookup tables the caller provides. Uncompressed and compressed data
//! sections are both supported, as is scanning container files that hold
//! many messages with arbitrary bytes in between.

pub mod bits;
pub mod descriptor;
pub mod errors;
pub mod layout;
pub mod message;
pub mod reader;
pub mod scan;
pub mod tables;
pub mod trace;
pub mod tree;

pub use descriptor::Fxy;
pub use errors::{Error, Result};
pub use message::Message;
pub use reader::{Field, Subset, Value};
pub use scan::{scan_bytes, scan_path, ScanResult};
pub use tables::{Catalog, TableContext, TableLookup};
pub use trace::Trace;
pub use tree::DecodeTree;
