//! `xxlsort` sorts an arbitrarily large stream of fixed-header,
//! variable-body records by their 64-byte key using a bounded amount of
//! memory.
//!
//! The input is consumed once; whatever fits the memory arena is sorted
//! in place and written out as a run, and the runs are then merged k ways
//! through a binary heap until a single run — the output — remains.
//! Records whose body is large enough to crowd the arena are sorted by
//! header alone and their bodies fetched from the input again only when
//! the final output is produced.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use xxlsort::SorterBuilder;
//!
//! fn main() {
//!     env_logger::init();
//!
//!     let sorter = SorterBuilder::new()
//!         .with_arena_size(512 * xxlsort::mem::MIB)
//!         .with_tmp_dir(Path::new("/var/tmp"))
//!         .build();
//!
//!     sorter
//!         .sort(Path::new("records.bin"), Path::new("records.sorted"))
//!         .unwrap();
//! }
//! ```

pub mod buffer;
pub mod bypass;
pub mod config;
pub mod error;
pub mod file;
pub mod mem;
pub mod merger;
pub mod record;
pub mod sort;

pub use error::{Error, Result};
pub use record::{ExternalHeader, InternalHeader, MAX_BODY_SIZE};
pub use sort::{RegionLayout, Sorter, SorterBuilder, DEFAULT_ARENA_SIZE};
