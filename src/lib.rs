//! # sheet-slice
//!
//! Partial, cached and resource-governed access to rectangular slices of
//! spreadsheet, delimited text and JSON files.
//!
//! ## Features
//!
//! - **Multi-format support**: Excel workbooks (`.xlsx`, `.xlsm`, `.xltx`, `.xltm`),
//!   OpenDocument spreadsheets (`.ods`), delimited text (`.csv`, `.tsv`) and JSON arrays
//! - **Range expressions**: A1 notation with partial forms (`B2`, `A:C`, `2:10`, `B2:`)
//!   and numeric bounds (`{row: [0,100), col: [0,5)}`), clipped to the sheet
//! - **Lazy reads**: probing touches structure only, and a fetch decodes only the
//!   requested rectangle, in bounded row chunks
//! - **Section cache**: byte-budgeted LRU keyed by file version, sheet and range,
//!   invalidated when the file changes
//! - **Prefetch**: sequential scans are detected and the next window is read ahead
//! - **Resource governor**: memory, CPU and network samples shrink chunk sizes,
//!   concurrency and the cache budget under pressure
//!
//! ## Usage
//!
//! ```no_run
//! use sheet_slice::{Config, Coordinator, FetchRequest};
//!
//! let coordinator = Coordinator::new(Config::from_env()?)?;
//! let result = coordinator.fetch(&FetchRequest::new("report.xlsx").sheet("Data").range("A1:E100"))?;
//! println!("{} rows from {}", result.rows.len(), result.range_used);
//! # Ok::<(), sheet_slice::Error>(())
//! ```
//!
//! The crate logs through [`tracing`] and never installs a subscriber.
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod governor;
mod helpers;
pub mod prefetch;
pub mod selection;
pub mod spreadsheet;

#[cfg(test)]
mod testing;

pub use crate::cache::CacheStats;
pub use crate::config::Config;
pub use crate::coordinator::cancel::CancelReason;
pub use crate::coordinator::cancel::CancelToken;
pub use crate::coordinator::Coordinator;
pub use crate::coordinator::FetchRequest;
pub use crate::coordinator::FetchResult;
pub use crate::error::Error;
pub use crate::error::ErrorKind;
pub use crate::governor::GovernorPolicy;
pub use crate::governor::GovernorState;
pub use crate::selection::ParseError;
pub use crate::selection::RangeSpec;
pub use crate::selection::SheetDescriptor;
pub use crate::spreadsheet::CellValue;
pub use crate::spreadsheet::Grid;
