//! Embedded transactional key-value store.
//!
//! An [`Environment`] owns a memory-mapped data file holding a copy-on-write
//! B+tree per table. Any number of read-only [`Transaction`]s see stable
//! snapshots while a single writer prepares the next one. [`Cursor`]s walk a
//! table in key order, and values come back as [`Val`] views borrowed from
//! the transaction. [`Store`] wraps an environment with serialized writers
//! and guaranteed commit-or-abort.

mod chk;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod meta;
mod midl;
mod page;
mod store;
mod transaction;
mod tree;
mod types;
mod value;

pub use crate::chk::{check, ChkFlags, ChkReport};
pub use crate::constants::*;
pub use crate::cursor::{Cursor, CursorOp, Entry, Iter};
pub use crate::database::Database;
pub use crate::env::Environment;
pub use crate::error::{Error, ErrorKind, Result, RESULT_TRUE, SUCCESS};
pub use crate::store::{Recovery, Store, StoreRegistry};
pub use crate::transaction::{Transaction, TxnState};
pub use crate::types::*;
pub use crate::value::Val;
