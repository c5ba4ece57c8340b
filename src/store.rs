//! Opinionated wrapper around an [`Environment`].
//!
//! A [`Store`] serializes write transactions through a fair lock and makes
//! sure every transaction it starts ends exactly once, whether the caller's
//! closure returns, fails or panics.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::{FairMutex, Mutex};

use crate::chk::{self, ChkFlags, ChkReport};
use crate::constants::EnvFlags;
use crate::env::{file_paths, Environment};
use crate::error::{Error, Result};
use crate::transaction::{Transaction, TxnState};

const DEFAULT_STORE_MODE: u32 = 0o664;

/// Recovery run while opening a store.
#[derive(Debug, Clone)]
pub struct Recovery {
    pub report: ChkReport,
    pub duration: Duration,
}

/// Environment with serialized writers and guaranteed transaction
/// finalization.
pub struct Store {
    env: Environment,
    path: PathBuf,
    data_path: PathBuf,
    recovery: Option<Recovery>,
    /// Held for the whole of every write transaction
    write_lock: FairMutex<()>,
    /// Thread holding `write_lock`
    writer: Mutex<Option<ThreadId>>,
    closed: OnceCell<Instant>,
    updates: AtomicU64,
    synced: AtomicU64,
    registry: Mutex<Weak<Mutex<Vec<Arc<Store>>>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .field("updates", &self.updates())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(s) => (*s).to_owned(),
            Err(payload) => match payload.downcast::<Error>() {
                Ok(e) => e.to_string(),
                Err(_) => "non-string panic".to_owned(),
            },
        },
    }
}

/// Records the thread holding the store's writer lock until dropped.
struct WriterMark<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> WriterMark<'a> {
    fn set(owner: &'a Mutex<Option<ThreadId>>) -> Self {
        *owner.lock() = Some(thread::current().id());
        WriterMark(owner)
    }
}

impl Drop for WriterMark<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// Ends a transaction that the caller's closure left open.
fn finish_open(txn: &mut Transaction<'_>) -> Result<()> {
    match txn.state() {
        TxnState::Active | TxnState::Reset => txn.abort(),
        TxnState::Aborted | TxnState::Committed => Ok(()),
    }
}

impl Store {
    /// Opens the store at `path`.
    ///
    /// `init_env` configures the environment before it is opened and `init`
    /// runs once it is; both are told whether the data file is being
    /// created. A read-only open of a file with a damaged meta page runs a
    /// repairing consistency check and tries again. `mode` 0 picks `0o664`.
    pub fn open<P, E, I>(path: P, flags: EnvFlags, mode: u32, init_env: E, init: I) -> Result<Store>
    where
        P: AsRef<Path>,
        E: FnOnce(&Environment, bool) -> Result<()>,
        I: FnOnce(&Store, bool) -> Result<()>,
    {
        let path = path.as_ref().to_path_buf();
        let (data_path, _) = file_paths(&path, flags);
        let create = !data_path.exists();
        let env = Environment::new()?;
        init_env(&env, create)?;

        let mode = if mode == 0 { DEFAULT_STORE_MODE } else { mode };
        let mut recovery = None;
        match env.open(&path, flags, mode) {
            Ok(()) => {}
            Err(Error::WannaRecovery) => {
                let started = Instant::now();
                let report = chk::check(&data_path, ChkFlags::WRITE | ChkFlags::VERBOSE)?;
                let duration = started.elapsed();
                info!(
                    "recovered {} in {:?}: {} problem(s), repaired={}",
                    data_path.display(),
                    duration,
                    report.problems,
                    report.repaired
                );
                env.open(&path, flags, mode)?;
                recovery = Some(Recovery { report, duration });
            }
            Err(e) => return Err(e),
        }
        env.reader_check()?;

        let store = Store {
            env,
            path,
            data_path,
            recovery,
            write_lock: FairMutex::new(()),
            writer: Mutex::new(None),
            closed: OnceCell::new(),
            updates: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            registry: Mutex::new(Weak::new()),
        };
        init(&store, create)?;
        debug!("store {} ready (created: {})", store.path.display(), create);
        Ok(store)
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recovery performed by `open`, if any.
    pub fn recovery(&self) -> Option<&Recovery> {
        self.recovery.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// Number of successful `update` calls.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    /// Value of `updates` at the last successful `sync`.
    pub fn synced(&self) -> u64 {
        self.synced.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// The writer lock is not reentrant; a thread already inside `update`
    /// would wait on itself.
    fn ensure_not_writer(&self) -> Result<()> {
        if *self.writer.lock() == Some(thread::current().id()) {
            return Err(Error::TxnOverlapping);
        }
        Ok(())
    }

    /// Runs `f` in a write transaction.
    ///
    /// Writers queue on a fair lock. The transaction is committed when `f`
    /// returns `Ok` without finishing it, and aborted when `f` fails or
    /// panics; a panic comes back as `Error::Panicked`. When the abort
    /// itself fails, its error is returned instead of the caller's.
    ///
    /// Calling `update` or `close` from inside `f` fails with
    /// `TxnOverlapping`.
    pub fn update<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R>,
    {
        self.ensure_open()?;
        self.ensure_not_writer()?;
        let _writer = self.write_lock.lock();
        let _mark = WriterMark::set(&self.writer);
        self.ensure_open()?;
        let mut txn = self.env.begin_rw()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut txn)));
        match outcome {
            Ok(Ok(value)) => {
                match txn.state() {
                    TxnState::Active => txn.commit()?,
                    TxnState::Committed => {}
                    TxnState::Aborted | TxnState::Reset => return Err(Error::BadTxn),
                }
                self.updates.fetch_add(1, Ordering::AcqRel);
                Ok(value)
            }
            Ok(Err(e)) => {
                finish_open(&mut txn)?;
                Err(e)
            }
            Err(payload) => {
                let msg = panic_message(payload);
                warn!("write transaction panicked, aborting: {}", msg);
                finish_open(&mut txn)?;
                Err(Error::Panicked(msg))
            }
        }
    }

    /// Runs `f` in a read-only transaction, which is aborted afterwards.
    pub fn view<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        self.ensure_open()?;
        let mut txn = self.env.begin_ro()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&txn)));
        finish_open(&mut txn)?;
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(payload);
                warn!("read transaction panicked: {}", msg);
                Err(Error::Panicked(msg))
            }
        }
    }

    /// Like [`Store::view`], but reuses `txn`: it is renewed before `f` runs
    /// and reset afterwards. Without a transaction this is `view`.
    pub fn view_renew<R, F>(&self, txn: Option<&mut Transaction<'_>>, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        let Some(txn) = txn else {
            return self.view(f);
        };
        self.ensure_open()?;
        if !ptr::eq(txn.env(), &self.env) {
            return Err(Error::InvalidArgument);
        }
        txn.renew()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&*txn)));
        if !txn.is_reset() {
            txn.reset()?;
        }
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(payload);
                warn!("read transaction panicked: {}", msg);
                Err(Error::Panicked(msg))
            }
        }
    }

    /// Flushes everything committed so far.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        let updates = self.updates();
        self.env.sync(true, false)?;
        self.synced.store(updates, Ordering::Release);
        Ok(())
    }

    /// Checks every tree of the latest committed snapshot. Writers keep
    /// running while the check holds its read transaction.
    pub fn chk(&self) -> Result<ChkReport> {
        self.ensure_open()?;
        let mut txn = self.env.begin_ro()?;
        let report = chk::check_snapshot(&txn.snapshot(), &self.data_path, true);
        txn.abort()?;
        Ok(report)
    }

    /// Closes the store once no writer is running. A second close fails
    /// with `Closed`.
    pub fn close(&self) -> Result<()> {
        self.ensure_not_writer()?;
        let _writer = self.write_lock.lock();
        self.ensure_open()?;
        self.env.close(false)?;
        let _ = self.closed.set(Instant::now());
        if let Some(stores) = self.registry.lock().upgrade() {
            stores.lock().retain(|s| !ptr::eq(Arc::as_ptr(s), self));
        }
        info!("store {} closed", self.path.display());
        Ok(())
    }
}

/// Set of open stores, for shutting them all down together.
#[derive(Debug, Clone, Default)]
pub struct StoreRegistry {
    stores: Arc<Mutex<Vec<Arc<Store>>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        StoreRegistry::default()
    }

    /// Opens a store and registers it.
    pub fn open<P, E, I>(&self, path: P, flags: EnvFlags, mode: u32, init_env: E, init: I) -> Result<Arc<Store>>
    where
        P: AsRef<Path>,
        E: FnOnce(&Environment, bool) -> Result<()>,
        I: FnOnce(&Store, bool) -> Result<()>,
    {
        let store = Arc::new(Store::open(path, flags, mode, init_env, init)?);
        self.register(&store);
        Ok(store)
    }

    /// Adds a store; closing the store removes it again.
    pub fn register(&self, store: &Arc<Store>) {
        *store.registry.lock() = Arc::downgrade(&self.stores);
        let mut stores = self.stores.lock();
        if !stores.iter().any(|s| Arc::ptr_eq(s, store)) {
            stores.push(Arc::clone(store));
        }
    }

    /// Removes a store without closing it. Returns whether it was present.
    pub fn deregister(&self, store: &Store) -> bool {
        let mut stores = self.stores.lock();
        let before = stores.len();
        stores.retain(|s| !ptr::eq(Arc::as_ptr(s), store));
        stores.len() != before
    }

    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stores(&self) -> Vec<Arc<Store>> {
        self.stores.lock().clone()
    }

    /// Closes every registered store. All are attempted; the first error is
    /// returned.
    pub fn close_all(&self) -> Result<()> {
        let mut first = None;
        for store in self.stores() {
            if let Err(e) = store.close() {
                warn!("closing store {}: {}", store.path().display(), e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
