use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use lumokv::{
    check, ChkFlags, Database, DbFlags, EnvFlags, Environment, Error, PutFlags, Result, Store,
    StoreRegistry, TxnFlags, DATA_FILE_NAME,
};
use tempfile::TempDir;

fn open_store(path: &Path, flags: EnvFlags) -> Result<Store> {
    Store::open(
        path,
        flags,
        0,
        |env, _create| env.set_max_tables(4),
        |store, create| {
            if !create {
                return Ok(());
            }
            store.update(|txn| {
                txn.open_table(Some("settings"), DbFlags::CREATE)?;
                Ok(())
            })
        },
    )
}

// Common test setup
fn setup_test_store() -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(temp_dir.path(), EnvFlags::empty()).unwrap();
    (temp_dir, store)
}

fn read_main(store: &Store, key: &[u8]) -> Option<Vec<u8>> {
    store
        .view(|txn| Ok(txn.get(Database::main(), key)?.map(|v| v.to_vec())))
        .unwrap()
}

#[test]
fn test_open_runs_init_on_create() {
    let (dir, store) = setup_test_store();
    assert!(store.recovery().is_none());
    assert_eq!(store.path(), dir.path());
    assert_eq!(store.env().max_tables(), 4);
    // The table made by the init callback exists
    store
        .view(|txn| txn.open_table(Some("settings"), DbFlags::empty()).map(|_| ()))
        .unwrap();
    assert_eq!(store.updates(), 1);
    store.close().unwrap();

    let reopened = open_store(dir.path(), EnvFlags::empty()).unwrap();
    assert_eq!(reopened.updates(), 0);
}

#[test]
fn test_update_commits() {
    let (_dir, store) = setup_test_store();
    let value = store
        .update(|txn| {
            txn.put(Database::main(), b"key", b"value", PutFlags::UPSERT)?;
            Ok(42)
        })
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(store.updates(), 2);
    assert_eq!(read_main(&store, b"key"), Some(b"value".to_vec()));
}

#[test]
fn test_update_error_aborts() {
    let (_dir, store) = setup_test_store();
    let result: Result<()> = store.update(|txn| {
        txn.put(Database::main(), b"key", b"value", PutFlags::UPSERT)?;
        Err(Error::KeyExist)
    });
    assert!(matches!(result, Err(Error::KeyExist)));
    assert_eq!(read_main(&store, b"key"), None);
    assert_eq!(store.updates(), 1);
}

#[test]
fn test_update_panic_aborts() {
    let (_dir, store) = setup_test_store();
    let result = store.update(|txn| -> Result<()> {
        txn.put(Database::main(), b"key", b"value", PutFlags::UPSERT)?;
        panic!("boom");
    });
    match result {
        Err(Error::Panicked(msg)) => assert_eq!(msg, "boom"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(read_main(&store, b"key"), None);

    // The writer lock was released
    store
        .update(|txn| txn.put(Database::main(), b"after", b"1", PutFlags::UPSERT))
        .unwrap();
    assert_eq!(read_main(&store, b"after"), Some(b"1".to_vec()));
}

#[test]
fn test_update_finished_by_callback() {
    let (_dir, store) = setup_test_store();
    store
        .update(|txn| {
            txn.put(Database::main(), b"k", b"v", PutFlags::UPSERT)?;
            txn.commit()
        })
        .unwrap();
    assert_eq!(read_main(&store, b"k"), Some(b"v".to_vec()));

    let result = store.update(|txn| {
        txn.put(Database::main(), b"gone", b"v", PutFlags::UPSERT)?;
        txn.abort()
    });
    assert!(matches!(result, Err(Error::BadTxn)));
    assert_eq!(read_main(&store, b"gone"), None);
}

#[test]
fn test_concurrent_updates_are_serialized() {
    let (_dir, store) = setup_test_store();
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    store
                        .update(|txn| {
                            let current = txn
                                .get(Database::main(), b"counter")?
                                .map_or(0, |v| v.u64());
                            let next = current + 1;
                            txn.put(
                                Database::main(),
                                b"counter",
                                &next.to_ne_bytes(),
                                PutFlags::UPSERT,
                            )
                        })
                        .unwrap();
                }
            });
        }
    });
    let counter = store
        .view(|txn| Ok(txn.get(Database::main(), b"counter")?.map(|v| v.u64())))
        .unwrap();
    assert_eq!(counter, Some(100));
    assert_eq!(store.updates(), 101);
}

#[test]
fn test_nested_update_is_rejected() {
    let (_dir, store) = setup_test_store();
    let result = store.update(|txn| {
        txn.put(Database::main(), b"outer", b"1", PutFlags::UPSERT)?;
        store.update(|inner| inner.put(Database::main(), b"inner", b"1", PutFlags::UPSERT))
    });
    assert!(matches!(result, Err(Error::TxnOverlapping)));
    assert_eq!(read_main(&store, b"outer"), None);

    let result = store.update(|_| store.close());
    assert!(matches!(result, Err(Error::TxnOverlapping)));
    assert!(!store.is_closed());

    // The lock is free again
    store
        .update(|txn| txn.put(Database::main(), b"after", b"1", PutFlags::UPSERT))
        .unwrap();
}

#[test]
fn test_view_is_read_only() {
    let (_dir, store) = setup_test_store();
    let result = store.view(|txn| {
        assert!(txn.is_readonly());
        txn.get(Database::main(), b"missing").map(|v| v.is_none())
    });
    assert!(result.unwrap());

    let panicked = store.view(|_| -> Result<()> { panic!("reader failed") });
    assert!(matches!(panicked, Err(Error::Panicked(_))));
    // No reader slot is left behind
    assert!(store.env().reader_list().unwrap().is_empty());
}

#[test]
fn test_view_renew_reuses_transaction() {
    let (_dir, store) = setup_test_store();
    let mut txn = store.env().begin(TxnFlags::RDONLY_PREPARE).unwrap();

    let seen = store
        .view_renew(Some(&mut txn), |t| Ok(t.get(Database::main(), b"k")?.map(|v| v.to_vec())))
        .unwrap();
    assert_eq!(seen, None);
    assert!(txn.is_reset());

    store
        .update(|t| t.put(Database::main(), b"k", b"v", PutFlags::UPSERT))
        .unwrap();
    let seen = store
        .view_renew(Some(&mut txn), |t| Ok(t.get(Database::main(), b"k")?.map(|v| v.to_vec())))
        .unwrap();
    assert_eq!(seen, Some(b"v".to_vec()));
    assert!(txn.is_reset());

    let seen = store
        .view_renew(None, |t| Ok(t.get(Database::main(), b"k")?.is_some()))
        .unwrap();
    assert!(seen);

    // A transaction of another environment is refused
    let other_dir = TempDir::new().unwrap();
    let other = Environment::new().unwrap();
    other.open(other_dir.path(), EnvFlags::empty(), 0).unwrap();
    let mut foreign = other.begin(TxnFlags::RDONLY_PREPARE).unwrap();
    assert!(matches!(
        store.view_renew(Some(&mut foreign), |_| Ok(())),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn test_sync_tracks_updates() {
    let (_dir, store) = setup_test_store();
    store.env().set_flags(EnvFlags::SAFE_NOSYNC, true).unwrap();
    store
        .update(|txn| txn.put(Database::main(), b"k", b"v", PutFlags::UPSERT))
        .unwrap();
    assert_eq!(store.synced(), 0);
    store.sync().unwrap();
    assert_eq!(store.synced(), store.updates());
    assert_eq!(store.env().info().unwrap().unsync_volume, 0);
}

#[test]
fn test_close() {
    let (_dir, store) = setup_test_store();
    {
        let _reader = store.env().begin_ro().unwrap();
        assert!(matches!(store.close(), Err(Error::Busy)));
        assert!(!store.is_closed());
    }
    store.close().unwrap();
    assert!(store.is_closed());
    assert!(matches!(store.close(), Err(Error::Closed)));
    assert!(matches!(
        store.update(|txn| txn.put(Database::main(), b"k", b"v", PutFlags::UPSERT)),
        Err(Error::Closed)
    ));
    assert!(matches!(store.view(|_| Ok(())), Err(Error::Closed)));
    assert!(matches!(store.sync(), Err(Error::Closed)));
}

#[test]
fn test_close_waits_for_writer() {
    let (dir, store) = setup_test_store();
    let started = Barrier::new(2);
    thread::scope(|s| {
        let writer = s.spawn(|| {
            store.update(|txn| {
                txn.put(Database::main(), b"late", b"1", PutFlags::UPSERT)?;
                started.wait();
                thread::sleep(Duration::from_millis(100));
                Ok(())
            })
        });
        started.wait();
        store.close().unwrap();
        // The commit landed before close returned
        assert_eq!(store.updates(), 2);
        writer.join().unwrap().unwrap();
    });
    drop(store);

    let reopened = open_store(dir.path(), EnvFlags::empty()).unwrap();
    assert_eq!(read_main(&reopened, b"late"), Some(b"1".to_vec()));
}

#[test]
fn test_chk_on_healthy_store() {
    let (_dir, store) = setup_test_store();
    store
        .update(|txn| {
            let settings = txn.open_table(Some("settings"), DbFlags::empty())?;
            for i in 0..100u32 {
                txn.put(settings, &i.to_be_bytes(), b"value", PutFlags::UPSERT)?;
            }
            Ok(())
        })
        .unwrap();
    let report = store.chk().unwrap();
    assert!(report.is_ok(), "{}", report.output);
    assert!(!report.repaired);
    assert_eq!(report.txnid, 2);
}

#[test]
fn test_chk_while_writing() {
    let (_dir, store) = setup_test_store();
    store
        .update(|txn| {
            for i in 0..3000u32 {
                txn.put(Database::main(), &i.to_be_bytes(), &[0x33; 64], PutFlags::UPSERT)?;
            }
            Ok(())
        })
        .unwrap();

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            for round in 0..400u32 {
                let key = (round * 7 % 3000).to_be_bytes();
                store
                    .update(|txn| txn.put(Database::main(), &key, &round.to_ne_bytes(), PutFlags::UPSERT))
                    .unwrap();
            }
            done.store(true, Ordering::Release);
        });
        let mut runs = 0;
        while runs < 3 || !done.load(Ordering::Acquire) {
            let report = store.chk().unwrap();
            assert!(report.is_ok(), "{}", report.output);
            runs += 1;
        }
    });
    assert_eq!(store.updates(), 402);
}

#[test]
fn test_file_check_needs_closed_store() {
    let (dir, store) = setup_test_store();
    assert!(matches!(check(dir.path(), ChkFlags::empty()), Err(Error::Busy)));
    store.close().unwrap();
    let report = check(dir.path(), ChkFlags::VERBOSE).unwrap();
    assert!(report.is_ok(), "{}", report.output);
    assert_eq!(report.txnid, 1);
}

#[test]
fn test_registry_close_all() {
    let registry = StoreRegistry::new();
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = registry
        .open(dir_a.path(), EnvFlags::empty(), 0, |_, _| Ok(()), |_, _| Ok(()))
        .unwrap();
    let b = registry
        .open(dir_b.path(), EnvFlags::empty(), 0, |_, _| Ok(()), |_, _| Ok(()))
        .unwrap();
    assert_eq!(registry.len(), 2);

    // Closing a store takes it out of the registry
    a.close().unwrap();
    assert_eq!(registry.len(), 1);

    registry.close_all().unwrap();
    assert!(registry.is_empty());
    assert!(b.is_closed());

    let c = registry
        .open(dir_a.path(), EnvFlags::empty(), 0, |_, _| Ok(()), |_, _| Ok(()))
        .unwrap();
    assert!(registry.deregister(&c));
    assert!(!registry.deregister(&c));
    assert!(!c.is_closed());
}

#[test]
fn test_recovery_of_torn_meta() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(dir.path(), EnvFlags::empty(), 0, |_, _| Ok(()), |_, _| Ok(())).unwrap();
        store
            .update(|txn| txn.put(Database::main(), b"a", b"1", PutFlags::UPSERT))
            .unwrap();
        store
            .update(|txn| txn.put(Database::main(), b"b", b"2", PutFlags::UPSERT))
            .unwrap();
        store.close().unwrap();
    }

    // Txn 2 lives in meta slot 0; flip a byte of its txn id
    let data_path = dir.path().join(DATA_FILE_NAME);
    let file = OpenOptions::new().read(true).write(true).open(&data_path).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, 32).unwrap();
    byte[0] ^= 0xFF;
    file.write_all_at(&byte, 32).unwrap();
    drop(file);

    // A plain read-only open refuses the file
    let env = Environment::new().unwrap();
    assert!(matches!(
        env.open(dir.path(), EnvFlags::RDONLY, 0),
        Err(Error::WannaRecovery)
    ));
    drop(env);

    let store = Store::open(dir.path(), EnvFlags::RDONLY, 0, |_, _| Ok(()), |_, _| Ok(())).unwrap();
    let recovery = store.recovery().unwrap();
    assert!(recovery.report.repaired);
    assert!(recovery.report.problems >= 1);
    assert_eq!(recovery.report.txnid, 1);

    assert_eq!(read_main(&store, b"a"), Some(b"1".to_vec()));
    assert_eq!(read_main(&store, b"b"), None);
    assert!(matches!(
        store.update(|txn| txn.put(Database::main(), b"c", b"3", PutFlags::UPSERT)),
        Err(Error::Access)
    ));
    assert!(store.chk().unwrap().is_ok());
}
