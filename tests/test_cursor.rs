use lumokv::{Cursor, CursorOp, Database, DbFlags, EnvFlags, Environment, Error, PutFlags};
use proptest::prelude::*;
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new().unwrap();
    env.set_max_tables(8).unwrap();
    env.open(temp_dir.path(), EnvFlags::empty(), 0o644).unwrap();
    (temp_dir, env)
}

fn fill_main(env: &Environment, keys: &[&[u8]]) {
    let mut txn = env.begin_rw().unwrap();
    for key in keys {
        txn.put(Database::main(), key, &[b'v', key[0]], PutFlags::UPSERT)
            .unwrap();
    }
    txn.commit().unwrap();
}

/// Table "dups": a -> 1 2 3, b -> 1, c -> 1 2
fn fill_dups(env: &Environment) -> Database {
    let mut txn = env.begin_rw().unwrap();
    let db = txn
        .open_table(Some("dups"), DbFlags::DUPSORT | DbFlags::CREATE)
        .unwrap();
    for (k, v) in [
        (b"a", b"1"),
        (b"a", b"3"),
        (b"a", b"2"),
        (b"b", b"1"),
        (b"c", b"2"),
        (b"c", b"1"),
    ] {
        txn.put(db, k, v, PutFlags::UPSERT).unwrap();
    }
    txn.commit().unwrap();
    db
}

fn pair(entry: Option<lumokv::Entry<'_>>) -> Option<(Vec<u8>, Vec<u8>)> {
    entry.map(|e| (e.key.to_vec(), e.data.to_vec()))
}

fn kv(k: &[u8], v: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    Some((k.to_vec(), v.to_vec()))
}

#[test]
fn test_walk_forward_and_back() {
    let (_dir, env) = setup_test_env();
    fill_main(&env, &[b"c", b"a", b"b"]);
    let txn = env.begin_ro().unwrap();
    let mut cursor = txn.open_cursor(Database::main()).unwrap();

    // Next on a fresh cursor starts at the first entry
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0.as_bytes(), b"a");
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0.as_bytes(), b"b");
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0.as_bytes(), b"c");
    assert!(cursor.next(&txn).unwrap().is_none());
    assert!(cursor.eof());
    // Stepping back from the end returns the last entry again
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0.as_bytes(), b"c");
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0.as_bytes(), b"b");
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0.as_bytes(), b"a");
    assert!(cursor.prev(&txn).unwrap().is_none());
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0.as_bytes(), b"a");

    let mut back = txn.open_cursor(Database::main()).unwrap();
    assert_eq!(back.prev(&txn).unwrap().unwrap().0.as_bytes(), b"c");
}

#[test]
fn test_empty_table() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_ro().unwrap();
    let mut cursor = txn.open_cursor(Database::main()).unwrap();
    assert!(cursor.first(&txn).unwrap().is_none());
    assert!(cursor.last(&txn).unwrap().is_none());
    assert!(cursor.next(&txn).unwrap().is_none());
    assert!(cursor.eof());
    assert_eq!(cursor.iter(&txn).count(), 0);
    assert!(matches!(cursor.count(&txn), Err(Error::InvalidArgument)));
}

#[test]
fn test_seek_operations() {
    let (_dir, env) = setup_test_env();
    fill_main(&env, &[b"b", b"d", b"f"]);
    let txn = env.begin_ro().unwrap();
    let mut cursor = txn.open_cursor(Database::main()).unwrap();

    assert_eq!(
        pair(cursor.get(&txn, Some(b"d"), None, CursorOp::Set).unwrap()),
        kv(b"d", b"vd")
    );
    assert_eq!(
        pair(cursor.get(&txn, None, None, CursorOp::GetCurrent).unwrap()),
        kv(b"d", b"vd")
    );
    let range = cursor
        .get(&txn, Some(b"c"), None, CursorOp::SetRange)
        .unwrap()
        .unwrap();
    assert_eq!(range.key.as_bytes(), b"d");
    assert!(!range.exact);

    let lower = cursor
        .get(&txn, Some(b"f"), None, CursorOp::SetLowerBound)
        .unwrap()
        .unwrap();
    assert!(lower.exact);
    assert_eq!(lower.key.as_bytes(), b"f");

    // A missed seek leaves the cursor unpositioned
    assert!(cursor.get(&txn, Some(b"e"), None, CursorOp::Set).unwrap().is_none());
    assert!(cursor.eof());
    assert!(cursor
        .get(&txn, None, None, CursorOp::GetCurrent)
        .unwrap()
        .is_none());
    assert!(cursor.set_range(&txn, b"g").unwrap().is_none());

    assert_eq!(
        pair(cursor.get(&txn, Some(b"b"), Some(b"vb"), CursorOp::GetBoth).unwrap()),
        kv(b"b", b"vb")
    );
    assert!(cursor
        .get(&txn, Some(b"b"), Some(b"xx"), CursorOp::GetBoth)
        .unwrap()
        .is_none());
    assert!(matches!(
        cursor.get(&txn, None, None, CursorOp::Set),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn test_first_last_and_edges() {
    let (_dir, env) = setup_test_env();
    fill_main(&env, &[b"x", b"y", b"z"]);
    let txn = env.begin_ro().unwrap();
    let mut cursor = txn.open_cursor(Database::main()).unwrap();
    assert!(!cursor.on_first(&txn).unwrap());

    cursor.first(&txn).unwrap();
    assert!(cursor.on_first(&txn).unwrap());
    assert!(!cursor.on_last(&txn).unwrap());
    cursor.last(&txn).unwrap();
    assert!(cursor.on_last(&txn).unwrap());
    assert_eq!(cursor.count(&txn).unwrap(), 1);
}

#[test]
fn test_dup_navigation() {
    let (_dir, env) = setup_test_env();
    let db = fill_dups(&env);
    let txn = env.begin_ro().unwrap();
    let mut cursor = txn.open_cursor(db).unwrap();

    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::First).unwrap()), kv(b"a", b"1"));
    assert_eq!(cursor.count(&txn).unwrap(), 3);
    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::NextDup).unwrap()), kv(b"a", b"2"));
    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::LastDup).unwrap()), kv(b"a", b"3"));
    // No more values under "a"; the position stays put
    assert!(cursor.get(&txn, None, None, CursorOp::NextDup).unwrap().is_none());
    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::GetCurrent).unwrap()), kv(b"a", b"3"));
    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::FirstDup).unwrap()), kv(b"a", b"1"));

    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::NextNoDup).unwrap()), kv(b"b", b"1"));
    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::NextNoDup).unwrap()), kv(b"c", b"1"));
    assert!(cursor.get(&txn, None, None, CursorOp::NextNoDup).unwrap().is_none());

    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::Last).unwrap()), kv(b"c", b"2"));
    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::PrevDup).unwrap()), kv(b"c", b"1"));
    assert!(cursor.get(&txn, None, None, CursorOp::PrevDup).unwrap().is_none());
    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::PrevNoDup).unwrap()), kv(b"b", b"1"));
    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::PrevNoDup).unwrap()), kv(b"a", b"3"));

    assert_eq!(
        pair(cursor.get(&txn, Some(b"a"), Some(b"2"), CursorOp::GetBoth).unwrap()),
        kv(b"a", b"2")
    );
    let range = cursor
        .get(&txn, Some(b"c"), Some(b"15"), CursorOp::GetBothRange)
        .unwrap()
        .unwrap();
    assert_eq!((range.key.as_bytes(), range.data.as_bytes()), (&b"c"[..], &b"2"[..]));
    assert!(!range.exact);
    assert!(cursor
        .get(&txn, Some(b"b"), Some(b"5"), CursorOp::GetBothRange)
        .unwrap()
        .is_none());

    let lower = cursor
        .get(&txn, Some(b"a"), Some(b"25"), CursorOp::SetLowerBound)
        .unwrap()
        .unwrap();
    assert_eq!((lower.key.as_bytes(), lower.data.as_bytes()), (&b"a"[..], &b"3"[..]));
    assert!(!lower.exact);

    let values: Vec<Vec<u8>> = cursor
        .iter_dup_of(&txn, b"a")
        .map(|r| r.unwrap().1.to_vec())
        .collect();
    assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
}

#[test]
fn test_delete_moves_to_successor() {
    let (_dir, env) = setup_test_env();
    fill_main(&env, &[b"a", b"b", b"c"]);
    let mut txn = env.begin_rw().unwrap();
    let mut cursor = txn.open_cursor(Database::main()).unwrap();

    cursor.set(&txn, b"b").unwrap();
    cursor.delete(&mut txn, PutFlags::empty()).unwrap();
    // The next entry has not been returned yet
    assert_eq!(
        pair(cursor.get(&txn, None, None, CursorOp::GetCurrent).unwrap()),
        kv(b"c", b"vc")
    );
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0.as_bytes(), b"c");
    assert!(cursor.next(&txn).unwrap().is_none());

    // Deleting the last entry leaves the cursor at the end
    cursor.last(&txn).unwrap();
    cursor.delete(&mut txn, PutFlags::empty()).unwrap();
    assert!(cursor.next(&txn).unwrap().is_none());
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0.as_bytes(), b"a");

    cursor.delete(&mut txn, PutFlags::empty()).unwrap();
    assert!(cursor.first(&txn).unwrap().is_none());
    assert!(matches!(
        cursor.delete(&mut txn, PutFlags::empty()),
        Err(Error::InvalidArgument)
    ));
    txn.commit().unwrap();
    assert_eq!(env.stat().unwrap().entries, 0);
}

#[test]
fn test_delete_duplicates() {
    let (_dir, env) = setup_test_env();
    let db = fill_dups(&env);
    let mut txn = env.begin_rw().unwrap();
    let mut cursor = txn.open_cursor(db).unwrap();

    cursor.get(&txn, Some(b"a"), Some(b"2"), CursorOp::GetBoth).unwrap();
    cursor.delete(&mut txn, PutFlags::empty()).unwrap();
    assert_eq!(pair(cursor.get(&txn, None, None, CursorOp::NextDup).unwrap()), kv(b"a", b"3"));
    assert_eq!(cursor.count(&txn).unwrap(), 2);

    cursor.get(&txn, Some(b"c"), None, CursorOp::Set).unwrap();
    cursor.delete(&mut txn, PutFlags::ALLDUPS).unwrap();
    assert!(txn.get(db, b"c").unwrap().is_none());
    assert_eq!(txn.table_stat(db).unwrap().entries, 3);
    txn.commit().unwrap();
}

#[test]
fn test_cursor_put() {
    let (_dir, env) = setup_test_env();
    fill_main(&env, &[b"a", b"c"]);
    let mut txn = env.begin_rw().unwrap();
    let mut cursor = txn.open_cursor(Database::main()).unwrap();

    cursor.put(&mut txn, b"b", b"new", PutFlags::UPSERT).unwrap();
    assert_eq!(
        pair(cursor.get(&txn, None, None, CursorOp::GetCurrent).unwrap()),
        kv(b"b", b"new")
    );
    cursor.put(&mut txn, b"b", b"changed", PutFlags::CURRENT).unwrap();
    assert!(matches!(
        cursor.put(&mut txn, b"x", b"1", PutFlags::CURRENT),
        Err(Error::KeyMismatch)
    ));
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0.as_bytes(), b"c");
    assert_eq!(
        txn.get(Database::main(), b"b").unwrap().unwrap().as_bytes(),
        b"changed"
    );
    txn.commit().unwrap();
}

#[test]
fn test_cursor_follows_writes_through_transaction() {
    let (_dir, env) = setup_test_env();
    fill_main(&env, &[b"a", b"c", b"e"]);
    let mut txn = env.begin_rw().unwrap();
    let mut cursor = txn.open_cursor(Database::main()).unwrap();
    cursor.set(&txn, b"c").unwrap();

    // Writes made without the cursor
    txn.put(Database::main(), b"b", b"vb", PutFlags::UPSERT).unwrap();
    txn.put(Database::main(), b"d", b"vd", PutFlags::UPSERT).unwrap();
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0.as_bytes(), b"d");
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0.as_bytes(), b"c");
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0.as_bytes(), b"b");
}

#[test]
fn test_binding_rules() {
    let (_dir, env) = setup_test_env();
    fill_main(&env, &[b"k"]);
    let mut cursor = Cursor::new();
    assert!(cursor.db().is_none());
    {
        let txn = env.begin_ro().unwrap();
        assert!(matches!(cursor.first(&txn), Err(Error::InvalidArgument)));
        assert!(matches!(cursor.renew(&txn), Err(Error::InvalidArgument)));
        cursor.bind(&txn, Database::main()).unwrap();
        assert!(cursor.first(&txn).unwrap().is_some());
    }

    // Bound to an ended transaction
    let mut txn = env.begin_ro().unwrap();
    assert!(matches!(cursor.first(&txn), Err(Error::InvalidArgument)));
    cursor.renew(&txn).unwrap();
    assert_eq!(cursor.first(&txn).unwrap().unwrap().0.as_bytes(), b"k");

    // Renewing the transaction invalidates the binding too
    txn.renew().unwrap();
    assert!(matches!(cursor.next(&txn), Err(Error::InvalidArgument)));
    cursor.renew(&txn).unwrap();
    assert!(cursor.eof());

    let mut copy = Cursor::new();
    cursor.first(&txn).unwrap();
    cursor.copy_to(&mut copy);
    assert_eq!(copy.db(), Some(Database::main()));
    assert_eq!(
        pair(copy.get(&txn, None, None, CursorOp::GetCurrent).unwrap()),
        kv(b"k", b"vk")
    );
    copy.close();
}

#[test]
fn test_iterators() {
    let (_dir, env) = setup_test_env();
    let keys: Vec<Vec<u8>> = (0..300u32).map(|i| format!("key{:04}", i).into_bytes()).collect();
    {
        let mut txn = env.begin_rw().unwrap();
        for k in &keys {
            txn.put(Database::main(), k, k, PutFlags::UPSERT).unwrap();
        }
        txn.commit().unwrap();
    }
    let txn = env.begin_ro().unwrap();
    let mut cursor = txn.open_cursor(Database::main()).unwrap();

    let all: Vec<Vec<u8>> = cursor.iter(&txn).map(|r| r.unwrap().0.to_vec()).collect();
    assert_eq!(all, keys);

    let tail: Vec<Vec<u8>> = cursor
        .iter_from(&txn, b"key0250")
        .map(|r| r.unwrap().0.to_vec())
        .collect();
    assert_eq!(tail, keys[250..].to_vec());
    assert_eq!(cursor.iter_from(&txn, b"zzz").count(), 0);
}

#[test]
fn test_estimate_distance() {
    let (_dir, env) = setup_test_env();
    {
        let mut txn = env.begin_rw().unwrap();
        for i in 0..50u32 {
            txn.put(Database::main(), &i.to_be_bytes(), b"v", PutFlags::UPSERT)
                .unwrap();
        }
        txn.commit().unwrap();
    }
    let txn = env.begin_ro().unwrap();
    let mut a = txn.open_cursor(Database::main()).unwrap();
    let mut b = txn.open_cursor(Database::main()).unwrap();
    a.set(&txn, &10u32.to_be_bytes()).unwrap();
    b.set(&txn, &20u32.to_be_bytes()).unwrap();
    assert_eq!(a.estimate_distance(&txn, &mut b).unwrap(), 10);
    assert_eq!(b.estimate_distance(&txn, &mut a).unwrap(), -10);

    let mut unset = txn.open_cursor(Database::main()).unwrap();
    assert!(matches!(
        a.estimate_distance(&txn, &mut unset),
        Err(Error::InvalidArgument)
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_cursor_walks_in_key_order(
        keys in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..24), 1..300)
    ) {
        let (_dir, env) = setup_test_env();
        {
            let mut txn = env.begin_rw().unwrap();
            for k in &keys {
                txn.put(Database::main(), k, &[k.len() as u8], PutFlags::UPSERT).unwrap();
            }
            txn.commit().unwrap();
        }
        let mut expected = keys.clone();
        expected.sort();
        expected.dedup();

        let txn = env.begin_ro().unwrap();
        let mut cursor = txn.open_cursor(Database::main()).unwrap();
        let forward: Vec<Vec<u8>> = cursor.iter(&txn).map(|r| r.unwrap().0.to_vec()).collect();
        prop_assert_eq!(&forward, &expected);

        let mut backward = Vec::new();
        let mut entry = cursor.last(&txn).unwrap();
        while let Some((k, _)) = entry {
            backward.push(k.to_vec());
            entry = cursor.prev(&txn).unwrap();
        }
        backward.reverse();
        prop_assert_eq!(&backward, &expected);
        prop_assert_eq!(txn.table_stat(Database::main()).unwrap().entries, expected.len() as u64);
    }

    #[test]
    fn prop_deletes_keep_order(
        keys in proptest::collection::btree_set(any::<u16>(), 1..400),
        drop_every in 2usize..5
    ) {
        let (_dir, env) = setup_test_env();
        let keys: Vec<u16> = keys.into_iter().collect();
        let mut txn = env.begin_rw().unwrap();
        for k in &keys {
            txn.put(Database::main(), &k.to_be_bytes(), b"v", PutFlags::UPSERT).unwrap();
        }
        let mut kept = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            if i % drop_every == 0 {
                txn.delete(Database::main(), &k.to_be_bytes(), None).unwrap();
            } else {
                kept.push(k.to_be_bytes().to_vec());
            }
        }
        txn.commit().unwrap();

        let txn = env.begin_ro().unwrap();
        let mut cursor = txn.open_cursor(Database::main()).unwrap();
        let seen: Vec<Vec<u8>> = cursor.iter(&txn).map(|r| r.unwrap().0.to_vec()).collect();
        prop_assert_eq!(seen, kept);
    }
}
