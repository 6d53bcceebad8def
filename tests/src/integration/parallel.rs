//! # Optimistic Parallel Execution
//!
//! Transactions of one block execute against independent state managers
//! sharing a multi-version map. These tests drive the scheduler-facing
//! surface directly: dependency aborts, write-set flushing, read-set
//! validation, estimate demotion, and sequential replay of write sets.

#[cfg(test)]
mod tests {
    use pl_state_db::adapters::InMemoryStateDatabase;
    use pl_state_db::domain::mvcc::ReadResult;
    use pl_state_db::{
        Address, ListenerRegistry, MultiVersionMap, StateDb, Subpath, VersionedKey,
    };
    use primitive_types::{H160, H256, U256};
    use std::sync::Arc;

    fn addr(v: u8) -> Address {
        H160::repeat_byte(v)
    }

    fn executor(
        db: &Arc<InMemoryStateDatabase>,
        root: H256,
        map: &Arc<MultiVersionMap>,
        tx_index: usize,
    ) -> StateDb {
        let mut state = StateDb::new(root, db.clone(), None, ListenerRegistry::new()).unwrap();
        state.set_mv_hashmap(Arc::clone(map));
        state.set_tx_context(tx_index);
        state
    }

    #[test]
    fn test_unflushed_write_aborts_reader() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let map = Arc::new(MultiVersionMap::new());
        let mut tx0 = executor(&db, root, &map, 0);
        let mut tx1 = executor(&db, root, &map, 1);

        tx0.set_balance(addr(1), U256::from(100)).unwrap();

        let abort = tx1.get_balance(addr(1)).unwrap_err();
        assert_eq!(abort.dep_tx_index, 0);
        assert_eq!(tx1.dep_tx_index(), Some(0));

        tx0.flush_mv_write_set();
        tx1.set_incarnation(1);
        assert_eq!(tx1.get_balance(addr(1)).unwrap(), U256::from(100));
    }

    #[test]
    fn test_lower_index_never_sees_higher_write() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let map = Arc::new(MultiVersionMap::new());
        let mut tx0 = executor(&db, root, &map, 0);
        let mut tx2 = executor(&db, root, &map, 2);

        tx2.set_nonce(addr(1), 9).unwrap();
        tx2.flush_mv_write_set();

        // The write at index 2 is invisible below and at its own index.
        assert_eq!(tx0.get_nonce(addr(1)).unwrap(), 0);
        let mut tx2_again = executor(&db, root, &map, 2);
        assert_eq!(tx2_again.get_nonce(addr(1)).unwrap(), 0);
    }

    #[test]
    fn test_own_writes_read_locally() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let map = Arc::new(MultiVersionMap::new());
        let mut tx0 = executor(&db, root, &map, 0);

        tx0.set_balance(addr(1), U256::from(42)).unwrap();
        // Reading back an own unflushed write must not abort.
        assert_eq!(tx0.get_balance(addr(1)).unwrap(), U256::from(42));
    }

    #[test]
    fn test_validation_detects_late_writer() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let map = Arc::new(MultiVersionMap::new());
        let mut tx0 = executor(&db, root, &map, 0);
        let mut tx1 = executor(&db, root, &map, 1);

        // tx1 reads before tx0 has written anything.
        assert_eq!(tx1.get_balance(addr(1)).unwrap(), U256::zero());
        assert!(map.validate_read_set(&tx1.mv_read_list(), 1));

        tx0.set_balance(addr(1), U256::from(100)).unwrap();
        tx0.flush_mv_write_set();

        // The earlier storage read is now stale.
        assert!(!map.validate_read_set(&tx1.mv_read_list(), 1));

        // A re-execution that observes the flushed write validates.
        let mut tx1_retry = executor(&db, root, &map, 1);
        tx1_retry.set_incarnation(1);
        assert_eq!(tx1_retry.get_balance(addr(1)).unwrap(), U256::from(100));
        assert!(map.validate_read_set(&tx1_retry.mv_read_list(), 1));
    }

    #[test]
    fn test_mark_estimates_demotes_flushed_writes() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let map = Arc::new(MultiVersionMap::new());
        let mut tx0 = executor(&db, root, &map, 0);
        let mut tx1 = executor(&db, root, &map, 1);

        tx0.set_balance(addr(1), U256::from(100)).unwrap();
        tx0.flush_mv_write_set();
        assert!(tx1.get_balance(addr(1)).is_ok());

        let keys: Vec<VersionedKey> = tx0
            .mv_full_write_list()
            .iter()
            .map(|w| w.path)
            .collect();
        map.mark_estimates(&keys, 0);

        let mut tx1_retry = executor(&db, root, &map, 1);
        let abort = tx1_retry.get_balance(addr(1)).unwrap_err();
        assert_eq!(abort.dep_tx_index, 0);
    }

    #[test]
    fn test_reverted_writes_leave_no_trace() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let map = Arc::new(MultiVersionMap::new());
        let mut tx0 = executor(&db, root, &map, 0);

        let snap = tx0.snapshot();
        tx0.set_nonce(addr(1), 5).unwrap();
        tx0.revert_to_snapshot(snap);

        // The reverted key is excluded from the publishable write list but
        // still visible in the full list for estimate cleanup.
        let nonce_key = VersionedKey::subpath_key(addr(1), Subpath::Nonce);
        assert!(tx0.mv_write_list().iter().all(|w| w.path != nonce_key));
        assert!(tx0.mv_full_write_list().iter().any(|w| w.path == nonce_key));

        // Readers fall through to storage instead of blocking on it.
        assert!(matches!(map.read(&nonce_key, 1), ReadResult::None));
    }

    #[test]
    fn test_write_sets_replay_sequentially() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let map = Arc::new(MultiVersionMap::new());
        let slot = H256::repeat_byte(7);

        let mut tx0 = executor(&db, root, &map, 0);
        tx0.set_balance(addr(1), U256::from(100)).unwrap();
        tx0.set_state(addr(1), slot, H256::repeat_byte(0xAA)).unwrap();
        tx0.flush_mv_write_set();

        let mut tx1 = executor(&db, root, &map, 1);
        tx1.set_incarnation(0);
        tx1.set_nonce(addr(2), 3).unwrap();
        tx1.flush_mv_write_set();

        // Fold both write sets, in order, into a plain sequential manager.
        let mut folded = StateDb::new(root, db, None, ListenerRegistry::new()).unwrap();
        folded.apply_mv_write_set(&tx0.mv_write_list()).unwrap();
        folded.apply_mv_write_set(&tx1.mv_write_list()).unwrap();

        assert_eq!(folded.get_balance(addr(1)).unwrap(), U256::from(100));
        assert_eq!(folded.get_state(addr(1), slot).unwrap(), H256::repeat_byte(0xAA));
        assert_eq!(folded.get_nonce(addr(2)).unwrap(), 3);
    }

    #[test]
    fn test_self_destruct_propagates_through_write_set() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let map = Arc::new(MultiVersionMap::new());

        let mut tx0 = executor(&db, root, &map, 0);
        tx0.set_balance(addr(1), U256::from(100)).unwrap();
        tx0.self_destruct(addr(1)).unwrap();
        tx0.flush_mv_write_set();

        let mut tx1 = executor(&db, root, &map, 1);
        assert!(tx1.has_self_destructed(addr(1)).unwrap());
        assert_eq!(tx1.get_balance(addr(1)).unwrap(), U256::zero());
    }
}
