//! # State Lifecycle Integration
//!
//! Full-block flows through the state manager: journaled mutation,
//! transaction finalisation, intermediate roots, and the terminal commit
//! with listener notification and reverse-diff recording.

#[cfg(test)]
mod tests {
    use pl_state_db::adapters::InMemoryStateDatabase;
    use pl_state_db::domain::entities::{
        encode_slot_value, hash_address, hash_slot, StateAccount, EMPTY_ROOT_HASH,
    };
    use pl_state_db::ports::{Database, SnapshotTree};
    use pl_state_db::{
        Address, ListenerRegistry, StateDb, StateError, StateUpdateListener, StateUpdatePayload,
    };
    use primitive_types::{H160, H256, U256};
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn addr(v: u8) -> Address {
        H160::repeat_byte(v)
    }

    /// Captures every payload delivered to it.
    #[derive(Default)]
    struct RecordingListener {
        payloads: Mutex<Vec<StateUpdatePayload>>,
    }

    impl StateUpdateListener for RecordingListener {
        fn on_state_update(&self, payload: &StateUpdatePayload) {
            self.payloads.lock().unwrap().push(payload.clone());
        }
    }

    fn genesis() -> (Arc<InMemoryStateDatabase>, H256) {
        InMemoryStateDatabase::with_genesis(vec![(
            addr(0xA1),
            StateAccount::new(U256::from(1000)),
            vec![(H256::repeat_byte(1), H256::repeat_byte(0x11))],
        )])
    }

    #[test]
    fn test_full_block_lifecycle() {
        init_tracing();
        let (db, root) = genesis();
        let tree = db.snapshot_tree(root).unwrap();
        let listener = Arc::new(RecordingListener::default());
        let mut registry = ListenerRegistry::new();
        registry.register(Arc::clone(&listener) as Arc<dyn StateUpdateListener>);

        let mut state = StateDb::new(root, db.clone(), Some(tree.clone()), registry).unwrap();

        let payer = addr(0xA1);
        let payee = addr(0xB2);
        let slot = H256::repeat_byte(1);

        state.sub_balance(payer, U256::from(100)).unwrap();
        state.add_balance(payee, U256::from(100)).unwrap();
        state.set_state(payer, slot, H256::repeat_byte(0x22)).unwrap();
        state
            .set_state(payer, H256::repeat_byte(2), H256::repeat_byte(0x33))
            .unwrap();
        state.finalise(true);

        let first = state.intermediate_root(true);
        let second = state.intermediate_root(true);
        assert_eq!(first, second);

        let committed = state.commit(1, true).unwrap();
        assert_eq!(committed, first);

        // Listener saw exactly one update describing the block.
        let payloads = listener.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        let payload = &payloads[0];
        assert_eq!(payload.block, 1);
        assert_eq!(payload.root, committed);
        assert_eq!(payload.parent, root);
        assert!(payload.accounts.contains_key(&hash_address(&payer)));
        assert!(payload.accounts.contains_key(&hash_address(&payee)));

        // The snapshot tree gained a layer at the committed root.
        assert!(tree.snapshot(committed).is_some());

        // The reverse diff carries pre-block values, with created accounts
        // marked as previously nonexistent.
        let commits = db.trie_backend().commits();
        assert_eq!(commits.len(), 1);
        let record = &commits[0];
        assert_eq!(record.parent, root);
        let payer_before = db
            .open_trie(root)
            .unwrap()
            .get_account(&payer)
            .unwrap()
            .unwrap();
        assert_eq!(
            record.account_origins.get(&payer),
            Some(&Some(payer_before.slim_rlp()))
        );
        assert_eq!(record.account_origins.get(&payee), Some(&None));
        let payer_slots = record.storage_origins.get(&payer).unwrap();
        assert_eq!(
            payer_slots.get(&hash_slot(&slot)),
            Some(&Some(encode_slot_value(&H256::repeat_byte(0x11))))
        );
        assert_eq!(payer_slots.get(&hash_slot(&H256::repeat_byte(2))), Some(&None));
    }

    #[test]
    fn test_committed_state_reopens_at_new_root() {
        let (db, root) = genesis();
        let mut state =
            StateDb::new(root, db.clone(), None, ListenerRegistry::new()).unwrap();
        state.sub_balance(addr(0xA1), U256::from(250)).unwrap();
        state
            .set_state(addr(0xA1), H256::repeat_byte(1), H256::repeat_byte(0x44))
            .unwrap();
        state.finalise(true);
        let committed = state.commit(1, true).unwrap();

        let mut reopened =
            StateDb::new(committed, db, None, ListenerRegistry::new()).unwrap();
        assert_eq!(
            reopened.get_balance(addr(0xA1)).unwrap(),
            U256::from(750)
        );
        assert_eq!(
            reopened
                .get_state(addr(0xA1), H256::repeat_byte(1))
                .unwrap(),
            H256::repeat_byte(0x44)
        );
    }

    #[test]
    fn test_commit_is_terminal() {
        let (db, root) = genesis();
        let mut state = StateDb::new(root, db, None, ListenerRegistry::new()).unwrap();
        state.add_balance(addr(0xB2), U256::from(1)).unwrap();
        state.finalise(true);
        let committed = state.commit(1, true).unwrap();
        assert_ne!(committed, root);
        assert!(matches!(
            state.commit(2, true),
            Err(StateError::CommitTerminated)
        ));
    }

    #[test]
    fn test_unchanged_block_keeps_root() {
        let (db, root) = genesis();
        let mut state = StateDb::new(root, db.clone(), None, ListenerRegistry::new()).unwrap();
        // Writing a slot back to its current value is a no-op.
        let mut reader =
            StateDb::new(root, db.clone(), None, ListenerRegistry::new()).unwrap();
        let current = reader
            .get_state(addr(0xA1), H256::repeat_byte(1))
            .unwrap();
        state
            .set_state(addr(0xA1), H256::repeat_byte(1), current)
            .unwrap();
        state.finalise(true);
        let committed = state.commit(1, true).unwrap();
        assert_eq!(committed, root);
        // No reverse diff is persisted for an unchanged root.
        assert!(db.trie_backend().commits().is_empty());
    }

    #[test]
    fn test_unchanged_block_skips_notification() {
        let (db, root) = genesis();
        let listener = Arc::new(RecordingListener::default());
        let mut registry = ListenerRegistry::new();
        registry.register(Arc::clone(&listener) as Arc<dyn StateUpdateListener>);

        let mut reader =
            StateDb::new(root, db.clone(), None, ListenerRegistry::new()).unwrap();
        let current = reader
            .get_state(addr(0xA1), H256::repeat_byte(1))
            .unwrap();

        let tree = db.snapshot_tree(root).unwrap();
        let mut state = StateDb::new(root, db, Some(tree), registry).unwrap();
        state
            .set_state(addr(0xA1), H256::repeat_byte(1), current)
            .unwrap();
        state.finalise(true);
        let committed = state.commit(1, true).unwrap();
        assert_eq!(committed, root);
        // Listeners only hear about blocks that moved the root.
        assert!(listener.payloads.lock().unwrap().is_empty());
    }

    #[test]
    fn test_storage_revert_restores_committed_value() {
        let (db, root) = genesis();
        let mut state = StateDb::new(root, db, None, ListenerRegistry::new()).unwrap();
        let slot = H256::repeat_byte(1);

        let snap = state.snapshot();
        state
            .set_state(addr(0xA1), slot, H256::repeat_byte(0x99))
            .unwrap();
        assert_eq!(
            state.get_state(addr(0xA1), slot).unwrap(),
            H256::repeat_byte(0x99)
        );
        state.revert_to_snapshot(snap);
        assert_eq!(
            state.get_state(addr(0xA1), slot).unwrap(),
            H256::repeat_byte(0x11)
        );
    }

    #[test]
    fn test_pending_storage_survives_later_revert() {
        let (db, root) = genesis();
        let mut state = StateDb::new(root, db, None, ListenerRegistry::new()).unwrap();
        let slot = H256::repeat_byte(1);

        state
            .set_state(addr(0xA1), slot, H256::repeat_byte(0x55))
            .unwrap();
        state.finalise(true);

        state.set_tx_context(1);
        let snap = state.snapshot();
        state
            .set_state(addr(0xA1), slot, H256::repeat_byte(0x66))
            .unwrap();
        state.revert_to_snapshot(snap);

        // The revert unwinds only the second transaction's write.
        assert_eq!(
            state.get_state(addr(0xA1), slot).unwrap(),
            H256::repeat_byte(0x55)
        );
    }

    #[test]
    fn test_empty_genesis_commits_from_empty_root() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        assert_eq!(root, EMPTY_ROOT_HASH);
        let mut state = StateDb::new(root, db, None, ListenerRegistry::new()).unwrap();
        state.add_balance(addr(1), U256::from(9)).unwrap();
        state.finalise(true);
        let committed = state.commit(1, true).unwrap();
        assert_ne!(committed, EMPTY_ROOT_HASH);
    }

    proptest! {
        /// A snapshot/revert bracket is exact: whatever happens inside the
        /// bracket, reverting restores the balance observed at the snapshot.
        #[test]
        fn prop_revert_bracket_restores_balance(
            before in proptest::collection::vec(1u64..1_000, 0..8),
            inside in proptest::collection::vec(1u64..1_000, 1..8),
        ) {
            let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
            let mut state = StateDb::new(root, db, None, ListenerRegistry::new()).unwrap();
            let account = addr(0x77);
            for amount in before {
                state.add_balance(account, U256::from(amount)).unwrap();
            }
            let observed = state.get_balance(account).unwrap();
            let snap = state.snapshot();
            for (i, amount) in inside.iter().enumerate() {
                if i % 2 == 0 {
                    state.add_balance(account, U256::from(*amount)).unwrap();
                } else {
                    state.sub_balance(account, U256::from(*amount)).unwrap();
                }
            }
            state.revert_to_snapshot(snap);
            prop_assert_eq!(state.get_balance(account).unwrap(), observed);
        }
    }
}
