//! # Destruction and Reverse-Diff Accounting
//!
//! Destroyed contracts must leave an exact trail: their pre-block account
//! record, every wiped storage slot, and node deletions for the
//! path-addressed store. Hash-addressed stores skip the wipe.

#[cfg(test)]
mod tests {
    use pl_state_db::adapters::InMemoryStateDatabase;
    use pl_state_db::domain::entities::{encode_slot_value, hash_address, hash_slot, StateAccount};
    use pl_state_db::ports::{AccountSnapshot, Database, SnapshotTree, TrieScheme};
    use pl_state_db::{Address, ListenerRegistry, StateDb};
    use primitive_types::{H160, H256, U256};
    use std::sync::Arc;

    fn addr(v: u8) -> Address {
        H160::repeat_byte(v)
    }

    fn contract_genesis() -> (Arc<InMemoryStateDatabase>, H256) {
        InMemoryStateDatabase::with_genesis(vec![(
            addr(0xC0),
            StateAccount::new(U256::from(500)),
            vec![
                (H256::repeat_byte(1), H256::repeat_byte(0x11)),
                (H256::repeat_byte(2), H256::repeat_byte(0x22)),
            ],
        )])
    }

    fn destroy_and_commit(db: Arc<InMemoryStateDatabase>, root: H256, with_snaps: bool) -> H256 {
        let snaps = if with_snaps {
            Some(db.snapshot_tree(root).unwrap() as Arc<dyn SnapshotTree>)
        } else {
            None
        };
        let mut state = StateDb::new(root, db, snaps, ListenerRegistry::new()).unwrap();
        state.self_destruct(addr(0xC0)).unwrap();
        state.finalise(true);
        state.commit(1, true).unwrap()
    }

    fn assert_wipe_recorded(db: &InMemoryStateDatabase, genesis_root: H256) {
        let commits = db.trie_backend().commits();
        assert_eq!(commits.len(), 1);
        let record = &commits[0];

        let contract_before = db
            .open_trie(genesis_root)
            .unwrap()
            .get_account(&addr(0xC0))
            .unwrap()
            .unwrap();
        assert_eq!(
            record.account_origins.get(&addr(0xC0)),
            Some(&Some(contract_before.slim_rlp()))
        );

        let slots = record.storage_origins.get(&addr(0xC0)).unwrap();
        assert_eq!(
            slots.get(&hash_slot(&H256::repeat_byte(1))),
            Some(&Some(encode_slot_value(&H256::repeat_byte(0x11))))
        );
        assert_eq!(
            slots.get(&hash_slot(&H256::repeat_byte(2))),
            Some(&Some(encode_slot_value(&H256::repeat_byte(0x22))))
        );
        assert!(record.deleted_nodes >= 2);
        assert!(record.incomplete.is_empty());
    }

    #[test]
    fn test_fast_path_wipe_records_origins() {
        let (db, root) = contract_genesis();
        let committed = destroy_and_commit(db.clone(), root, true);
        assert_ne!(committed, root);
        assert_wipe_recorded(&db, root);

        // The account is gone from the committed state.
        let trie = db.open_trie(committed).unwrap();
        assert_eq!(trie.get_account(&addr(0xC0)).unwrap(), None);
    }

    #[test]
    fn test_slow_path_wipe_matches_fast_path() {
        let (db, root) = contract_genesis();
        destroy_and_commit(db.clone(), root, false);
        assert_wipe_recorded(&db, root);
    }

    #[test]
    fn test_destroyed_account_leaves_snapshot() {
        let (db, root) = contract_genesis();
        let tree = db.snapshot_tree(root).unwrap();
        let mut state = StateDb::new(
            root,
            db.clone(),
            Some(tree.clone() as Arc<dyn SnapshotTree>),
            ListenerRegistry::new(),
        )
        .unwrap();
        state.self_destruct(addr(0xC0)).unwrap();
        state.finalise(true);
        let committed = state.commit(1, true).unwrap();

        let snap = tree.snapshot(committed).unwrap();
        assert_eq!(snap.account(hash_address(&addr(0xC0))).unwrap(), None);
    }

    #[test]
    fn test_hash_scheme_skips_storage_wipe() {
        let db = InMemoryStateDatabase::with_scheme(TrieScheme::Hash);
        // Seed manually through a first block so the scheme stays attached.
        let mut seed = StateDb::new(
            pl_state_db::domain::entities::EMPTY_ROOT_HASH,
            db.clone(),
            None,
            ListenerRegistry::new(),
        )
        .unwrap();
        seed.add_balance(addr(0xC0), U256::from(500)).unwrap();
        seed.set_state(addr(0xC0), H256::repeat_byte(1), H256::repeat_byte(0x11))
            .unwrap();
        seed.finalise(true);
        let root = seed.commit(1, true).unwrap();

        let mut state = StateDb::new(root, db.clone(), None, ListenerRegistry::new()).unwrap();
        state.self_destruct(addr(0xC0)).unwrap();
        state.finalise(true);
        state.commit(2, true).unwrap();

        let commits = db.trie_backend().commits();
        let record = commits.last().unwrap();
        // Destruction processing is skipped wholesale: no account origin,
        // no storage origin, no incomplete entry.
        assert_eq!(record.account_origins.get(&addr(0xC0)), None);
        assert!(record.storage_origins.get(&addr(0xC0)).is_none());
        assert!(record.incomplete.is_empty());
    }

    #[test]
    fn test_over_budget_wipe_marks_incomplete() {
        let (db, root) = contract_genesis();
        let snaps = db.snapshot_tree(root).unwrap();
        let mut state = StateDb::new(
            root,
            db.clone(),
            Some(snaps as Arc<dyn SnapshotTree>),
            ListenerRegistry::new(),
        )
        .unwrap();
        // The first iterated slot already exceeds this.
        state.set_storage_delete_limit(16);
        state.self_destruct(addr(0xC0)).unwrap();
        state.finalise(true);
        state.commit(1, true).unwrap();

        let commits = db.trie_backend().commits();
        let record = commits.last().unwrap();
        assert!(record.incomplete.contains(&addr(0xC0)));
        // The untrustworthy storage origin is withheld; the account origin
        // survives.
        assert!(record.storage_origins.get(&addr(0xC0)).is_none());
        assert!(matches!(
            record.account_origins.get(&addr(0xC0)),
            Some(Some(_))
        ));
    }

    #[test]
    fn test_recreate_in_same_tx_keeps_predestruct_origin() {
        let seeded = StateAccount::new(U256::from(100)).with_nonce(1);
        let (db, root) =
            InMemoryStateDatabase::with_genesis(vec![(addr(0xC1), seeded.clone(), vec![])]);
        let mut state = StateDb::new(root, db.clone(), None, ListenerRegistry::new()).unwrap();

        // Destroy and re-create within one transaction.
        state.self_destruct(addr(0xC1)).unwrap();
        state.create_account(addr(0xC1)).unwrap();
        state.finalise(true);

        // The new incarnation starts from nothing.
        assert_eq!(state.get_balance(addr(0xC1)).unwrap(), U256::zero());
        assert_eq!(state.get_nonce(addr(0xC1)).unwrap(), 0);

        state.commit(1, true).unwrap();
        let commits = db.trie_backend().commits();
        let record = commits.last().unwrap();
        // The destruct marker held the pre-destruct record, not the
        // re-created one.
        assert_eq!(
            record.account_origins.get(&addr(0xC1)),
            Some(&Some(seeded.slim_rlp()))
        );
    }

    #[test]
    fn test_resurrected_account_origin_is_nonexistence() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let mut state = StateDb::new(root, db.clone(), None, ListenerRegistry::new()).unwrap();
        let phoenix = addr(0xD0);

        state.add_balance(phoenix, U256::from(5)).unwrap();
        state.self_destruct(phoenix).unwrap();
        state.finalise(true);

        state.set_tx_context(1);
        state.add_balance(phoenix, U256::from(7)).unwrap();
        state.finalise(true);
        let committed = state.commit(1, true).unwrap();

        let commits = db.trie_backend().commits();
        let record = commits.last().unwrap();
        assert_eq!(record.account_origins.get(&phoenix), Some(&None));

        let mut reopened =
            StateDb::new(committed, db, None, ListenerRegistry::new()).unwrap();
        assert_eq!(reopened.get_balance(phoenix).unwrap(), U256::from(7));
    }

    #[test]
    fn test_destroyed_without_resurrection_leaves_no_account_origin() {
        let (db, root) = InMemoryStateDatabase::with_genesis(vec![]);
        let mut state = StateDb::new(root, db.clone(), None, ListenerRegistry::new()).unwrap();
        let ghost = addr(0xD1);

        // Created and destroyed within the block, never resurrected.
        state.add_balance(ghost, U256::from(5)).unwrap();
        state.self_destruct(ghost).unwrap();
        state.finalise(true);
        // Another account keeps the block from being a no-op.
        state.set_tx_context(1);
        state.add_balance(addr(0xD2), U256::from(1)).unwrap();
        state.finalise(true);
        state.commit(1, true).unwrap();

        let commits = db.trie_backend().commits();
        let record = commits.last().unwrap();
        assert_eq!(record.account_origins.get(&ghost), None);
    }
}
