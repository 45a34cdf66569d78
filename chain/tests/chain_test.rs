mod common;

use anyhow::Result;
use bitcoin::OutPoint;
use chain::{BlockStatus, ChainConfig, ChainDbOptions, ChainEntry, ChainError, ChainEvent};
use common::*;

#[tokio::test]
async fn mine_and_extend() -> Result<()> {
    let (_backend, chain) = regtest_chain().await;
    let genesis = chain.tip().await?;

    let block = mine_block(&genesis, Vec::new(), chain.params(), 0);
    let status = chain.add(block.clone()).await?;
    assert_eq!(status, BlockStatus::Connected);

    let tip = chain.tip().await?;
    assert_eq!(tip.hash, block.block_hash());
    assert_eq!(tip.height, 1);
    assert_eq!(tip.chainwork, genesis.chainwork.add(&tip.get_proof()));

    assert!(chain.db().is_main_chain(&tip.hash).await?);
    assert_eq!(
        chain.db().get_next_hash(&genesis.hash).await?,
        Some(tip.hash)
    );

    // Re-submitting the same block is a no-op.
    assert_eq!(chain.add(block).await?, BlockStatus::AlreadyKnown);
    Ok(())
}

#[tokio::test]
async fn competing_chains_reorg_and_side_chain_coins() -> Result<()> {
    let (_backend, chain) = regtest_chain().await;
    let genesis = chain.tip().await?;
    let params = chain.params().clone();

    // Two independent branches of equal length and difficulty.
    let x_blocks = mine_branch(&genesis, 10, &params, 1);
    let y_blocks = mine_branch(&genesis, 10, &params, 2);

    for block in &x_blocks {
        assert_eq!(chain.add(block.clone()).await?, BlockStatus::Connected);
    }
    for block in &y_blocks {
        assert_eq!(chain.add(block.clone()).await?, BlockStatus::SideChain);
    }

    // First seen wins the tie.
    let x_tip = x_blocks[9].block_hash();
    let y_tip = y_blocks[9].block_hash();
    assert_eq!(chain.tip().await?.hash, x_tip);
    assert!(chain.db().get_entry(&y_tip).await?.is_some());
    assert!(!chain.db().is_main_chain(&y_tip).await?);

    // One more block on Y forces a reorganization.
    let y9_entry = chain.db().get_entry(&y_tip).await?.unwrap();
    let y10 = mine_block(&y9_entry, Vec::new(), &params, 2);

    let mut events = chain.subscribe();
    let old_tip = chain.tip().await?;
    assert_eq!(chain.add(y10.clone()).await?, BlockStatus::Connected);

    let tip = chain.tip().await?;
    assert_eq!(tip.hash, y10.block_hash());
    assert_eq!(tip.height, 11);
    assert!(tip.chainwork > old_tip.chainwork);
    assert!(!chain.db().is_main_chain(&old_tip.hash).await?);

    // Ten disconnects, eleven connects, then the reorg notification.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.len(), 23);
    assert!(seen[..10]
        .iter()
        .all(|e| matches!(e, ChainEvent::Disconnect { .. })));
    assert!(seen[10..21]
        .iter()
        .all(|e| matches!(e, ChainEvent::Connect { .. })));
    match &seen[21] {
        ChainEvent::Reorg { old_tip: o, new_tip: n } => {
            assert_eq!(*o, old_tip.hash);
            assert_eq!(*n, tip.hash);
        }
        other => panic!("expected reorg event, got {other:?}"),
    }

    // A block spending a coinbase from the now-dead X branch is invalid.
    let x_coinbase = x_blocks[0].txdata[0].compute_txid();
    let bad_spend = spend(
        OutPoint {
            txid: x_coinbase,
            vout: 0,
        },
        49 * 100_000_000,
    );
    let bad_block = mine_block(&tip, vec![bad_spend], &params, 3);

    let err = chain.add(bad_block).await.unwrap_err();
    match err {
        ChainError::Verification(v) => assert_eq!(v.code, "bad-txns-inputs-missingorspent"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(chain.tip().await?.hash, tip.hash);
    Ok(())
}

#[tokio::test]
async fn orphan_blocks_resolve_on_parent_arrival() -> Result<()> {
    let (_backend, chain) = regtest_chain().await;
    let genesis = chain.tip().await?;
    let blocks = mine_branch(&genesis, 2, chain.params(), 0);

    // Child first: parked as an orphan.
    let child_hash = blocks[1].block_hash();
    assert_eq!(chain.add(blocks[1].clone()).await?, BlockStatus::Orphan);
    assert!(chain.has_orphan(&child_hash));
    assert_eq!(chain.height().await?, 0);

    // Parent arrival connects both.
    assert_eq!(chain.add(blocks[0].clone()).await?, BlockStatus::Connected);
    assert!(!chain.has_orphan(&child_hash));
    assert_eq!(chain.height().await?, 2);
    assert_eq!(chain.tip().await?.hash, child_hash);
    Ok(())
}

#[tokio::test]
async fn orphan_siblings_on_one_parent_both_survive() -> Result<()> {
    let (_backend, chain) = regtest_chain().await;
    let genesis = chain.tip().await?;
    let params = chain.params().clone();

    // Two competing children of a block the chain has not seen yet.
    let parent = mine_block(&genesis, Vec::new(), &params, 0);
    let parent_entry = ChainEntry::from_block_header(&parent.header, Some(&genesis));
    let child_a = mine_block(&parent_entry, Vec::new(), &params, 1);
    let child_b = mine_block(&parent_entry, Vec::new(), &params, 2);

    assert_eq!(chain.add(child_a.clone()).await?, BlockStatus::Orphan);
    assert_eq!(chain.add(child_b.clone()).await?, BlockStatus::Orphan);
    assert!(chain.has_orphan(&child_a.block_hash()));
    assert!(chain.has_orphan(&child_b.block_hash()));
    assert_eq!(chain.orphan_count(), 2);

    // The parent unblocks both: one extends the chain, the other is kept
    // as a competitor, neither is lost.
    assert_eq!(chain.add(parent).await?, BlockStatus::Connected);
    assert_eq!(chain.orphan_count(), 0);
    assert!(!chain.has_orphan(&child_a.block_hash()));
    assert!(!chain.has_orphan(&child_b.block_hash()));

    assert_eq!(chain.height().await?, 2);
    assert_eq!(chain.tip().await?.hash, child_a.block_hash());
    assert!(chain.db().get_entry(&child_b.block_hash()).await?.is_some());
    assert!(!chain.db().is_main_chain(&child_b.block_hash()).await?);
    Ok(())
}

#[tokio::test]
async fn utxo_set_survives_connect_disconnect_round_trip() -> Result<()> {
    let (backend, chain) = regtest_chain().await;
    let genesis = chain.tip().await?;
    let params = chain.params().clone();

    let coins_before = snapshot(&backend, b'c');
    let heights_before = snapshot(&backend, b'H');

    // Three blocks, the second spending the first block's coinbase.
    let b1 = mine_block(&genesis, Vec::new(), &params, 0);
    chain.add(b1.clone()).await?;

    let b1_entry = chain.tip().await?;
    let tx = spend(
        OutPoint {
            txid: b1.txdata[0].compute_txid(),
            vout: 0,
        },
        49 * 100_000_000,
    );
    let b2 = mine_block(&b1_entry, vec![tx], &params, 0);
    chain.add(b2).await?;

    let b2_entry = chain.tip().await?;
    let b3 = mine_block(&b2_entry, Vec::new(), &params, 0);
    chain.add(b3).await?;

    assert_ne!(snapshot(&backend, b'c'), coins_before);

    // Unwind everything through the database layer.
    for _ in 0..3 {
        let tip = chain.db().tip().await?;
        chain.db().disconnect(&tip).await?;
    }

    assert_eq!(chain.db().tip().await?.hash, genesis.hash);
    assert_eq!(snapshot(&backend, b'c'), coins_before);
    assert_eq!(snapshot(&backend, b'H'), heights_before);
    Ok(())
}

#[tokio::test]
async fn reorg_is_idempotent() -> Result<()> {
    // Connecting branch A, switching to B, then switching back must match
    // a chain that only ever saw A.
    let (backend_a, chain_a) = regtest_chain().await;
    let (backend_b, chain_b) = regtest_chain().await;
    let genesis = chain_a.tip().await?;
    let params = chain_a.params().clone();

    let branch_a = mine_branch(&genesis, 4, &params, 1);
    let branch_b = mine_branch(&genesis, 3, &params, 2);

    // Reference: A alone.
    for block in &branch_a {
        chain_a.add(block.clone()).await?;
    }

    // Subject: A[..2], reorg to B, then back to A.
    for block in &branch_a[..2] {
        assert_eq!(chain_b.add(block.clone()).await?, BlockStatus::Connected);
    }
    for block in &branch_b {
        chain_b.add(block.clone()).await?;
    }
    assert_eq!(chain_b.tip().await?.hash, branch_b[2].block_hash());

    for block in &branch_a[2..] {
        chain_b.add(block.clone()).await?;
    }

    assert_eq!(chain_b.tip().await?.hash, branch_a[3].block_hash());
    assert_eq!(
        chain_a.tip().await?.chainwork,
        chain_b.tip().await?.chainwork
    );
    assert_eq!(snapshot(&backend_a, b'c'), snapshot(&backend_b, b'c'));
    assert_eq!(snapshot(&backend_a, b'H'), snapshot(&backend_b, b'H'));
    assert_eq!(snapshot(&backend_a, b'n'), snapshot(&backend_b, b'n'));
    Ok(())
}

#[tokio::test]
async fn main_chain_is_unique_and_work_monotonic() -> Result<()> {
    let (backend, chain) = regtest_chain().await;
    let genesis = chain.tip().await?;
    let blocks = mine_branch(&genesis, 5, chain.params(), 0);
    for block in &blocks {
        chain.add(block.clone()).await?;
    }

    // Exactly one hash per height, linked by next pointers.
    let heights = snapshot(&backend, b'H');
    assert_eq!(heights.len(), 6);

    let mut last_work = None;
    for height in 0..=5u32 {
        let entry = chain.db().get_entry_by_height(height).await?.unwrap();
        assert!(chain.db().is_main_chain(&entry.hash).await?);

        if let Some(previous) = last_work.take() {
            assert!(entry.chainwork > previous);
        }
        last_work = Some(entry.chainwork.clone());

        if height < 5 {
            let next = chain.db().get_next_hash(&entry.hash).await?.unwrap();
            let above = chain.db().get_entry_by_height(height + 1).await?.unwrap();
            assert_eq!(next, above.hash);
        }
    }

    // The tip holds the maximum stored chainwork.
    let tip = chain.tip().await?;
    for (_, raw) in snapshot(&backend, b'e') {
        let entry = ChainEntry::decode(&raw)?;
        assert!(entry.chainwork <= tip.chainwork);
    }
    Ok(())
}

#[tokio::test]
async fn pruning_drops_old_block_bodies() -> Result<()> {
    let config = ChainConfig {
        db: ChainDbOptions {
            prune: true,
            keep_blocks: 2,
            prune_after_height: 1,
            ..ChainDbOptions::default()
        },
        ..ChainConfig::default()
    };
    let (_backend, chain) = regtest_chain_with(config).await;
    let genesis = chain.tip().await?;
    let blocks = mine_branch(&genesis, 6, chain.params(), 0);
    for block in &blocks {
        chain.add(block.clone()).await?;
    }

    // Height 1 was queued at 1 + keep_blocks and pruned when height 3
    // connected; recent blocks survive.
    let pruned = blocks[0].block_hash();
    assert!(chain.db().get_block(&pruned).await?.is_none());
    assert!(chain.db().get_entry(&pruned).await?.is_some());
    assert!(chain
        .db()
        .get_block(&blocks[5].block_hash())
        .await?
        .is_some());
    Ok(())
}

#[tokio::test]
async fn sled_store_persists_across_reopen() -> Result<()> {
    use chain::{Chain, NetworkParams};
    use std::sync::Arc;
    use storage::SledBackend;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("chain");
    let mut params = NetworkParams::regtest();
    params.coinbase_maturity = 0;

    let tip = {
        let backend = Arc::new(SledBackend::open(&path)?);
        let chain = Chain::open(backend, params.clone(), ChainConfig::default()).await?;
        let genesis = chain.tip().await?;
        for block in mine_branch(&genesis, 3, &params, 0) {
            chain.add(block).await?;
        }
        chain.tip().await?.hash
    };

    let backend = Arc::new(SledBackend::open(&path)?);
    let chain = Chain::open(backend, params, ChainConfig::default()).await?;
    assert_eq!(chain.height().await?, 3);
    assert_eq!(chain.tip().await?.hash, tip);
    Ok(())
}

#[tokio::test]
async fn locator_steps_back_exponentially() -> Result<()> {
    let (_backend, chain) = regtest_chain().await;
    let genesis = chain.tip().await?;
    let blocks = mine_branch(&genesis, 40, chain.params(), 0);
    for block in &blocks {
        chain.add(block.clone()).await?;
    }

    let locator = chain.get_locator().await?;
    assert_eq!(locator[0], chain.tip().await?.hash);
    assert_eq!(*locator.last().unwrap(), genesis.hash);
    // Dense prefix, then doubling gaps: far fewer than 41 hashes.
    assert!(locator.len() < 20);
    Ok(())
}
