mod common;

use anyhow::Result;
use bitcoin::{Block, OutPoint};
use chain::{Chain, ChainError};
use common::*;
use mempool::{Mempool, MempoolEvent, MempoolOptions, TxStatus};
use std::sync::Arc;
use storage::MemoryBackend;

const COIN: u64 = 100_000_000;

fn opts() -> MempoolOptions {
    MempoolOptions {
        // Test outputs are bare OP_TRUE scripts.
        require_standard: false,
        ..MempoolOptions::default()
    }
}

/// Regtest chain with `n` mined blocks and a pool on top of it.
async fn setup(
    n: usize,
    options: MempoolOptions,
) -> Result<(Arc<MemoryBackend>, Chain, Mempool, Vec<Block>)> {
    let (backend, chain) = regtest_chain().await;
    let params = chain.params().clone();

    let mut blocks = Vec::with_capacity(n);
    let mut prev = chain.tip().await?;
    for _ in 0..n {
        let block = mine_block(&prev, Vec::new(), &params, 0);
        chain.add(block.clone()).await?;
        prev = chain.tip().await?;
        blocks.push(block);
    }

    let mempool = Mempool::new(chain.db().clone(), options).await?;
    Ok((backend, chain, mempool, blocks))
}

fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint {
        txid: block.txdata[0].compute_txid(),
        vout: 0,
    }
}

fn kind(err: &ChainError) -> &str {
    err.verification().map(|v| v.kind).unwrap_or("")
}

#[tokio::test]
async fn double_spend_is_rejected_first_seen_wins() -> Result<()> {
    let (_backend, _chain, mut mempool, blocks) = setup(3, opts()).await?;
    let outpoint = coinbase_outpoint(&blocks[0]);

    let tx_a = spend(outpoint, 50 * COIN - 10_000);
    let hash_a = tx_a.compute_txid();
    assert_eq!(mempool.add_tx(tx_a).await?, TxStatus::Added);

    // Same outpoint, different transaction.
    let tx_b = spend(outpoint, 50 * COIN - 20_000);
    let hash_b = tx_b.compute_txid();
    let err = mempool.add_tx(tx_b).await.unwrap_err();
    assert_eq!(kind(&err), "duplicate");

    assert!(mempool.has(&hash_a));
    assert!(!mempool.has(&hash_b));
    Ok(())
}

#[tokio::test]
async fn orphan_parks_and_resolves_when_parent_arrives() -> Result<()> {
    let (_backend, _chain, mut mempool, blocks) = setup(3, opts()).await?;

    let parent = spend(coinbase_outpoint(&blocks[1]), 50 * COIN - 10_000);
    let parent_hash = parent.compute_txid();

    let child = spend(
        OutPoint {
            txid: parent_hash,
            vout: 0,
        },
        50 * COIN - 20_000,
    );
    let child_hash = child.compute_txid();

    // Child first: parked, not admitted.
    assert_eq!(mempool.add_tx(child).await?, TxStatus::Orphan);
    assert!(mempool.has_orphan(&child_hash));
    assert!(!mempool.has(&child_hash));

    // Parent admission cascades into the orphan.
    assert_eq!(mempool.add_tx(parent).await?, TxStatus::Added);
    assert!(mempool.has(&parent_hash));
    assert!(mempool.has(&child_hash));
    assert!(!mempool.has_orphan(&child_hash));
    assert_eq!(mempool.info().orphans, 0);
    Ok(())
}

#[tokio::test]
async fn confirmation_removes_from_pool() -> Result<()> {
    let (_backend, chain, mut mempool, blocks) = setup(3, opts()).await?;
    let params = chain.params().clone();

    let tx = spend(coinbase_outpoint(&blocks[0]), 50 * COIN - 10_000);
    let hash = tx.compute_txid();
    mempool.add_tx(tx.clone()).await?;
    assert!(mempool.has(&hash));

    let mut events = mempool.subscribe();

    let tip = chain.tip().await?;
    let block = mine_block(&tip, vec![tx], &params, 1);
    chain.add(block.clone()).await?;
    let entry = chain.db().get_entry(&block.block_hash()).await?.unwrap();

    mempool.add_block(&entry, &block).await;
    assert!(!mempool.has(&hash));

    // Confirmed precedes the removal event.
    let first = events.try_recv().unwrap();
    let second = events.try_recv().unwrap();
    assert!(matches!(first, MempoolEvent::Confirmed { .. }));
    assert!(matches!(second, MempoolEvent::Removed(_)));
    Ok(())
}

#[tokio::test]
async fn confirmed_double_spend_evicts_conflicting_entry() -> Result<()> {
    let (_backend, chain, mut mempool, blocks) = setup(3, opts()).await?;
    let params = chain.params().clone();
    let outpoint = coinbase_outpoint(&blocks[0]);

    let loose = spend(outpoint, 50 * COIN - 10_000);
    let loose_hash = loose.compute_txid();
    mempool.add_tx(loose).await?;

    // A competing spend confirms instead.
    let winner = spend(outpoint, 50 * COIN - 30_000);
    let tip = chain.tip().await?;
    let block = mine_block(&tip, vec![winner], &params, 1);
    chain.add(block.clone()).await?;
    let entry = chain.db().get_entry(&block.block_hash()).await?.unwrap();

    let mut events = mempool.subscribe();
    mempool.add_block(&entry, &block).await;

    assert!(!mempool.has(&loose_hash));
    let mut saw_conflict = false;
    while let Ok(event) = events.try_recv() {
        if let MempoolEvent::Conflict(tx) = event {
            assert_eq!(tx.compute_txid(), loose_hash);
            saw_conflict = true;
        }
    }
    assert!(saw_conflict);
    Ok(())
}

#[tokio::test]
async fn disconnected_transactions_return_to_pool() -> Result<()> {
    let (_backend, chain, mut mempool, blocks) = setup(3, opts()).await?;
    let params = chain.params().clone();

    let tx = spend(coinbase_outpoint(&blocks[0]), 50 * COIN - 10_000);
    let hash = tx.compute_txid();
    mempool.add_tx(tx.clone()).await?;

    let tip = chain.tip().await?;
    let block = mine_block(&tip, vec![tx], &params, 1);
    chain.add(block.clone()).await?;
    let entry = chain.db().get_entry(&block.block_hash()).await?.unwrap();
    mempool.add_block(&entry, &block).await;
    assert!(!mempool.has(&hash));

    // Unwind the block and hand it back to the pool.
    chain.db().disconnect(&entry).await?;
    let mut events = mempool.subscribe();
    mempool.remove_block(&entry, &block).await;

    assert!(mempool.has(&hash));
    let mut saw_unconfirmed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MempoolEvent::Unconfirmed { .. }) {
            saw_unconfirmed = true;
        }
    }
    assert!(saw_unconfirmed);
    Ok(())
}

#[tokio::test]
async fn size_bound_holds_under_pressure() -> Result<()> {
    let options = MempoolOptions {
        max_size: 1500,
        ..opts()
    };
    let (_backend, _chain, mut mempool, blocks) = setup(10, options).await?;

    let mut admitted = 0;
    for block in &blocks {
        let tx = spend(coinbase_outpoint(block), 50 * COIN - 10_000);
        match mempool.add_tx(tx).await {
            Ok(TxStatus::Added) => admitted += 1,
            Ok(TxStatus::Orphan) => {}
            Err(err) => assert_eq!(kind(&err), "insufficientfee"),
        }
        assert!(mempool.size() <= 1500, "size bound violated");
    }
    assert!(admitted > 0);
    Ok(())
}

#[tokio::test]
async fn already_known_and_coinbase_rejections() -> Result<()> {
    let (_backend, chain, mut mempool, blocks) = setup(3, opts()).await?;
    let params = chain.params().clone();

    let tx = spend(coinbase_outpoint(&blocks[0]), 50 * COIN - 10_000);
    mempool.add_tx(tx.clone()).await?;

    let err = mempool.add_tx(tx.clone()).await.unwrap_err();
    assert_eq!(kind(&err), "alreadyknown");

    // Confirm it; resubmission now hits the chain-side check.
    let tip = chain.tip().await?;
    let block = mine_block(&tip, vec![tx.clone()], &params, 1);
    chain.add(block.clone()).await?;
    let entry = chain.db().get_entry(&block.block_hash()).await?.unwrap();
    mempool.add_block(&entry, &block).await;

    let err = mempool.add_tx(tx).await.unwrap_err();
    assert_eq!(kind(&err), "alreadyknown");

    let cb = coinbase(1, 50 * COIN, 7);
    let err = mempool.add_tx(cb).await.unwrap_err();
    assert_eq!(kind(&err), "coinbase");
    Ok(())
}

#[tokio::test]
async fn non_final_and_absurd_fee_rejections() -> Result<()> {
    let (_backend, _chain, mut mempool, blocks) = setup(3, opts()).await?;

    // Locktime far above the next block height, sequence non-final.
    let mut locked = spend(coinbase_outpoint(&blocks[0]), 50 * COIN - 10_000);
    locked.lock_time = bitcoin::absolute::LockTime::from_consensus(1000);
    locked.input[0].sequence = bitcoin::Sequence(0);
    let err = mempool.add_tx(locked).await.unwrap_err();
    assert_eq!(kind(&err), "non-final");

    // Forfeiting nearly the whole input as fee is absurd.
    let burn = spend(coinbase_outpoint(&blocks[1]), 1000);
    let err = mempool.add_tx(burn).await.unwrap_err();
    assert_eq!(kind(&err), "highfee");
    Ok(())
}

#[tokio::test]
async fn zero_fee_child_lacks_priority() -> Result<()> {
    let (_backend, _chain, mut mempool, blocks) = setup(3, opts()).await?;

    // Parent pays a small output to the child and takes change.
    let mut parent = spend(coinbase_outpoint(&blocks[0]), COIN);
    parent.output.push(bitcoin::TxOut {
        value: bitcoin::Amount::from_sat(49 * COIN - 10_000),
        script_pubkey: anyone_can_spend(),
    });
    let parent_hash = parent.compute_txid();
    mempool.add_tx(parent).await?;

    // Unconfirmed low-value input: no fee, no priority.
    let child = spend(
        OutPoint {
            txid: parent_hash,
            vout: 0,
        },
        COIN,
    );
    let err = mempool.add_tx(child).await.unwrap_err();
    assert_eq!(kind(&err), "insufficientfee");
    Ok(())
}

#[tokio::test]
async fn long_in_pool_ancestor_chains_are_rejected() -> Result<()> {
    let options = MempoolOptions {
        ancestor_limit: 2,
        ..opts()
    };
    let (_backend, _chain, mut mempool, blocks) = setup(3, options).await?;

    // Chain of spends: the fourth transaction has three in-pool
    // ancestors, one over the limit.
    let mut value = 50 * COIN;
    let mut prevout = coinbase_outpoint(&blocks[0]);
    for depth in 0..4 {
        value -= 10_000;
        let tx = spend(prevout, value);
        let hash = tx.compute_txid();
        let result = mempool.add_tx(tx).await;
        if depth < 3 {
            assert_eq!(result?, TxStatus::Added);
        } else {
            let err = result.unwrap_err();
            assert_eq!(err.verification().unwrap().code, "too-long-mempool-chain");
        }
        prevout = OutPoint { txid: hash, vout: 0 };
    }
    Ok(())
}

#[tokio::test]
async fn orphan_pool_is_bounded() -> Result<()> {
    let options = MempoolOptions {
        max_orphans: 5,
        ..opts()
    };
    let (_backend, _chain, mut mempool, _blocks) = setup(1, options).await?;

    for i in 0..10u8 {
        use bitcoin::hashes::Hash;
        let fake_parent = bitcoin::Txid::from_byte_array([i + 100; 32]);
        let orphan = spend(
            OutPoint {
                txid: fake_parent,
                vout: 0,
            },
            1_000_000,
        );
        assert_eq!(mempool.add_tx(orphan).await?, TxStatus::Orphan);
        assert!(mempool.info().orphans <= 5);
    }
    Ok(())
}

#[tokio::test]
async fn no_two_entries_spend_the_same_outpoint() -> Result<()> {
    // Every admitted transaction claims its inputs in the spent index, so
    // pairwise disjointness follows from admission never overwriting.
    let (_backend, _chain, mut mempool, blocks) = setup(5, opts()).await?;

    for block in &blocks {
        let tx = spend(coinbase_outpoint(block), 50 * COIN - 10_000);
        mempool.add_tx(tx).await?;
    }
    for block in &blocks {
        let outpoint = coinbase_outpoint(block);
        assert!(mempool.is_spent(&outpoint));
        let double = spend(outpoint, 50 * COIN - 50_000);
        assert_eq!(kind(&mempool.add_tx(double).await.unwrap_err()), "duplicate");
    }
    Ok(())
}
