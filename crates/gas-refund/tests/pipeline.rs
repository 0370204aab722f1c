//! End-to-end runs against the SQLite store with in-memory upstreams

use alloy::primitives::{Address, B256};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use gas_refund::budget::{BudgetGuardian, BudgetLimits};
use gas_refund::claims::{import_distribution_file, MerkleClaimResolver};
use gas_refund::epochs::EpochRules;
use gas_refund::indexer::{IndexerSettings, StopReason, WindowedRefundIndexer};
use gas_refund::stakes::{MissingStakePolicy, ResolverSettings, StakePool, VersionedStakeResolver};
use gas_refund::store::{RefundStore, Store};
use gas_refund::swaps::{AccumulatorSettings, SwapFeeAccumulator};
use gas_refund::testing::{
    addr, tx_hash, FakeClaimStatus, FakeStakeSource, FakeSwapSource, FakeTransactionSource,
    FixedPriceResolver,
};
use gas_refund::types::{whole_tokens, PriceRate, RefundableTransaction, SwapTransaction};

const CHAIN: u64 = 1;
// 2024-01-10 00:00:00 UTC
const START: i64 = 1_704_844_800;
const HOUR: i64 = 3_600;

fn rate() -> PriceRate {
    PriceRate::from_usd_prices("0.05".parse().unwrap(), "2000".parse().unwrap()).unwrap()
}

fn fractional_rate() -> PriceRate {
    PriceRate::from_usd_prices("0.07".parse().unwrap(), "2000".parse().unwrap()).unwrap()
}

fn distribution_json(epoch: u64, address: Address, amount: &str) -> serde_json::Value {
    serde_json::json!({
        "root": { "merkleRoot": B256::repeat_byte(epoch as u8), "totalAmount": amount, "epoch": epoch },
        "merkleProofs": [
            { "proof": [B256::repeat_byte(0xaa)], "address": address, "amount": amount, "epoch": epoch }
        ]
    })
}

fn limits() -> BudgetLimits {
    BudgetLimits {
        max_token_global: whole_tokens(1_000_000),
        max_usd_per_account: Decimal::from(10),
    }
}

fn resolver(stakes: FakeStakeSource) -> Arc<VersionedStakeResolver> {
    Arc::new(VersionedStakeResolver::new(
        Arc::new(stakes),
        EpochRules::default().algorithms,
        ResolverSettings {
            virtual_lockup_secs: 0,
            unified_chain_id: CHAIN,
            missing_policy: MissingStakePolicy::Zero,
        },
    ))
}

fn stakers() -> FakeStakeSource {
    FakeStakeSource::default()
        .with_balance(StakePool::Staking, addr(1), 0, whole_tokens(50_000))
        .with_balance(StakePool::Staking, addr(2), 0, whole_tokens(5_000))
}

async fn open_store(dir: &tempfile::TempDir) -> Arc<Store> {
    Arc::new(Store::open(&dir.path().join("refunds.sqlite")).await.unwrap())
}

fn swap(n: u64, from: Address, timestamp: i64) -> SwapTransaction {
    SwapTransaction {
        hash: tx_hash(n),
        block_number: 1_000 + n,
        timestamp,
        tx_origin: from,
        gas_price: 20_000_000_000,
    }
}

fn accumulator(store: Arc<Store>, swaps: FakeSwapSource) -> SwapFeeAccumulator {
    SwapFeeAccumulator::new(
        resolver(stakers()),
        Arc::new(EpochRules::default()),
        Arc::new(swaps),
        store,
        Arc::new(BudgetGuardian::new(limits())),
        AccumulatorSettings {
            slice_duration_secs: 6 * HOUR,
            concurrency: 4,
            fetch_timeout: Duration::from_secs(5),
            unified_chain_id: CHAIN,
            missing_policy: MissingStakePolicy::Zero,
        },
        CancellationToken::new(),
    )
}

fn swaps() -> FakeSwapSource {
    // $6 of refund per swap for addr(1) at 75%
    FakeSwapSource::default()
        .with_swap(swap(1, addr(1), START + 60), 200_000)
        .with_swap(swap(2, addr(2), START + 2 * HOUR), 200_000)
        .with_swap(swap(3, addr(1), START + 8 * HOUR), 200_000)
        .with_swap(swap(4, addr(1), START + 9 * HOUR), 200_000)
}

#[tokio::test]
async fn swap_accumulation_resumes_across_reopened_store() {
    let dir = tempfile::tempdir().unwrap();
    let epoch = 11;

    {
        let store = open_store(&dir).await;
        accumulator(store, swaps())
            .accumulate(CHAIN, START, START + 6 * HOUR, epoch, &FixedPriceResolver::new(rate()))
            .await
            .unwrap();
    }

    // Fresh process: caps must be rebuilt from what is on disk
    let store = open_store(&dir).await;
    let summary = accumulator(store.clone(), swaps())
        .accumulate(CHAIN, START, START + 12 * HOUR, epoch, &FixedPriceResolver::new(rate()))
        .await
        .unwrap();
    assert_eq!(summary.resumed_from, START + 2 * HOUR + 1);
    assert_eq!(summary.stop, StopReason::Completed);

    let records = store.epoch_records(CHAIN, epoch).await.unwrap();
    assert_eq!(records.len(), 2);

    let a = records.iter().find(|r| r.address == addr(1)).unwrap();
    assert_eq!(a.refunded_amount_usd, Decimal::from(10));
    assert_eq!(a.refunded_amount_token, whole_tokens(200));
    assert_eq!(a.transaction_count, 2);
    assert_eq!(a.first_block, 1_001);
    assert_eq!(a.last_tx, tx_hash(3));
}

#[tokio::test]
async fn indexer_checkpoints_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let epoch = 20;
    let tx = RefundableTransaction {
        hash: tx_hash(7),
        block_number: 7,
        timestamp: START + 30,
        tx_origin: addr(1),
        gas_used: 200_000,
        gas_price: 20_000_000_000,
        contract: "augustus".to_string(),
    };

    let run = |store: Arc<Store>, source: Arc<FakeTransactionSource>| async move {
        let indexer = WindowedRefundIndexer::new(
            resolver(stakers()),
            Arc::new(EpochRules::default()),
            source,
            store,
            Arc::new(BudgetGuardian::new(limits())),
            HashMap::from([(CHAIN, vec!["augustus".to_string()])]),
            IndexerSettings {
                slice_duration_secs: 6 * HOUR,
                contract_concurrency: 2,
                lookup_concurrency: 2,
                fetch_timeout: Duration::from_secs(5),
                migration_contract_key: "migration-100-percent".to_string(),
            },
            CancellationToken::new(),
        );
        indexer
            .index(CHAIN, START, START + 12 * HOUR, epoch, &FixedPriceResolver::new(rate()))
            .await
            .unwrap()
    };

    let source = Arc::new(FakeTransactionSource::default().with_transaction(tx.clone()));
    let first = run(open_store(&dir).await, source.clone()).await;
    assert_eq!(first[0].written, 1);
    assert_eq!(source.calls(), 2);

    let store = open_store(&dir).await;
    let second = run(store.clone(), source.clone()).await;
    assert_eq!(second[0].windows, 0);
    assert_eq!(source.calls(), 2);
    assert_eq!(
        store.last_processed_timestamp(CHAIN, epoch, "augustus").await.unwrap(),
        START + 12 * HOUR - 1
    );

    let rows = store.epoch_transactions(CHAIN, epoch).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].refunded_amount_token, whole_tokens(120));
}

#[tokio::test]
async fn distribution_import_feeds_claims() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let current_epoch = 13;

    // Pending swap refunds of the running epoch
    accumulator(store.clone(), swaps())
        .accumulate(CHAIN, START, START + 6 * HOUR, current_epoch, &FixedPriceResolver::new(rate()))
        .await
        .unwrap();

    for (epoch, amount) in [(10u64, "1000"), (11, "2000"), (12, "3000")] {
        let path = dir.path().join(format!("distribution-{epoch}.json"));
        std::fs::write(&path, distribution_json(epoch, addr(1), amount).to_string()).unwrap();
        assert_eq!(import_distribution_file(&store, CHAIN, &path).await.unwrap(), 1);
    }

    let reader = FakeClaimStatus {
        claimed: [11].into(),
        override_len: None,
    };
    let claims = MerkleClaimResolver::new(store.clone(), Arc::new(reader), CHAIN, 9);
    let response = claims.claims_for_address(addr(1), current_epoch).await.unwrap();

    let epochs: Vec<u64> = response.claims.iter().map(|c| c.epoch).collect();
    assert_eq!(epochs, vec![10, 12]);
    assert_eq!(response.total_claimable, "4000");
    assert_eq!(response.claims[0].proof, vec![B256::repeat_byte(0xaa)]);
    // 120 tokens pending from the first swap
    assert_eq!(response.pending_claimable, whole_tokens(120).to_string());
    assert_eq!(store.stats().await.unwrap().distributions, 3);
}

#[tokio::test]
async fn rerun_after_distribution_import_keeps_completed_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let epoch = 11;

    accumulator(store.clone(), swaps())
        .accumulate(CHAIN, START, START + 6 * HOUR, epoch, &FixedPriceResolver::new(rate()))
        .await
        .unwrap();

    let path = dir.path().join("distribution-11.json");
    std::fs::write(&path, distribution_json(epoch, addr(1), "5000").to_string()).unwrap();
    import_distribution_file(&store, CHAIN, &path).await.unwrap();

    accumulator(store.clone(), swaps())
        .accumulate(CHAIN, START, START + 12 * HOUR, epoch, &FixedPriceResolver::new(rate()))
        .await
        .unwrap();

    let records = store.epoch_records(CHAIN, epoch).await.unwrap();
    let a = records.iter().find(|r| r.address == addr(1)).unwrap();
    assert!(a.is_completed);
    assert_eq!(a.refunded_amount_token, Decimal::from(5000));
    assert_eq!(a.merkle_proof, vec![B256::repeat_byte(0xaa)]);
    assert_eq!(a.transaction_count, 1);

    let b = records.iter().find(|r| r.address == addr(2)).unwrap();
    assert!(!b.is_completed);
    assert_eq!(b.transaction_count, 1);
}

#[tokio::test]
async fn split_run_with_fractional_amounts_matches_single_run() {
    let epoch = 11;
    // Two swaps of addr(1) in different windows
    let swaps = || {
        FakeSwapSource::default()
            .with_swap(swap(1, addr(1), START + 60), 200_000)
            .with_swap(swap(3, addr(1), START + 8 * HOUR), 200_000)
    };

    let single_dir = tempfile::tempdir().unwrap();
    let single = open_store(&single_dir).await;
    accumulator(single.clone(), swaps())
        .accumulate(CHAIN, START, START + 12 * HOUR, epoch, &FixedPriceResolver::new(fractional_rate()))
        .await
        .unwrap();

    let split_dir = tempfile::tempdir().unwrap();
    accumulator(open_store(&split_dir).await, swaps())
        .accumulate(CHAIN, START, START + 6 * HOUR, epoch, &FixedPriceResolver::new(fractional_rate()))
        .await
        .unwrap();
    let split = open_store(&split_dir).await;
    accumulator(split.clone(), swaps())
        .accumulate(CHAIN, START, START + 12 * HOUR, epoch, &FixedPriceResolver::new(fractional_rate()))
        .await
        .unwrap();

    let a = &single.epoch_records(CHAIN, epoch).await.unwrap()[0];
    let b = &split.epoch_records(CHAIN, epoch).await.unwrap()[0];
    // Per-account cap of $10 clips the second swap
    assert_eq!(a.refunded_amount_usd, Decimal::from(10));
    assert_eq!(a.refunded_amount_token, b.refunded_amount_token);
    assert_eq!(a.refunded_amount_usd, b.refunded_amount_usd);
    assert_eq!(a.accumulated_gas_used_token, b.accumulated_gas_used_token);
    assert_eq!(a.transaction_count, 2);
}
