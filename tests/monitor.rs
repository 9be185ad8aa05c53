mod common;

use std::sync::Arc;
use std::time::Duration;

use coin_indexer::db::{Database, TransferFilter};
use coin_indexer::error::TickError;
use coin_indexer::models::LogEntry;
use coin_indexer::monitor::{ContractMonitor, MonitorSettings, MonitorState, TickOutcome};
use coin_indexer::store::ProgressStore;
use tokio_util::sync::CancellationToken;

use common::*;

fn usdc_logs() -> Vec<LogEntry> {
    vec![
        transfer_log(USDC, 100, 0, 1_000),
        transfer_log(USDC, 149, 3, 2_000),
        transfer_log(USDC, 150, 0, 3_000),
        transfer_log(USDC, 230, 1, 4_000),
        transfer_log(USDC, 250, 0, 5_000),
    ]
}

fn chain_with_usdc(height: u64) -> Arc<ScriptedChain> {
    let chain = ScriptedChain::new(height);
    for log in usdc_logs() {
        chain.push(log);
    }
    // another contract's logs must never leak into USDC's ranges
    chain.push(transfer_log(WETH, 120, 0, 7));
    chain
}

fn usdc_monitor(
    chain: &Arc<ScriptedChain>,
    db: &Arc<Database>,
    settings: MonitorSettings,
) -> ContractMonitor {
    monitor_with(
        descriptor("USDC", USDC, 100),
        chain.clone(),
        db.clone(),
        db.clone(),
        settings,
    )
}

async fn all_transfers(db: &Database) -> Vec<coin_indexer::models::TransferRecord> {
    db.transfers(TransferFilter {
        limit: 10_000,
        ..Default::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn processes_scenario_in_four_chunks() {
    let chain = chain_with_usdc(250);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = usdc_monitor(&chain, &db, settings(50));

    let outcome = monitor.tick(&CancellationToken::new()).await.unwrap();
    let TickOutcome::Advanced(summary) = outcome else {
        panic!("expected progress, got {outcome:?}");
    };
    assert_eq!(summary.chunks, 4);
    assert_eq!((summary.range.from, summary.range.to), (100, 250));
    assert_eq!(summary.stored.inserted, 5);

    assert_eq!(
        chain.requests_for(USDC),
        vec![(100, 149), (150, 199), (200, 249), (250, 250)]
    );
    assert_eq!(db.get(USDC).await.unwrap(), Some(250));

    let stored = all_transfers(&db).await;
    assert_eq!(stored.len(), 5);
    let newest = &stored[0];
    assert_eq!(newest.block_number, 250);
    assert_eq!(newest.amount, "5000");
    assert_eq!(newest.token_name, "USDC");
    assert_eq!(newest.contract_address, USDC);
    assert_eq!(newest.from_address, SENDER);
    assert_eq!(newest.to_address, RECIPIENT);
    assert_eq!(newest.block_timestamp, block_time(250));
    assert!(newest.price_usd.is_none());
}

#[tokio::test]
async fn idle_tick_when_no_new_blocks() {
    let chain = chain_with_usdc(250);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = usdc_monitor(&chain, &db, settings(50));
    let cancel = CancellationToken::new();

    monitor.tick(&cancel).await.unwrap();
    chain.clear_requests();

    assert_eq!(monitor.tick(&cancel).await.unwrap(), TickOutcome::UpToDate);
    assert!(chain.requests_for(USDC).is_empty());
    assert_eq!(db.get(USDC).await.unwrap(), Some(250));

    // a contract whose start height is still in the future is never polled
    let later = monitor_with(
        descriptor("WETH", WETH, 400),
        chain.clone(),
        db.clone(),
        db.clone(),
        settings(50),
    );
    assert_eq!(later.tick(&cancel).await.unwrap(), TickOutcome::UpToDate);
    assert_eq!(db.get(WETH).await.unwrap(), None);
}

#[tokio::test]
async fn refetching_a_processed_range_adds_nothing() {
    let chain = chain_with_usdc(250);
    let events = Arc::new(Database::open_in_memory().unwrap());
    let first_progress = Arc::new(Database::open_in_memory().unwrap());
    let cancel = CancellationToken::new();

    let monitor = monitor_with(
        descriptor("USDC", USDC, 100),
        chain.clone(),
        first_progress,
        events.clone(),
        settings(50),
    );
    monitor.tick(&cancel).await.unwrap();

    // restart with the checkpoint lost: the whole range is fetched again
    let lost_progress = Arc::new(Database::open_in_memory().unwrap());
    let monitor = monitor_with(
        descriptor("USDC", USDC, 100),
        chain.clone(),
        lost_progress.clone(),
        events.clone(),
        settings(50),
    );
    let TickOutcome::Advanced(summary) = monitor.tick(&cancel).await.unwrap() else {
        panic!("expected the range to be re-processed");
    };
    assert_eq!(summary.stored.inserted, 0);
    assert_eq!(summary.stored.duplicates, 5);
    assert_eq!(summary.stored.conflicts, 0);
    assert_eq!(all_transfers(&events).await.len(), 5);
    assert_eq!(lost_progress.get(USDC).await.unwrap(), Some(250));
}

#[tokio::test]
async fn fetch_failure_keeps_last_committed_checkpoint() {
    let chain = chain_with_usdc(250);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = usdc_monitor(&chain, &db, settings(50));
    let cancel = CancellationToken::new();

    chain.fail_logs_at(Some(170));
    let err = monitor.tick(&cancel).await.unwrap_err();
    assert!(matches!(err, TickError::Rpc(_)));
    assert_eq!(db.get(USDC).await.unwrap(), Some(149));
    assert_eq!(*monitor.subscribe().borrow(), MonitorState::Idle);

    chain.fail_logs_at(None);
    chain.clear_requests();
    let TickOutcome::Advanced(summary) = monitor.tick(&cancel).await.unwrap() else {
        panic!("expected retry to make progress");
    };
    assert_eq!(summary.range.from, 150);
    assert_eq!(chain.requests_for(USDC)[0], (150, 199));
    assert_eq!(db.get(USDC).await.unwrap(), Some(250));
    assert_eq!(all_transfers(&db).await.len(), 5);
}

#[tokio::test]
async fn height_failure_is_not_fatal() {
    let chain = chain_with_usdc(250);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = usdc_monitor(&chain, &db, settings(50));
    let cancel = CancellationToken::new();

    chain.fail_height(true);
    assert!(matches!(monitor.tick(&cancel).await, Err(TickError::Rpc(_))));
    assert_eq!(db.get(USDC).await.unwrap(), None);

    chain.fail_height(false);
    monitor.tick(&cancel).await.unwrap();
    assert_eq!(db.get(USDC).await.unwrap(), Some(250));
}

#[tokio::test]
async fn persist_failure_resumes_at_failed_chunk() {
    let chain = ScriptedChain::new(250);
    for block in (100..=250).step_by(10) {
        chain.push(transfer_log(USDC, block, 0, block));
    }
    let db = Arc::new(Database::open_in_memory().unwrap());
    let events = FlakyEvents::new((*db).clone());
    let monitor = monitor_with(
        descriptor("USDC", USDC, 100),
        chain.clone(),
        db.clone(),
        events.clone(),
        settings(50),
    );
    let cancel = CancellationToken::new();

    // third chunk, [200, 249], fails after writing part of its records
    events.fail_on_batch(Some(3));
    assert!(matches!(monitor.tick(&cancel).await, Err(TickError::Store(_))));
    assert_eq!(db.get(USDC).await.unwrap(), Some(199));

    events.fail_on_batch(None);
    chain.clear_requests();
    let TickOutcome::Advanced(summary) = monitor.tick(&cancel).await.unwrap() else {
        panic!("expected retry to make progress");
    };
    assert_eq!(chain.requests_for(USDC), vec![(200, 249), (250, 250)]);
    assert!(summary.stored.duplicates > 0);
    assert_eq!(db.get(USDC).await.unwrap(), Some(250));
    assert_eq!(all_transfers(&db).await.len(), 16);
}

#[tokio::test]
async fn persist_failure_on_first_chunk_leaves_no_checkpoint() {
    let chain = chain_with_usdc(250);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let events = FlakyEvents::new((*db).clone());
    let monitor = monitor_with(
        descriptor("USDC", USDC, 100),
        chain.clone(),
        db.clone(),
        events.clone(),
        settings(50),
    );

    events.fail_on_batch(Some(1));
    assert!(monitor.tick(&CancellationToken::new()).await.is_err());
    assert_eq!(db.get(USDC).await.unwrap(), None);
}

#[tokio::test]
async fn undecodable_logs_are_skipped() {
    let chain = ScriptedChain::new(250);
    chain.push(transfer_log(USDC, 120, 0, 10));

    let mut two_topics = transfer_log(USDC, 120, 1, 20);
    two_topics.topics.truncate(2);
    chain.push(two_topics);

    let mut short_data = transfer_log(USDC, 120, 2, 30);
    short_data.data.truncate(16);
    chain.push(short_data);

    chain.push(transfer_log(USDC, 121, 0, 40));

    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = usdc_monitor(&chain, &db, settings(50));

    let outcome = monitor.tick(&CancellationToken::new()).await.unwrap();
    let TickOutcome::Advanced(summary) = outcome else {
        panic!("expected progress");
    };
    assert_eq!(summary.fetched, 4);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.stored.inserted, 2);
    assert_eq!(db.get(USDC).await.unwrap(), Some(250));

    let amounts: Vec<_> = all_transfers(&db).await.into_iter().map(|t| t.amount).collect();
    assert_eq!(amounts, vec!["40", "10"]);
}

#[tokio::test]
async fn block_timestamps_are_fetched_once_per_block() {
    let chain = ScriptedChain::new(140);
    for log_index in 0..3 {
        chain.push(transfer_log(USDC, 120, log_index, 1));
    }
    chain.push(transfer_log(USDC, 130, 0, 1));

    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = usdc_monitor(&chain, &db, settings(50));
    monitor.tick(&CancellationToken::new()).await.unwrap();

    assert_eq!(chain.timestamp_calls(), 2);
    for transfer in all_transfers(&db).await {
        assert_eq!(transfer.block_timestamp, block_time(transfer.block_number));
    }
}

#[tokio::test]
async fn confirmations_hold_back_the_head() {
    let chain = chain_with_usdc(250);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let settings = MonitorSettings {
        confirmations: 10,
        ..settings(50)
    };
    let monitor = usdc_monitor(&chain, &db, settings);

    monitor.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(db.get(USDC).await.unwrap(), Some(240));
    assert_eq!(all_transfers(&db).await.len(), 4);
}

#[tokio::test]
async fn checkpoint_only_moves_forward_across_ticks() {
    let chain = chain_with_usdc(120);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = usdc_monitor(&chain, &db, settings(7));
    let cancel = CancellationToken::new();

    let mut seen = Vec::new();
    for height in [120, 120, 180, 179, 251, 300] {
        chain.set_height(height);
        let _ = monitor.tick(&cancel).await;
        seen.push(db.get(USDC).await.unwrap().unwrap());
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(*seen.last().unwrap(), 300);
}

#[tokio::test]
async fn cancelled_tick_does_no_work() {
    let chain = chain_with_usdc(250);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = usdc_monitor(&chain, &db, settings(50));

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(monitor.tick(&cancel).await, Err(TickError::Cancelled)));
    assert!(chain.requests_for(USDC).is_empty());
    assert_eq!(db.get(USDC).await.unwrap(), None);
}

#[tokio::test]
async fn stop_during_persist_commits_the_chunk_then_stops() {
    let chain = chain_with_usdc(250);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let cancel = CancellationToken::new();
    let events = StopDuringPersist::new((*db).clone(), cancel.clone());
    let monitor = monitor_with(
        descriptor("USDC", USDC, 100),
        chain.clone(),
        db.clone(),
        events,
        settings(50),
    );

    let outcome = monitor.tick(&cancel).await.unwrap();
    assert_eq!(outcome, TickOutcome::Interrupted { completed: 1 });
    assert_eq!(db.get(USDC).await.unwrap(), Some(149));
    assert_eq!(chain.requests_for(USDC), vec![(100, 149)]);

    let blocks: Vec<_> = all_transfers(&db)
        .await
        .into_iter()
        .map(|t| t.block_number)
        .collect();
    assert_eq!(blocks, vec![149, 100]);
    assert_eq!(*monitor.subscribe().borrow(), MonitorState::Idle);
}

#[tokio::test]
async fn stop_interrupts_a_stalled_checkpoint_read() {
    let chain = chain_with_usdc(250);
    let db = Database::open_in_memory().unwrap();
    let monitor = monitor_with(
        descriptor("USDC", USDC, 100),
        chain.clone(),
        StalledProgress::new(db.clone()),
        Arc::new(db.clone()),
        settings(50),
    );

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(2), monitor.tick(&cancel))
        .await
        .expect("tick kept waiting on the checkpoint read");
    assert!(matches!(outcome, Err(TickError::Cancelled)));
    assert!(chain.requests_for(USDC).is_empty());
    assert_eq!(db.get(USDC).await.unwrap(), None);
}

#[tokio::test]
async fn stop_interrupts_a_hanging_fetch() {
    let chain = chain_with_usdc(250);
    chain.hang_logs_for(USDC);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let monitor = usdc_monitor(&chain, &db, settings(50));
    let state = monitor.subscribe();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(monitor.run(cancel.clone()));

    while chain.requests_for(USDC).is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*state.borrow(), MonitorState::Fetching);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitor did not stop")
        .unwrap();
    assert_eq!(*state.borrow(), MonitorState::Idle);
    assert_eq!(db.get(USDC).await.unwrap(), None);
}
