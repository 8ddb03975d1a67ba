use anyhow::Result;
use brokkr::chain::types::{LotusCid, MarketDeal, MarketDealProposal, MarketDealState};
use brokkr::database::queries::insert_proposal;
use brokkr::database::types::ProposalRow;
use brokkr::fil::DEFAULT_LOOKBACK_EPOCHS;
use brokkr::test_utils::{
    MockChain, TenantRules, claim_piece, new_mock_piece_cid, new_test_db, seed_client, seed_piece,
    seed_provider, seed_tenant,
};
use brokkr::tracker;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

const LOG2: i64 = 35;

async fn seed_world(
    conn: &libsql::Connection,
    piece_cid: &cid::Cid,
) -> Result<i64> {
    seed_tenant(conn, TenantRules::permissive(1, 10)).await?;
    let piece_id = seed_piece(conn, piece_cid, LOG2, "bafyLabel").await?;
    claim_piece(conn, 1, piece_id).await?;
    seed_client(conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;
    seed_provider(conn, 1234, 7, 7).await?;
    Ok(piece_id)
}

fn market_deal(piece_cid: &cid::Cid, start_epoch: i64, sector_start: i64) -> MarketDeal {
    MarketDeal {
        proposal: MarketDealProposal {
            piece_cid: LotusCid(*piece_cid),
            piece_size: 1 << LOG2,
            verified_deal: true,
            client: "f01442".to_string(),
            provider: "f01234".to_string(),
            label: serde_json::Value::String("label".to_string()),
            start_epoch,
            end_epoch: start_epoch + 530 * 2880,
        },
        state: MarketDealState {
            sector_start_epoch: sector_start,
            last_updated_epoch: -1,
            slash_epoch: -1,
        },
    }
}

async fn deal_status(conn: &libsql::Connection, deal_id: i64) -> Result<Option<String>> {
    let mut rows = conn
        .query(
            "SELECT status FROM published_deals WHERE deal_id = ?",
            libsql::params![deal_id],
        )
        .await?;
    Ok(match rows.next().await? {
        Some(row) => Some(row.get::<String>(0)?),
        None => None,
    })
}

async fn proposal_state(conn: &libsql::Connection) -> Result<(Option<i64>, i64)> {
    let mut rows = conn
        .query(
            "SELECT activated_deal_id, proposal_failstamp FROM proposals",
            libsql::params![],
        )
        .await?;
    let row = rows.next().await?.expect("one proposal seeded");
    Ok((row.get::<Option<i64>>(0)?, row.get::<i64>(1)?))
}

#[tokio::test]
async fn reconciles_publish_activate_terminate() -> Result<()> {
    let (_reader, writer, _temp) = new_test_db().await?;
    let conn = writer.connection();
    let chain = MockChain::new();
    let cancel = CancellationToken::new();

    let piece = new_mock_piece_cid("tracked-piece");
    let piece_id = seed_world(&conn, &piece).await?;

    let head = chain.state.lock().unwrap().head_epoch;
    chain
        .state
        .lock()
        .unwrap()
        .datacaps
        .insert("f01442".to_string(), num_bigint::BigInt::from(1u64 << 40));

    // a delivered, signed reservation waiting for its deal to land
    insert_proposal(
        &conn,
        ProposalRow::builder()
            .proposal_uuid(uuid::Uuid::new_v4().to_string())
            .piece_id(piece_id)
            .provider_id(1234)
            .client_id(1442)
            .start_epoch(head + 8640)
            .end_epoch(head + 8640 + 530 * 2880)
            .proxied_log2_size(LOG2)
            .provider_collateral("12345".to_string())
            .entry_created(Utc::now().timestamp_millis())
            .build(),
    )
    .await?;
    conn.execute(
        "UPDATE proposals SET signature_obtained = 1, proposal_delivered = 2",
        libsql::params![],
    )
    .await?;

    // round 1: deal published, no sector yet
    chain
        .state
        .lock()
        .unwrap()
        .market
        .insert("42".to_string(), market_deal(&piece, head + 8640, -1));
    tracker::run(cancel.clone(), &writer, &chain, DEFAULT_LOOKBACK_EPOCHS).await?;

    assert_eq!(deal_status(&conn, 42).await?.as_deref(), Some("published"));
    let (activated, failstamp) = proposal_state(&conn).await?;
    assert_eq!(activated, None);
    assert_eq!(failstamp, 0);

    // published verified bytes are already spoken for
    let mut rows = conn
        .query(
            "SELECT activatable_datacap FROM clients WHERE client_id = 1442",
            libsql::params![],
        )
        .await?;
    let stored: String = rows.next().await?.unwrap().get(0)?;
    assert_eq!(stored, ((1u64 << 40) - (1u64 << LOG2)).to_string());

    // round 2: the containing sector activates, the reservation is linked
    chain
        .state
        .lock()
        .unwrap()
        .market
        .insert("42".to_string(), market_deal(&piece, head + 8640, head + 10));
    tracker::run(cancel.clone(), &writer, &chain, DEFAULT_LOOKBACK_EPOCHS).await?;

    assert_eq!(deal_status(&conn, 42).await?.as_deref(), Some("active"));
    let (activated, failstamp) = proposal_state(&conn).await?;
    assert_eq!(activated, Some(42));
    assert_eq!(failstamp, 0);

    let mut rows = conn
        .query(
            "SELECT size_proven_correct FROM pieces WHERE piece_id = ?",
            libsql::params![piece_id],
        )
        .await?;
    assert_eq!(rows.next().await?.unwrap().get::<i64>(0)?, 1);

    // round 3: unchanged chain state leaves everything exactly as-is
    tracker::run(cancel.clone(), &writer, &chain, DEFAULT_LOOKBACK_EPOCHS).await?;
    assert_eq!(deal_status(&conn, 42).await?.as_deref(), Some("active"));
    assert_eq!(proposal_state(&conn).await?, (Some(42), 0));

    // round 4: the deal vanishes from market state entirely
    chain.state.lock().unwrap().market.clear();
    tracker::run(cancel, &writer, &chain, DEFAULT_LOOKBACK_EPOCHS).await?;

    assert_eq!(deal_status(&conn, 42).await?.as_deref(), Some("terminated"));
    let (activated, failstamp) = proposal_state(&conn).await?;
    assert_eq!(activated, None, "terminated deals lose the back-pointer");
    assert!(failstamp > 0, "the reservation is failed for good");
    Ok(())
}

#[tokio::test]
async fn missed_sealing_window_terminates() -> Result<()> {
    let (_reader, writer, _temp) = new_test_db().await?;
    let conn = writer.connection();
    let chain = MockChain::new();

    let piece = new_mock_piece_cid("late-piece");
    seed_world(&conn, &piece).await?;

    let head = chain.state.lock().unwrap().head_epoch;
    // start epoch one full update interval behind the lookback height
    chain
        .state
        .lock()
        .unwrap()
        .market
        .insert("77".to_string(), market_deal(&piece, head - 6000, -1));

    tracker::run(
        CancellationToken::new(),
        &writer,
        &chain,
        DEFAULT_LOOKBACK_EPOCHS,
    )
    .await?;

    assert_eq!(deal_status(&conn, 77).await?.as_deref(), Some("terminated"));
    let mut rows = conn
        .query(
            "SELECT status_meta FROM published_deals WHERE deal_id = 77",
            libsql::params![],
        )
        .await?;
    let meta: String = rows.next().await?.unwrap().get(0)?;
    assert!(meta.contains("missed expected sealing epoch"), "{}", meta);
    Ok(())
}

#[tokio::test]
async fn refuses_to_run_against_stale_chain() -> Result<()> {
    let (_reader, writer, _temp) = new_test_db().await?;
    let conn = writer.connection();
    let chain = MockChain::new();

    let piece = new_mock_piece_cid("whatever");
    seed_world(&conn, &piece).await?;

    // the node's head is minutes behind wall time
    chain.state.lock().unwrap().head_timestamp =
        Some((Utc::now().timestamp() - 600) as u64);

    let result = tracker::run(
        CancellationToken::new(),
        &writer,
        &chain,
        DEFAULT_LOOKBACK_EPOCHS,
    )
    .await;
    assert!(result.is_err());
    assert!(format!("{:#}", result.unwrap_err()).contains("out of sync"));
    Ok(())
}
