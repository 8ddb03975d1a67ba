use anyhow::Result;
use brokkr::database::queries::{
    annotate_request, eligible_pieces, get_market_state_epoch, get_provider, insert_proposal,
    insert_request, pending_proposals, piece_eligibility, piece_sources, set_market_state,
};
use brokkr::database::types::ProposalRow;
use brokkr::fil::{EPOCHS_IN_HOUR, big_now, wall_time_epoch};
use brokkr::test_utils::{
    TenantRules, claim_piece, new_mock_piece_cid, new_test_db, seed_client, seed_piece,
    seed_provider, seed_published_deal, seed_tenant,
};
use chrono::Utc;

const LOG2: i64 = 35;

#[tokio::test]
async fn eligibility_row_reflects_live_state() -> Result<()> {
    let (reader, writer, _temp) = new_test_db().await?;
    let conn = writer.connection();

    seed_tenant(&conn, TenantRules::permissive(1, 5)).await?;
    let piece = new_mock_piece_cid("p1");
    let piece_id = seed_piece(&conn, &piece, LOG2, "bafyLabel").await?;
    claim_piece(&conn, 1, piece_id).await?;
    seed_client(&conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;
    seed_provider(&conn, 1234, 7, 7).await?;
    seed_provider(&conn, 70, 7, 8).await?;
    seed_published_deal(&conn, 1, piece_id, 70, 1442, "active").await?;

    let provider = get_provider(&conn, 1234).await?.unwrap();
    let rows = piece_eligibility(
        &conn,
        &provider,
        &piece.to_string(),
        0,
        wall_time_epoch(Utc::now()),
    )
    .await?;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.tenant_id, 1);
    assert_eq!(row.cur_total, 1);
    // provider 70 shares the org but not the city of the requester
    assert_eq!(row.cur_in_org, 1);
    assert_eq!(row.cur_in_city, 0);
    assert_eq!(row.deal_already_exists, 0);
    assert_eq!(row.client_id_to_use, Some(1442));
    assert_eq!(row.piece_size_bytes(), 1 << LOG2);

    // a live reservation by the requester flips the existence flag
    insert_proposal(
        &conn,
        ProposalRow::builder()
            .proposal_uuid(uuid::Uuid::new_v4().to_string())
            .piece_id(piece_id)
            .provider_id(1234)
            .client_id(1442)
            .start_epoch(3_000_000)
            .end_epoch(4_000_000)
            .proxied_log2_size(LOG2)
            .provider_collateral("1".to_string())
            .entry_created(Utc::now().timestamp_millis())
            .build(),
    )
    .await?;
    let rows = piece_eligibility(
        &conn,
        &provider,
        &piece.to_string(),
        0,
        wall_time_epoch(Utc::now()),
    )
    .await?;
    assert_eq!(rows[0].deal_already_exists, 1);
    assert_eq!(rows[0].cur_total, 2);
    assert_eq!(rows[0].cur_in_flight_bytes, 1 << LOG2);

    // the read pool sees the same picture
    let rconn = reader.connection().await?;
    let rows = piece_eligibility(
        &rconn,
        &provider,
        &piece.to_string(),
        0,
        wall_time_epoch(Utc::now()),
    )
    .await?;
    assert_eq!(rows[0].cur_total, 2);
    Ok(())
}

#[tokio::test]
async fn eligible_listing_filters_and_truncates() -> Result<()> {
    let (_reader, writer, _temp) = new_test_db().await?;
    let conn = writer.connection();

    seed_tenant(&conn, TenantRules::permissive(1, 5)).await?;
    seed_client(&conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;
    seed_provider(&conn, 1234, 7, 7).await?;

    for i in 0..4 {
        let piece = new_mock_piece_cid(&format!("piece-{}", i));
        // one of them is too large for the requester's sectors
        let log2 = if i == 3 { 36 } else { LOG2 };
        let piece_id = seed_piece(&conn, &piece, log2, "bafyLabel").await?;
        claim_piece(&conn, 1, piece_id).await?;
    }

    let provider = get_provider(&conn, 1234).await?.unwrap();
    let rows = eligible_pieces(&conn, &provider, LOG2, 0, true, false, true, 100).await?;
    assert_eq!(rows.len(), 3, "the oversized piece is filtered out");
    assert!(rows.iter().all(|r| r.tenant_id_list() == vec![1]));

    // sourceless pieces are omitted unless explicitly requested
    let rows = eligible_pieces(&conn, &provider, LOG2, 0, false, false, true, 100).await?;
    assert!(rows.is_empty());

    // limit+1 fetch signals truncation to the caller
    let rows = eligible_pieces(&conn, &provider, LOG2, 0, true, false, false, 2).await?;
    assert_eq!(rows.len(), 2);
    Ok(())
}

#[tokio::test]
async fn pending_classification_and_sources() -> Result<()> {
    let (_reader, writer, _temp) = new_test_db().await?;
    let conn = writer.connection();

    seed_tenant(&conn, TenantRules::permissive(1, 5)).await?;
    let piece = new_mock_piece_cid("pending-piece");
    let label_cid = new_mock_piece_cid("payload-root").to_string();
    let piece_id = seed_piece(&conn, &piece, LOG2, &label_cid).await?;
    claim_piece(&conn, 1, piece_id).await?;
    seed_client(&conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;
    seed_provider(&conn, 1234, 7, 7).await?;

    let start = wall_time_epoch(Utc::now()) + 8640;
    for (uuid, delivered, failed) in [
        ("00000000-0000-0000-0000-000000000001", false, false),
        ("00000000-0000-0000-0000-000000000002", true, false),
        ("00000000-0000-0000-0000-000000000003", false, true),
    ] {
        insert_proposal(
            &conn,
            ProposalRow::builder()
                .proposal_uuid(uuid.to_string())
                .piece_id(piece_id)
                .provider_id(1234)
                .client_id(1442)
                .start_epoch(start)
                .end_epoch(start + 530 * 2880)
                .proxied_log2_size(LOG2)
                .provider_collateral("1".to_string())
                .entry_created(Utc::now().timestamp_millis())
                .build(),
        )
        .await?;
        if delivered {
            conn.execute(
                "UPDATE proposals SET signature_obtained = 1, proposal_delivered = 2
                 WHERE proposal_uuid = ?",
                libsql::params![uuid],
            )
            .await?;
        }
        if failed {
            conn.execute(
                "UPDATE proposals SET proposal_failstamp = ?,
                        proposal_meta = JSON_SET(proposal_meta, '$.failure', 'it broke')
                 WHERE proposal_uuid = ?",
                libsql::params![big_now(), uuid],
            )
            .await?;
        }
    }

    let min_start = wall_time_epoch(Utc::now()) + EPOCHS_IN_HOUR - 28_000;
    let cutoff = big_now() - 24 * 3600 * 1_000_000_000;
    let rows = pending_proposals(&conn, 1234, min_start, cutoff).await?;
    assert_eq!(rows.len(), 3);

    // failures sort first
    assert!(rows[0].proposal_failstamp > 0);
    assert_eq!(rows[0].error.as_deref(), Some("it broke"));
    let delivered = rows.iter().filter(|r| r.proposal_delivered.is_some()).count();
    assert_eq!(delivered, 1);

    // an active deal elsewhere with a decodable label becomes a source
    seed_provider(&conn, 70, 7, 8).await?;
    conn.execute(
        "INSERT INTO published_deals
            (deal_id, client_id, provider_id, piece_id, label, decoded_label, is_filplus,
             status, start_epoch, end_epoch)
         VALUES (9, 1442, 70, ?, X'', ?, 1, 'active', 3000000, 4000000)",
        libsql::params![piece_id, label_cid.clone()],
    )
    .await?;
    let sources = piece_sources(&conn, &[piece_id], 0).await?;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].decoded_label, label_cid);

    // org-restricted lookup from another org comes back empty
    let sources = piece_sources(&conn, &[piece_id], 99).await?;
    assert!(sources.is_empty());
    Ok(())
}

#[tokio::test]
async fn request_log_and_market_state() -> Result<()> {
    let (_reader, writer, _temp) = new_test_db().await?;
    let conn = writer.connection();

    assert_eq!(get_market_state_epoch(&conn).await?, None);
    set_market_state(&conn, 4_500_000, "[]").await?;
    assert_eq!(get_market_state_epoch(&conn).await?, Some(4_500_000));

    insert_request(
        &conn,
        "11111111-0000-0000-0000-000000000000",
        1234,
        Utc::now().timestamp_millis(),
        "{\"method\":\"GET\"}",
    )
    .await?;
    annotate_request(
        &conn,
        "11111111-0000-0000-0000-000000000000",
        "{\"error\":\"nope\",\"error_code\":4023}",
    )
    .await?;

    let mut rows = conn
        .query(
            "SELECT JSON_EXTRACT(request_meta, '$.error_code') FROM requests",
            libsql::params![],
        )
        .await?;
    assert_eq!(rows.next().await?.unwrap().get::<i64>(0)?, 4023);
    Ok(())
}
