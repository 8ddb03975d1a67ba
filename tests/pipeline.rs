use anyhow::Result;
use brokkr::database::queries::{insert_proposal, proposals_to_deliver, proposals_to_sign};
use brokkr::database::types::ProposalRow;
use brokkr::fil::ActorId;
use brokkr::fil::market::{ClientDealProposal, DealProposal};
use brokkr::test_utils::{
    MockChain, TenantRules, claim_piece, new_mock_piece_cid, new_test_db, seed_client, seed_piece,
    seed_provider, seed_tenant,
};
use brokkr::{proposer, signer};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

const LOG2: i64 = 35;

async fn seed_reservation(conn: &libsql::Connection, piece_seed: &str) -> Result<String> {
    seed_tenant(conn, TenantRules::permissive(1, 10)).await?;
    let piece = new_mock_piece_cid(piece_seed);
    let piece_id = seed_piece(conn, &piece, LOG2, &piece.to_string()).await?;
    claim_piece(conn, 1, piece_id).await?;
    seed_client(conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;
    seed_provider(conn, 1234, 7, 7).await?;

    let uuid = uuid::Uuid::new_v4().to_string();
    insert_proposal(
        conn,
        ProposalRow::builder()
            .proposal_uuid(uuid.clone())
            .piece_id(piece_id)
            .provider_id(1234)
            .client_id(1442)
            .start_epoch(3_000_000)
            .end_epoch(3_000_000 + 530 * 2880)
            .proxied_log2_size(LOG2)
            .provider_collateral("19382716049382716".to_string())
            .entry_created(Utc::now().timestamp_millis())
            .build(),
    )
    .await?;
    Ok(uuid)
}

#[tokio::test]
async fn signer_is_deterministic_and_idempotent() -> Result<()> {
    let (_reader, writer, _temp) = new_test_db().await?;
    let conn = writer.connection();
    let chain = MockChain::new();

    seed_reservation(&conn, "to-sign").await?;
    assert_eq!(proposals_to_sign(&conn).await?.len(), 1);

    signer::run(CancellationToken::new(), &writer, &chain).await?;

    // the work list drains
    assert!(proposals_to_sign(&conn).await?.is_empty());

    let mut rows = conn
        .query(
            "SELECT signature_obtained,
                    JSON_EXTRACT(proposal_meta, '$.signed_proposal_cid'),
                    JSON_EXTRACT(proposal_meta, '$.signature')
               FROM proposals",
            libsql::params![],
        )
        .await?;
    let row = rows.next().await?.expect("the one reservation");
    assert!(row.get::<Option<i64>>(0)?.is_some());
    let stored_cid: String = row.get::<Option<String>>(1)?.expect("cid recorded");
    let stored_sig: String = row.get::<Option<String>>(2)?.expect("signature recorded");

    // recomputing the signed container off the same stored fields yields the
    // same CID, the round-trip law the tracker relies on
    let pending = proposals_to_deliver(&conn).await?;
    let row = &pending[0];
    let proposal = DealProposal::for_reservation(
        &row.piece_cid,
        row.proposal_label.as_deref(),
        ActorId(row.provider_id as u64),
        ActorId(row.client_id as u64),
        row.start_epoch,
        row.end_epoch,
        row.proxied_log2_size,
        &row.provider_collateral,
    )?;
    let signed = ClientDealProposal {
        proposal,
        client_signature: serde_json::from_str(&stored_sig)?,
    };
    assert_eq!(signed.signed_cid()?.to_string(), stored_cid);

    // a second run has nothing to do and changes nothing
    signer::run(CancellationToken::new(), &writer, &chain).await?;
    let mut rows = conn
        .query(
            "SELECT JSON_EXTRACT(proposal_meta, '$.signed_proposal_cid') FROM proposals",
            libsql::params![],
        )
        .await?;
    let unchanged: String = rows.next().await?.unwrap().get::<Option<String>>(0)?.unwrap();
    assert_eq!(unchanged, stored_cid);
    Ok(())
}

#[tokio::test]
async fn proposer_fails_undialable_reservations() -> Result<()> {
    let (_reader, writer, _temp) = new_test_db().await?;
    let conn = writer.connection();
    let chain = MockChain::new();

    let uuid = seed_reservation(&conn, "to-deliver").await?;
    signer::run(CancellationToken::new(), &writer, &chain).await?;

    // no providers_info row at all: nothing to dial
    proposer::run(
        CancellationToken::new(),
        &writer,
        proposer::ProposeOptions::default(),
    )
    .await?;

    let mut rows = conn
        .query(
            "SELECT proposal_failstamp, JSON_EXTRACT(proposal_meta, '$.failure')
               FROM proposals WHERE proposal_uuid = ?",
            libsql::params![uuid],
        )
        .await?;
    let row = rows.next().await?.unwrap();
    assert!(row.get::<i64>(0)? > 0);
    let failure: String = row.get::<Option<String>>(1)?.expect("failure recorded");
    assert!(failure.contains("not dialable"), "{}", failure);

    // and the failed row never reappears on the delivery list
    assert!(proposals_to_deliver(&conn).await?.is_empty());
    Ok(())
}
