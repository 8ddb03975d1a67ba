use std::sync::Arc;

use anyhow::Result;
use brokkr::admission::{Outcome, evaluate, sp_ineligible_code, ChainEligibilityCache};
use brokkr::api::types::ErrCode;
use brokkr::chain::CollateralCache;
use brokkr::database::queries::get_provider;
use brokkr::fil::DEFAULT_LOOKBACK_EPOCHS;
use brokkr::test_utils::{
    MockChain, TenantRules, claim_piece, new_mock_piece_cid, new_test_db, seed_client, seed_piece,
    seed_provider, seed_published_deal, seed_tenant,
};

const GIB32_LOG2: i64 = 35;

struct Fixture {
    writer: brokkr::database::Writer,
    _temp: tempfile::TempDir,
    chain: MockChain,
    collateral: CollateralCache,
    lock: tokio::sync::Mutex<()>,
}

impl Fixture {
    async fn new() -> Result<Self> {
        let (_reader, writer, temp) = new_test_db().await?;
        Ok(Fixture {
            writer,
            _temp: temp,
            chain: MockChain::new(),
            collateral: CollateralCache::default(),
            lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn request(
        &self,
        provider_id: i64,
        sector_log2: i64,
        piece_cid: &cid::Cid,
        tenant: i64,
    ) -> Result<Outcome> {
        let conn = self.writer.connection();
        let provider = get_provider(&conn, provider_id).await?.expect("seeded");
        evaluate(
            &conn,
            &self.chain,
            &self.collateral,
            &self.lock,
            &provider,
            sector_log2,
            piece_cid,
            tenant,
            DEFAULT_LOOKBACK_EPOCHS,
        )
        .await
    }
}

#[tokio::test]
async fn grants_last_slot_then_refuses() -> Result<()> {
    let fx = Fixture::new().await?;
    let conn = fx.writer.connection();

    seed_tenant(&conn, TenantRules::permissive(1, 10)).await?;
    let piece = new_mock_piece_cid("pieceA");
    let piece_id = seed_piece(&conn, &piece, GIB32_LOG2, "bafyLabelA").await?;
    claim_piece(&conn, 1, piece_id).await?;
    seed_client(&conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;

    seed_provider(&conn, 1234, 7, 7).await?;
    // nine active replicas elsewhere
    for i in 0..9 {
        let sp = 9000 + i;
        seed_provider(&conn, sp, 100 + i, 100 + i).await?;
        seed_published_deal(&conn, 500 + i, piece_id, sp, 1442, "active").await?;
    }

    match fx.request(1234, GIB32_LOG2, &piece, 0).await? {
        Outcome::Granted { states, .. } => {
            assert_eq!(states.len(), 1);
            assert_eq!(states[0].actual_total, 10);
            assert!(states[0].sp_holds_qualifying_deal);
        }
        other => panic!("expected grant, got {:?}", other),
    }

    // the same SP asking again is refused, one way or the other
    match fx.request(1234, GIB32_LOG2, &piece, 0).await? {
        Outcome::Refused { code, .. } => {
            assert!(
                code == ErrCode::ProviderHasReplica || code == ErrCode::TooManyReplicas,
                "unexpected refusal {:?}",
                code
            );
        }
        other => panic!("expected refusal, got {:?}", other),
    }

    // a fresh SP sees the quota exhausted
    seed_provider(&conn, 5678, 8, 8).await?;
    match fx.request(5678, GIB32_LOG2, &piece, 0).await? {
        Outcome::Refused { code, states, .. } => {
            assert_eq!(code, ErrCode::TooManyReplicas);
            assert_eq!(states[0].actual_total, 10);
        }
        other => panic!("expected refusal, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn refuses_oversized_piece() -> Result<()> {
    let fx = Fixture::new().await?;
    let conn = fx.writer.connection();

    seed_tenant(&conn, TenantRules::permissive(1, 10)).await?;
    let piece = new_mock_piece_cid("pieceB");
    let piece_id = seed_piece(&conn, &piece, GIB32_LOG2, "bafyLabelB").await?;
    claim_piece(&conn, 1, piece_id).await?;
    seed_client(&conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;
    seed_provider(&conn, 1234, 7, 7).await?;

    // 8 GiB sectors cannot hold a 32 GiB piece
    match fx.request(1234, 33, &piece, 0).await? {
        Outcome::Refused { code, message, .. } => {
            assert_eq!(code, ErrCode::OversizedPiece);
            assert!(message.contains("32"), "{}", message);
            assert!(message.contains("8"), "{}", message);
        }
        other => panic!("expected refusal, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn unclaimed_piece_and_empty_datacap() -> Result<()> {
    let fx = Fixture::new().await?;
    let conn = fx.writer.connection();

    seed_tenant(&conn, TenantRules::permissive(1, 10)).await?;
    seed_provider(&conn, 1234, 7, 7).await?;

    let unclaimed = new_mock_piece_cid("nobody-wants-me");
    match fx.request(1234, GIB32_LOG2, &unclaimed, 0).await? {
        Outcome::Refused { code, .. } => assert_eq!(code, ErrCode::UnclaimedPieceCid),
        other => panic!("expected refusal, got {:?}", other),
    }

    // claimed, but the only client has less datacap than the piece size
    let piece = new_mock_piece_cid("pieceC");
    let piece_id = seed_piece(&conn, &piece, GIB32_LOG2, "bafyLabelC").await?;
    claim_piece(&conn, 1, piece_id).await?;
    seed_client(&conn, 1442, 1, Some("1024")).await?;

    match fx.request(1234, GIB32_LOG2, &piece, 0).await? {
        Outcome::Refused { code, .. } => assert_eq!(code, ErrCode::TenantsOutOfDatacap),
        other => panic!("expected refusal, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn exclusive_tenant_does_not_get_bumped() -> Result<()> {
    let fx = Fixture::new().await?;
    let conn = fx.writer.connection();

    seed_tenant(&conn, TenantRules::permissive(1, 10)).await?;
    seed_tenant(
        &conn,
        TenantRules {
            tenant_id: 2,
            max_total: 10,
            max_per_org: 1000,
            max_per_city: 1,
            max_per_country: 1000,
            max_per_continent: 1000,
            max_in_flight_bytes: 1 << 50,
            exclusive: true,
        },
    )
    .await?;

    let piece = new_mock_piece_cid("pieceD");
    let piece_id = seed_piece(&conn, &piece, GIB32_LOG2, "bafyLabelD").await?;
    claim_piece(&conn, 1, piece_id).await?;
    claim_piece(&conn, 2, piece_id).await?;
    seed_client(&conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;
    seed_client(&conn, 1443, 2, Some(&(1u64 << 40).to_string())).await?;

    // T2 already replicated once in city 7, which is its city ceiling
    seed_provider(&conn, 777, 70, 7).await?;
    seed_published_deal(&conn, 600, piece_id, 777, 1443, "active").await?;

    seed_provider(&conn, 1234, 7, 7).await?;
    match fx.request(1234, GIB32_LOG2, &piece, 0).await? {
        Outcome::Granted { states, .. } => {
            assert_eq!(states.len(), 2);
            // T1 took the deal and counts the new replica
            assert_eq!(states[0].tenant_id, 1);
            assert_eq!(states[0].actual_total, 1);
            assert!(states[0].sp_holds_qualifying_deal);
            // T2 is exclusive and not chosen: counts untouched
            assert_eq!(states[1].tenant_id, 2);
            assert_eq!(states[1].actual_total, 1);
            assert!(!states[1].sp_holds_qualifying_deal);
        }
        other => panic!("expected grant, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn in_flight_ceiling_applies() -> Result<()> {
    let fx = Fixture::new().await?;
    let conn = fx.writer.connection();

    seed_tenant(
        &conn,
        TenantRules {
            max_in_flight_bytes: 1 << GIB32_LOG2,
            ..TenantRules::permissive(1, 10)
        },
    )
    .await?;
    let piece_a = new_mock_piece_cid("pieceE");
    let piece_b = new_mock_piece_cid("pieceF");
    let id_a = seed_piece(&conn, &piece_a, GIB32_LOG2, "bafyLabelE").await?;
    let id_b = seed_piece(&conn, &piece_b, GIB32_LOG2, "bafyLabelF").await?;
    claim_piece(&conn, 1, id_a).await?;
    claim_piece(&conn, 1, id_b).await?;
    seed_client(&conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;
    seed_provider(&conn, 1234, 7, 7).await?;

    match fx.request(1234, GIB32_LOG2, &piece_a, 0).await? {
        Outcome::Granted { .. } => {}
        other => panic!("expected grant, got {:?}", other),
    }

    // the first reservation saturates the per-SP in-flight allowance
    match fx.request(1234, GIB32_LOG2, &piece_b, 0).await? {
        Outcome::Refused { code, .. } => assert_eq!(code, ErrCode::ProviderAboveMaxInFlight),
        other => panic!("expected refusal, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn concurrent_requests_grant_exactly_one() -> Result<()> {
    let fx = Arc::new(Fixture::new().await?);
    let conn = fx.writer.connection();

    seed_tenant(&conn, TenantRules::permissive(1, 1)).await?;
    let piece = new_mock_piece_cid("pieceG");
    let piece_id = seed_piece(&conn, &piece, GIB32_LOG2, "bafyLabelG").await?;
    claim_piece(&conn, 1, piece_id).await?;
    seed_client(&conn, 1442, 1, Some(&(1u64 << 40).to_string())).await?;
    seed_provider(&conn, 1001, 11, 11).await?;
    seed_provider(&conn, 1002, 22, 22).await?;

    let a = {
        let fx = fx.clone();
        let piece = piece;
        tokio::spawn(async move { fx.request(1001, GIB32_LOG2, &piece, 0).await })
    };
    let b = {
        let fx = fx.clone();
        let piece = piece;
        tokio::spawn(async move { fx.request(1002, GIB32_LOG2, &piece, 0).await })
    };

    let outcomes = [a.await??, b.await??];
    let grants = outcomes
        .iter()
        .filter(|o| matches!(o, Outcome::Granted { .. }))
        .count();
    let refusals = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                Outcome::Refused {
                    code: ErrCode::TooManyReplicas | ErrCode::ProviderHasReplica,
                    ..
                }
            )
        })
        .count();
    assert_eq!(grants, 1, "exactly one of two concurrent requests wins");
    assert_eq!(refusals, 1);
    Ok(())
}

#[tokio::test]
async fn chain_eligibility_verdicts() -> Result<()> {
    let fx = Fixture::new().await?;
    let conn = fx.writer.connection();
    let cache = ChainEligibilityCache::default();

    // unknown provider: suspended
    let code = sp_ineligible_code(&fx.chain, &cache, None, DEFAULT_LOOKBACK_EPOCHS).await?;
    assert_eq!(code, Some(ErrCode::StorageProviderSuspended));

    seed_provider(&conn, 1234, 7, 7).await?;
    let provider = get_provider(&conn, 1234).await?.unwrap();

    // no base info on chain: not eligible to mine
    let code =
        sp_ineligible_code(&fx.chain, &cache, Some(&provider), DEFAULT_LOOKBACK_EPOCHS).await?;
    assert_eq!(code, Some(ErrCode::StorageProviderIneligibleToMine));

    fx.chain
        .state
        .lock()
        .unwrap()
        .eligible_for_mining
        .insert(1234, true);
    // the previous verdict is TTL-cached, a fresh cache sees the flip
    let fresh = ChainEligibilityCache::default();
    let code =
        sp_ineligible_code(&fx.chain, &fresh, Some(&provider), DEFAULT_LOOKBACK_EPOCHS).await?;
    assert_eq!(code, None);
    Ok(())
}
