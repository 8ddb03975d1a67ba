use anyhow::Result;
use base64::prelude::*;
use brokkr::auth::{AuthCaches, check_epoch_window, parse_header, verify_challenge};
use brokkr::chain::types::MinerInfo;
use brokkr::fil::wall_time_epoch;
use brokkr::test_utils::MockChain;
use chrono::Utc;

fn header_for(epoch: i64, actor: &str, sig: &[u8], arg: Option<&[u8]>) -> String {
    let mut h = format!(
        "FIL-SPID-V0 {};{};{}",
        epoch,
        actor,
        BASE64_STANDARD.encode(sig)
    );
    if let Some(arg) = arg {
        h.push(';');
        h.push_str(&BASE64_STANDARD.encode(arg));
    }
    h
}

fn mock_chain_with_worker(epoch: i64) -> MockChain {
    let chain = MockChain::new();
    {
        let mut state = chain.state.lock().unwrap();
        state.beacons.insert(epoch, b"drand round bytes".to_vec());
        state.miner_infos.insert(
            1234,
            MinerInfo {
                worker: "f0999".to_string(),
                peer_id: None,
                multiaddrs: None,
                sector_size: 1 << 35,
            },
        );
        state
            .account_keys
            .insert("f0999".to_string(), "f3worker".to_string());
    }
    chain
}

#[tokio::test]
async fn accepts_valid_signature_within_window() -> Result<()> {
    let epoch = wall_time_epoch(Utc::now());
    let chain = mock_chain_with_worker(epoch);
    let caches = AuthCaches::default();

    let header = header_for(epoch, "f01234", b"some-bls-signature", Some(b"extra"));
    let challenge = parse_header(&header).expect("well-formed header");
    check_epoch_window(&challenge).expect("current epoch is inside the window");

    let verdict = verify_challenge(&chain, &caches, &challenge, b"extra").await?;
    assert!(verdict.is_none(), "expected acceptance, got {:?}", verdict);
    Ok(())
}

#[tokio::test]
async fn rejects_bad_signature_but_never_caches_chain_errors() -> Result<()> {
    let epoch = wall_time_epoch(Utc::now());
    let chain = mock_chain_with_worker(epoch);
    chain.state.lock().unwrap().wallet_verify_result = false;
    let caches = AuthCaches::default();

    let header = header_for(epoch, "f01234", b"wrong", None);
    let challenge = parse_header(&header).unwrap();
    let verdict = verify_challenge(&chain, &caches, &challenge, b"").await?;
    assert!(verdict.is_some());
    assert!(verdict.unwrap().contains("signature validation failed"));

    // a chain hiccup must surface as an error, not a cached rejection
    let missing_beacon = header_for(epoch - 1, "f01234", b"sig", None);
    let challenge = parse_header(&missing_beacon).unwrap();
    assert!(
        verify_challenge(&chain, &caches, &challenge, b"")
            .await
            .is_err()
    );
    assert!(caches.cached_verdict(&missing_beacon).is_none());
    Ok(())
}

#[tokio::test]
async fn epoch_window_boundaries() {
    let cur = wall_time_epoch(Utc::now());

    // S5: four epochs stale is one too many
    let stale = parse_header(&header_for(cur - 4, "f01234", b"sig", None)).unwrap();
    assert!(check_epoch_window(&stale).is_err());

    let edge = parse_header(&header_for(cur - 3, "f01234", b"sig", None)).unwrap();
    assert!(check_epoch_window(&edge).is_ok());

    let future = parse_header(&header_for(cur + 2, "f01234", b"sig", None)).unwrap();
    assert!(check_epoch_window(&future).is_err());
}

#[test]
fn verdict_cache_round_trip() {
    let caches = AuthCaches::default();
    let header = "FIL-SPID-V0 99;f01;c2ln";
    assert!(caches.cached_verdict(header).is_none());
    caches.store_verdict(header, None);
    assert_eq!(caches.cached_verdict(header), Some(None));
    caches.store_verdict(header, Some("nope".to_string()));
    assert_eq!(caches.cached_verdict(header), Some(Some("nope".to_string())));
}
