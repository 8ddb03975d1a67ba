use libsql::{Connection, Rows, de::from_row, named_params, params};
use serde::de::DeserializeOwned;
use thiserror::Error as ThisError;

use super::types::{
    ClientRow, DeliveryPendingRow, EligiblePieceRow, KnownDealRow, PendingProposalRow,
    PieceSourceRow, ProposalRow, ProviderInfoRow, ProviderRow, PublishedDealRow, SignPendingRow,
    TenantEligibilityRow,
};

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("LibSQL error: {0}")]
    LibSQL(#[from] libsql::Error),
    #[error("Row deserialization error: {0}")]
    RowDeserialization(#[from] serde::de::value::Error),
}

async fn collect<T: DeserializeOwned>(mut rows: Rows) -> Result<Vec<T>, Error> {
    let mut out = vec![];
    while let Some(row) = rows.next().await? {
        out.push(from_row(&row)?);
    }
    Ok(out)
}

async fn maybe_one<T: DeserializeOwned>(mut rows: Rows) -> Result<Option<T>, Error> {
    Ok(rows.next().await?.map(|r| from_row(&r)).transpose()?)
}

//
// request log / auth support
//

pub async fn insert_request(
    conn: &Connection,
    request_uuid: &str,
    provider_id: i64,
    entry_created: i64,
    request_dump: &str,
) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO requests (request_uuid, provider_id, entry_created, request_dump)
         VALUES (?, ?, ?, ?)",
        (request_uuid, provider_id, entry_created, request_dump),
    )
    .await?;
    Ok(())
}

pub async fn annotate_request(
    conn: &Connection,
    request_uuid: &str,
    patch_json: &str,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE requests SET request_meta = JSON_PATCH(request_meta, JSON(:patch))
         WHERE request_uuid = :uuid",
        named_params! { ":patch": patch_json, ":uuid": request_uuid },
    )
    .await?;
    Ok(())
}

/// Epoch of the last tracker reconciliation, surfaced on every response.
pub async fn get_market_state_epoch(conn: &Connection) -> Result<Option<i64>, Error> {
    let mut rows = conn
        .query(
            "SELECT JSON_EXTRACT(metadata, '$.market_state.epoch') FROM global WHERE singleton_id = 1",
            params![],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<Option<i64>>(0)?),
        None => Ok(None),
    }
}

pub async fn set_market_state(
    conn: &Connection,
    epoch: i64,
    tipset_key_json: &str,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE global SET metadata = JSON_SET(
            metadata,
            '$.market_state',
            JSON_OBJECT('epoch', :epoch, 'tipset_key', JSON(:tsk))
        ) WHERE singleton_id = 1",
        named_params! { ":epoch": epoch, ":tsk": tipset_key_json },
    )
    .await?;
    Ok(())
}

pub async fn get_provider(conn: &Connection, provider_id: i64) -> Result<Option<ProviderRow>, Error> {
    let rows = conn
        .query(
            "SELECT provider_id, org_id, city_id, country_id, continent_id,
                    globally_inactivated, ignore_chain_eligibility, max_in_flight_bytes_override
               FROM providers
              WHERE provider_id = ?",
            params![provider_id],
        )
        .await?;
    maybe_one(rows).await
}

pub async fn get_provider_info(
    conn: &Connection,
    provider_id: i64,
) -> Result<Option<ProviderInfoRow>, Error> {
    let rows = conn
        .query(
            "SELECT provider_id, provider_last_polled, info_dialing_took_msecs,
                    info_dialing_peerid, info
               FROM providers_info
              WHERE provider_id = ?",
            params![provider_id],
        )
        .await?;
    maybe_one(rows).await
}

//
// admission
//

/// The distinct providers currently holding an active-or-pending replica of
/// the piece for the tenant under evaluation. Active deals exclude their
/// originating proposal via `activated_deal_id`, so the UNION dedup is what
/// keeps published-but-undelivered pairs from counting twice.
const REPLICA_HOLDERS: &str = "
    SELECT pd.provider_id AS provider_id
      FROM published_deals pd
      JOIN clients c ON c.client_id = pd.client_id
     WHERE pd.piece_id = p.piece_id
       AND c.tenant_id = t.tenant_id
       AND pd.status != 'terminated'
     UNION
    SELECT pr.provider_id AS provider_id
      FROM proposals pr
      JOIN clients c ON c.client_id = pr.client_id
     WHERE pr.piece_id = p.piece_id
       AND c.tenant_id = t.tenant_id
       AND pr.proposal_failstamp = 0
       AND pr.activated_deal_id IS NULL
";

/// The single pure evaluation statement behind `request_piece`: one row per
/// tenant with a claim to the piece, carrying everything the admission
/// decision needs. Must run inside the reservation critical section.
pub async fn piece_eligibility(
    conn: &Connection,
    provider: &ProviderRow,
    piece_cid: &str,
    tenant_filter: i64,
    cur_epoch: i64,
) -> Result<Vec<TenantEligibilityRow>, Error> {
    let sql = format!(
        "
        SELECT
            t.tenant_id,
            t.exclusive_replication,
            t.deal_duration_days,
            t.start_within_hours,
            p.piece_id,
            p.piece_log2_size,
            p.proposal_label,
            t.max_total,
            t.max_per_org,
            t.max_per_city,
            t.max_per_country,
            t.max_per_continent,
            COALESCE(:max_in_flight_override, t.max_in_flight_bytes) AS max_in_flight_bytes,
            (SELECT COUNT(*) FROM ({rh}) rx) AS cur_total,
            (SELECT COUNT(*) FROM ({rh}) rx
               JOIN providers pv ON pv.provider_id = rx.provider_id
              WHERE pv.org_id = :org_id) AS cur_in_org,
            (SELECT COUNT(*) FROM ({rh}) rx
               JOIN providers pv ON pv.provider_id = rx.provider_id
              WHERE pv.city_id = :city_id) AS cur_in_city,
            (SELECT COUNT(*) FROM ({rh}) rx
               JOIN providers pv ON pv.provider_id = rx.provider_id
              WHERE pv.country_id = :country_id) AS cur_in_country,
            (SELECT COUNT(*) FROM ({rh}) rx
               JOIN providers pv ON pv.provider_id = rx.provider_id
              WHERE pv.continent_id = :continent_id) AS cur_in_continent,
            (SELECT COALESCE(SUM(1 << pr.proxied_log2_size), 0)
               FROM proposals pr
               JOIN clients c ON c.client_id = pr.client_id
              WHERE pr.provider_id = :provider_id
                AND c.tenant_id = t.tenant_id
                AND pr.proposal_failstamp = 0
                AND pr.activated_deal_id IS NULL) AS cur_in_flight_bytes,
            (EXISTS (SELECT 1 FROM published_deals pd
                       JOIN clients c ON c.client_id = pd.client_id
                      WHERE pd.piece_id = p.piece_id
                        AND pd.provider_id = :provider_id
                        AND c.tenant_id = t.tenant_id
                        AND pd.status != 'terminated')
             OR EXISTS (SELECT 1 FROM proposals pr
                       JOIN clients c ON c.client_id = pr.client_id
                      WHERE pr.piece_id = p.piece_id
                        AND pr.provider_id = :provider_id
                        AND c.tenant_id = t.tenant_id
                        AND pr.proposal_failstamp = 0)) AS deal_already_exists,
            (SELECT c.client_id FROM clients c
              WHERE c.tenant_id = t.tenant_id
                AND c.activatable_datacap IS NOT NULL
                AND CAST(c.activatable_datacap AS INTEGER) >= (1 << p.piece_log2_size)
              ORDER BY CAST(c.activatable_datacap AS INTEGER) DESC, c.client_id
              LIMIT 1) AS client_id_to_use,
            (SELECT c.client_address FROM clients c
              WHERE c.tenant_id = t.tenant_id
                AND c.activatable_datacap IS NOT NULL
                AND CAST(c.activatable_datacap AS INTEGER) >= (1 << p.piece_log2_size)
              ORDER BY CAST(c.activatable_datacap AS INTEGER) DESC, c.client_id
              LIMIT 1) AS client_address_to_use,
            (SELECT pr.start_epoch FROM proposals pr
               JOIN clients c ON c.client_id = pr.client_id
              WHERE pr.piece_id = p.piece_id
                AND c.tenant_id = t.tenant_id
                AND pr.proposal_failstamp = 0
                AND pr.start_epoch > :cur_epoch
              ORDER BY pr.entry_created DESC
              LIMIT 1) AS recently_used_start_epoch
        FROM tenant_pieces tp
        JOIN tenants t ON t.tenant_id = tp.tenant_id
        JOIN pieces p ON p.piece_id = tp.piece_id
        WHERE p.piece_cid = :piece_cid
          AND p.proposal_label IS NOT NULL
          AND (:tenant_filter = 0 OR t.tenant_id = :tenant_filter)
        ORDER BY t.tenant_id
        ",
        rh = REPLICA_HOLDERS,
    );

    let rows = conn
        .query(
            &sql,
            named_params! {
                ":piece_cid": piece_cid,
                ":tenant_filter": tenant_filter,
                ":provider_id": provider.provider_id,
                ":org_id": provider.org_id,
                ":city_id": provider.city_id,
                ":country_id": provider.country_id,
                ":continent_id": provider.continent_id,
                ":max_in_flight_override": provider.max_in_flight_bytes_override,
                ":cur_epoch": cur_epoch,
            },
        )
        .await?;
    collect(rows).await
}

pub async fn insert_proposal(conn: &Connection, row: ProposalRow) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO proposals
            (proposal_uuid, piece_id, provider_id, client_id, start_epoch, end_epoch,
             proxied_log2_size, provider_collateral, entry_created)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            row.proposal_uuid,
            row.piece_id,
            row.provider_id,
            row.client_id,
            row.start_epoch,
            row.end_epoch,
            row.proxied_log2_size,
            row.provider_collateral,
            row.entry_created,
        ),
    )
    .await?;
    Ok(())
}

//
// SP-facing listings
//

const PIECE_HAS_ACTIVE_SOURCES: &str = "
    EXISTS (SELECT 1 FROM published_deals pds
             WHERE pds.piece_id = p.piece_id
               AND pds.status = 'active'
               AND pds.decoded_label IS NOT NULL)
";

/// Listing used by `/sp/eligible_pieces`. The head variant trusts the
/// total-count guard alone and cuts off early; the full variant applies
/// every per-granularity ceiling, which costs one correlated scan each.
#[allow(clippy::too_many_arguments)]
pub async fn eligible_pieces(
    conn: &Connection,
    provider: &ProviderRow,
    sector_log2_size: i64,
    tenant_filter: i64,
    include_sourceless: bool,
    orglocal_only: bool,
    full_scan: bool,
    limit_plus_one: i64,
) -> Result<Vec<EligiblePieceRow>, Error> {
    let granular_guards = if full_scan {
        format!(
            "
            AND (SELECT COUNT(*) FROM ({rh}) rx
                   JOIN providers pv ON pv.provider_id = rx.provider_id
                  WHERE pv.org_id = :org_id) < t.max_per_org
            AND (SELECT COUNT(*) FROM ({rh}) rx
                   JOIN providers pv ON pv.provider_id = rx.provider_id
                  WHERE pv.city_id = :city_id) < t.max_per_city
            AND (SELECT COUNT(*) FROM ({rh}) rx
                   JOIN providers pv ON pv.provider_id = rx.provider_id
                  WHERE pv.country_id = :country_id) < t.max_per_country
            AND (SELECT COUNT(*) FROM ({rh}) rx
                   JOIN providers pv ON pv.provider_id = rx.provider_id
                  WHERE pv.continent_id = :continent_id) < t.max_per_continent
            ",
            rh = REPLICA_HOLDERS,
        )
    } else {
        String::new()
    };

    let sourceless_guard = if include_sourceless {
        ""
    } else {
        "AND has_sources_fil_active"
    };

    let orglocal_guard = if orglocal_only {
        "AND EXISTS (SELECT 1 FROM published_deals pdo
                       JOIN providers pvo ON pvo.provider_id = pdo.provider_id
                      WHERE pdo.piece_id = p.piece_id
                        AND pdo.status = 'active'
                        AND pvo.org_id = :org_id)"
    } else {
        ""
    };

    let sql = format!(
        "
        SELECT piece_id, piece_cid, piece_log2_size, tenant_ids, has_sources_fil_active
        FROM (
            SELECT
                p.piece_id,
                p.piece_cid,
                p.piece_log2_size,
                GROUP_CONCAT(t.tenant_id) AS tenant_ids,
                ({has_sources}) AS has_sources_fil_active
            FROM tenant_pieces tp
            JOIN tenants t ON t.tenant_id = tp.tenant_id
            JOIN pieces p ON p.piece_id = tp.piece_id
            WHERE p.proposal_label IS NOT NULL
              {orglocal_guard}
              AND p.piece_log2_size <= :sector_log2_size
              AND (:tenant_filter = 0 OR t.tenant_id = :tenant_filter)
              AND NOT EXISTS (SELECT 1 FROM published_deals pd
                               WHERE pd.piece_id = p.piece_id
                                 AND pd.provider_id = :provider_id
                                 AND pd.status != 'terminated')
              AND NOT EXISTS (SELECT 1 FROM proposals pr
                               WHERE pr.piece_id = p.piece_id
                                 AND pr.provider_id = :provider_id
                                 AND pr.proposal_failstamp = 0)
              AND EXISTS (SELECT 1 FROM clients c
                           WHERE c.tenant_id = t.tenant_id
                             AND c.activatable_datacap IS NOT NULL
                             AND CAST(c.activatable_datacap AS INTEGER) >= (1 << p.piece_log2_size))
              AND (SELECT COUNT(*) FROM ({rh}) rx) < t.max_total
              {granular_guards}
            GROUP BY p.piece_id
        )
        WHERE 1 {sourceless_guard}
        ORDER BY piece_id
        LIMIT :limit_plus_one
        ",
        has_sources = PIECE_HAS_ACTIVE_SOURCES,
        rh = REPLICA_HOLDERS,
        granular_guards = granular_guards,
        sourceless_guard = sourceless_guard,
        orglocal_guard = orglocal_guard,
    );

    // only bind names the assembled SQL actually mentions
    let mut params: Vec<(String, libsql::Value)> = vec![
        (":provider_id".into(), provider.provider_id.into()),
        (":sector_log2_size".into(), sector_log2_size.into()),
        (":tenant_filter".into(), tenant_filter.into()),
        (":limit_plus_one".into(), limit_plus_one.into()),
    ];
    if full_scan {
        params.push((":city_id".into(), provider.city_id.into()));
        params.push((":country_id".into(), provider.country_id.into()));
        params.push((":continent_id".into(), provider.continent_id.into()));
    }
    if full_scan || orglocal_only {
        params.push((":org_id".into(), provider.org_id.into()));
    }

    let rows = conn.query(&sql, params).await?;
    collect(rows).await
}

pub async fn pending_proposals(
    conn: &Connection,
    provider_id: i64,
    min_start_epoch: i64,
    failstamp_cutoff: i64,
) -> Result<Vec<PendingProposalRow>, Error> {
    let rows = conn
        .query(
            "
            SELECT
                pr.proposal_uuid,
                pr.piece_id,
                p.piece_cid,
                JSON_EXTRACT(pr.proposal_meta, '$.signed_proposal_cid') AS proposal_cid,
                pr.start_epoch,
                pr.client_id,
                c.tenant_id,
                pr.proxied_log2_size AS piece_log2_size,
                pr.proposal_delivered,
                pr.proposal_failstamp,
                JSON_EXTRACT(pr.proposal_meta, '$.failure') AS error,
                (EXISTS (SELECT 1 FROM published_deals pd
                          WHERE pd.piece_id = pr.piece_id
                            AND pd.provider_id = pr.provider_id
                            AND pd.client_id = pr.client_id
                            AND pd.status = 'published')) AS is_published,
                (EXISTS (SELECT 1 FROM published_deals pds
                          WHERE pds.piece_id = pr.piece_id
                            AND pds.status = 'active'
                            AND pds.decoded_label IS NOT NULL)) AS has_sources_fil_active
            FROM proposals pr
            JOIN pieces p ON p.piece_id = pr.piece_id
            JOIN clients c ON c.client_id = pr.client_id
            WHERE pr.provider_id = :provider_id
              AND pr.start_epoch > :min_start_epoch
              AND pr.activated_deal_id IS NULL
              AND (pr.proposal_failstamp = 0 OR pr.proposal_failstamp > :failstamp_cutoff)
            ORDER BY
                pr.proposal_failstamp DESC,
                (pr.start_epoch / 360),
                pr.proxied_log2_size,
                p.piece_cid
            ",
            named_params! {
                ":provider_id": provider_id,
                ":min_start_epoch": min_start_epoch,
                ":failstamp_cutoff": failstamp_cutoff,
            },
        )
        .await?;
    collect(rows).await
}

/// Best active retrieval source per piece: FilPlus first, furthest expiry,
/// then lowest deal id as the tie breaker.
pub async fn piece_sources(
    conn: &Connection,
    piece_ids: &[i64],
    org_filter: i64,
) -> Result<Vec<PieceSourceRow>, Error> {
    if piece_ids.is_empty() {
        return Ok(vec![]);
    }
    let id_list = piece_ids
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "
        SELECT pd.piece_id, pd.deal_id, pd.end_epoch, pd.provider_id, pd.is_filplus, pd.decoded_label
          FROM published_deals pd
          JOIN providers pv ON pv.provider_id = pd.provider_id
         WHERE pd.status = 'active'
           AND pd.decoded_label IS NOT NULL
           AND pd.piece_id IN ({})
           AND (:org_filter = 0 OR pv.org_id = :org_filter)
         ORDER BY pd.piece_id, pd.is_filplus DESC, pd.end_epoch DESC, pd.deal_id
        ",
        id_list,
    );
    let rows = conn
        .query(&sql, named_params! { ":org_filter": org_filter })
        .await?;
    collect(rows).await
}

//
// poller
//

pub async fn providers_to_poll(
    conn: &Connection,
    requery_all: bool,
    recent_request_cutoff: i64,
    stale_cutoff: i64,
    random_cutoff: i64,
    proposal_protocol: &str,
) -> Result<Vec<i64>, Error> {
    let mut rows = conn
        .query(
            "
            SELECT p.provider_id
              FROM providers p
              LEFT JOIN providers_info pi ON pi.provider_id = p.provider_id
             WHERE :requery_all
                OR (
                    EXISTS (SELECT 42 FROM requests r
                             WHERE r.provider_id = p.provider_id
                               AND r.entry_created > :recent_request_cutoff)
                    AND (
                        pi.provider_last_polled IS NULL
                        OR pi.provider_last_polled < :stale_cutoff
                        OR JSON_EXTRACT(pi.info, '$.peer_info.libp2p_protocols.\"' || :proto || '\"') IS NULL
                    )
                )
            UNION
            SELECT provider_id FROM (
                SELECT p2.provider_id AS provider_id
                  FROM providers p2
                  LEFT JOIN providers_info pi2 ON pi2.provider_id = p2.provider_id
                 WHERE pi2.provider_last_polled IS NULL
                    OR pi2.provider_last_polled < :random_cutoff
                 ORDER BY RANDOM()
                 LIMIT 50
            )
            ",
            named_params! {
                ":requery_all": requery_all as i64,
                ":recent_request_cutoff": recent_request_cutoff,
                ":stale_cutoff": stale_cutoff,
                ":random_cutoff": random_cutoff,
                ":proto": proposal_protocol,
            },
        )
        .await?;
    let mut out = vec![];
    while let Some(row) = rows.next().await? {
        out.push(row.get::<i64>(0)?);
    }
    Ok(out)
}

pub async fn upsert_provider_info(
    conn: &Connection,
    provider_id: i64,
    polled_at: i64,
    dialing_took_msecs: Option<i64>,
    dialing_peerid: Option<String>,
    info_json: &str,
) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO providers_info
            (provider_id, provider_last_polled, info_dialing_took_msecs, info_dialing_peerid, info)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (provider_id) DO UPDATE SET
            provider_last_polled = EXCLUDED.provider_last_polled,
            info_dialing_took_msecs = EXCLUDED.info_dialing_took_msecs,
            info_dialing_peerid = EXCLUDED.info_dialing_peerid,
            info = EXCLUDED.info",
        (
            provider_id,
            polled_at,
            dialing_took_msecs,
            dialing_peerid,
            info_json,
        ),
    )
    .await?;
    Ok(())
}

//
// signer
//

pub async fn proposals_to_sign(conn: &Connection) -> Result<Vec<SignPendingRow>, Error> {
    let rows = conn
        .query(
            "
            SELECT
                pr.proposal_uuid,
                p.piece_cid,
                p.proposal_label,
                pr.provider_id,
                pr.client_id,
                c.client_address,
                pr.start_epoch,
                pr.end_epoch,
                pr.proxied_log2_size,
                pr.provider_collateral
            FROM proposals pr
            JOIN pieces p ON p.piece_id = pr.piece_id
            JOIN clients c ON c.client_id = pr.client_id
            WHERE pr.signature_obtained IS NULL
              AND pr.proposal_failstamp = 0
            ORDER BY pr.entry_created
            ",
            params![],
        )
        .await?;
    collect(rows).await
}

pub async fn record_signature(
    conn: &Connection,
    proposal_uuid: &str,
    signed_at: i64,
    signature_json: &str,
    signed_proposal_cid: &str,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE proposals SET
            signature_obtained = :signed_at,
            proposal_meta = JSON_SET(
                JSON_SET(proposal_meta, '$.signature', JSON(:sig)),
                '$.signed_proposal_cid',
                :cid
            )
         WHERE proposal_uuid = :uuid",
        named_params! {
            ":signed_at": signed_at,
            ":sig": signature_json,
            ":cid": signed_proposal_cid,
            ":uuid": proposal_uuid,
        },
    )
    .await?;
    Ok(())
}

//
// proposer
//

pub async fn proposals_to_deliver(conn: &Connection) -> Result<Vec<DeliveryPendingRow>, Error> {
    let rows = conn
        .query(
            "
            SELECT
                pr.proposal_uuid,
                p.piece_cid,
                p.proposal_label,
                pr.provider_id,
                pr.client_id,
                pr.start_epoch,
                pr.end_epoch,
                pr.proxied_log2_size,
                pr.provider_collateral,
                JSON_EXTRACT(pr.proposal_meta, '$.signature') AS signature,
                JSON_EXTRACT(pr.proposal_meta, '$.signed_proposal_cid') AS signed_proposal_cid,
                JSON_EXTRACT(pi.info, '$.peerid') AS peer_id,
                JSON_EXTRACT(pi.info, '$.multiaddrs') AS multiaddrs
            FROM proposals pr
            JOIN pieces p ON p.piece_id = pr.piece_id
            LEFT JOIN providers_info pi ON pi.provider_id = pr.provider_id
            WHERE pr.proposal_delivered IS NULL
              AND pr.signature_obtained IS NOT NULL
              AND pr.proposal_failstamp = 0
            ORDER BY pr.entry_created
            ",
            params![],
        )
        .await?;
    collect(rows).await
}

pub async fn fail_proposal(
    conn: &Connection,
    proposal_uuid: &str,
    failstamp: i64,
    reason: &str,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE proposals SET
            proposal_failstamp = :stamp,
            proposal_meta = JSON_SET(proposal_meta, '$.failure', :reason)
         WHERE proposal_uuid = :uuid
           AND proposal_failstamp = 0",
        named_params! {
            ":stamp": failstamp,
            ":reason": reason,
            ":uuid": proposal_uuid,
        },
    )
    .await?;
    Ok(())
}

pub async fn record_delivery_diagnostics(
    conn: &Connection,
    proposal_uuid: &str,
    dialing_peerid: Option<String>,
    dial_took_msecs: Option<i64>,
    proposal_took_msecs: Option<i64>,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE proposals SET
            proposal_meta = JSON_SET(
                proposal_meta,
                '$.dialing_peerid', :peerid,
                '$.dial_took_msecs', :dial_msecs,
                '$.proposal_took_msecs', :proposal_msecs
            )
         WHERE proposal_uuid = :uuid",
        named_params! {
            ":peerid": dialing_peerid,
            ":dial_msecs": dial_took_msecs,
            ":proposal_msecs": proposal_took_msecs,
            ":uuid": proposal_uuid,
        },
    )
    .await?;
    Ok(())
}

pub async fn mark_delivered(
    conn: &Connection,
    proposal_uuid: &str,
    delivered_at: i64,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE proposals SET proposal_delivered = :at WHERE proposal_uuid = :uuid",
        named_params! { ":at": delivered_at, ":uuid": proposal_uuid },
    )
    .await?;
    Ok(())
}

//
// tracker
//

pub async fn affiliated_clients(conn: &Connection) -> Result<Vec<ClientRow>, Error> {
    let rows = conn
        .query(
            "SELECT client_id, client_address, tenant_id FROM clients WHERE is_affiliated",
            params![],
        )
        .await?;
    collect(rows).await
}

pub async fn known_pieces(conn: &Connection) -> Result<Vec<(i64, String)>, Error> {
    let mut rows = conn
        .query("SELECT piece_id, piece_cid FROM pieces", params![])
        .await?;
    let mut out = vec![];
    while let Some(row) = rows.next().await? {
        out.push((row.get::<i64>(0)?, row.get::<String>(1)?));
    }
    Ok(out)
}

pub async fn known_deals(conn: &Connection) -> Result<Vec<KnownDealRow>, Error> {
    let rows = conn
        .query(
            "SELECT deal_id, piece_id, status FROM published_deals",
            params![],
        )
        .await?;
    collect(rows).await
}

pub async fn upsert_published_deal(conn: &Connection, d: &PublishedDealRow) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO published_deals
            (deal_id, client_id, provider_id, piece_id, label, decoded_label, is_filplus,
             status, status_meta, start_epoch, end_epoch, sector_start_epoch,
             termination_detection_time)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (deal_id) DO UPDATE SET
            status = EXCLUDED.status,
            status_meta = EXCLUDED.status_meta,
            sector_start_epoch = COALESCE(EXCLUDED.sector_start_epoch, published_deals.sector_start_epoch),
            termination_detection_time = EXCLUDED.termination_detection_time",
        (
            d.deal_id,
            d.client_id,
            d.provider_id,
            d.piece_id,
            d.label.clone(),
            d.decoded_label.clone(),
            d.is_filplus,
            d.status.clone(),
            d.status_meta.clone(),
            d.start_epoch,
            d.end_epoch,
            d.sector_start_epoch,
            d.termination_detection_time,
        ),
    )
    .await?;
    Ok(())
}

/// Back-links an activated deal to the reservation that produced it. Only a
/// delivered, unfailed, not-yet-linked reservation with the same
/// piece/provider/client triple qualifies.
pub async fn link_activated_deal(
    conn: &Connection,
    deal_id: i64,
    piece_id: i64,
    provider_id: i64,
    client_id: i64,
) -> Result<u64, Error> {
    Ok(conn
        .execute(
            "UPDATE proposals SET activated_deal_id = :deal_id
             WHERE proposal_failstamp = 0
               AND proposal_delivered IS NOT NULL
               AND activated_deal_id IS NULL
               AND piece_id = :piece_id
               AND provider_id = :provider_id
               AND client_id = :client_id",
            named_params! {
                ":deal_id": deal_id,
                ":piece_id": piece_id,
                ":provider_id": provider_id,
                ":client_id": client_id,
            },
        )
        .await?)
}

pub async fn terminate_gone_deals(
    conn: &Connection,
    deal_ids: &[i64],
    detection_time: i64,
) -> Result<(), Error> {
    if deal_ids.is_empty() {
        return Ok(());
    }
    let id_list = deal_ids
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");
    conn.execute(
        &format!(
            "UPDATE published_deals SET
                status = 'terminated',
                status_meta = 'deal no longer part of market-actor state',
                termination_detection_time = {}
             WHERE deal_id IN ({})
               AND status != 'terminated'",
            detection_time, id_list,
        ),
        params![],
    )
    .await?;
    Ok(())
}

pub async fn update_client_address(
    conn: &Connection,
    client_id: i64,
    address: &str,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE clients SET client_address = ? WHERE client_id = ?",
        (address, client_id),
    )
    .await?;
    Ok(())
}

pub async fn update_client_datacap(
    conn: &Connection,
    client_id: i64,
    datacap: Option<String>,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE clients SET activatable_datacap = ? WHERE client_id = ?",
        (datacap, client_id),
    )
    .await?;
    Ok(())
}

pub async fn mark_active_piece_sizes_proven(conn: &Connection) -> Result<(), Error> {
    conn.execute(
        "UPDATE pieces SET size_proven_correct = 1
         WHERE size_proven_correct = 0
           AND piece_id IN (SELECT piece_id FROM published_deals WHERE status = 'active')",
        params![],
    )
    .await?;
    Ok(())
}

/// Reservations whose start window elapsed with no activation will never
/// make it on chain.
pub async fn fail_overdue_proposals(
    conn: &Connection,
    failstamp: i64,
    start_epoch_cutoff: i64,
) -> Result<u64, Error> {
    Ok(conn
        .execute(
            "UPDATE proposals SET
                proposal_failstamp = :stamp,
                proposal_meta = JSON_SET(
                    proposal_meta,
                    '$.failure',
                    'proposal start epoch ' || start_epoch || ' reached without activation'
                )
             WHERE proposal_failstamp = 0
               AND activated_deal_id IS NULL
               AND start_epoch < :cutoff",
            named_params! { ":stamp": failstamp, ":cutoff": start_epoch_cutoff },
        )
        .await?)
}

pub async fn fail_proposals_of_terminated_deals(
    conn: &Connection,
    failstamp: i64,
) -> Result<u64, Error> {
    Ok(conn
        .execute(
            "UPDATE proposals SET
                proposal_meta = JSON_SET(
                    proposal_meta,
                    '$.failure',
                    'sector containing deal ' || activated_deal_id || ' terminated'
                ),
                proposal_failstamp = :stamp,
                activated_deal_id = NULL
             WHERE activated_deal_id IN
                (SELECT deal_id FROM published_deals WHERE status = 'terminated')",
            named_params! { ":stamp": failstamp },
        )
        .await?)
}
