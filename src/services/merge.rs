//! Presence merge: realtime players reconciled with persisted area rows.
//!
//! DESIGN
//! ======
//! Both merge functions are pure: output depends only on the arguments.
//! Entries are keyed by user id in a `BTreeMap`, so output is ordered by user
//! id and identical inputs give identical output.
//!
//! The stable variant hashes nothing; it builds a canonical JSON signature of
//! every field that can affect output (including each persistent row's
//! current staleness, so crossing the TTL recomputes) and hands back the
//! previous `Arc<MergeCache>` untouched when the signature matches. Callers
//! compare with `Arc::ptr_eq` to skip redraws.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::{AreaPresenceRow, MergedPresence, Player, PresenceSource, UNRESOLVED_DISPLAY_NAME};

/// Persistent row staleness. A user with realtime presence is never stale; a
/// row whose heartbeat is missing or unparseable always is.
#[must_use]
pub fn is_presence_row_stale(
    row: &AreaPresenceRow,
    realtime_user_ids: &HashSet<Uuid>,
    stale_ttl_secs: u64,
    now: OffsetDateTime,
) -> bool {
    if realtime_user_ids.contains(&row.user_id) {
        return false;
    }
    let Some(last_seen) = row.last_seen_at else {
        return true;
    };
    let ttl = time::Duration::seconds(i64::try_from(stale_ttl_secs).unwrap_or(i64::MAX));
    now - last_seen > ttl
}

fn realtime_ids(players: &[Player]) -> HashSet<Uuid> {
    players.iter().map(|p| p.id).collect()
}

fn persistent_entry(row: &AreaPresenceRow, stale: bool) -> MergedPresence {
    MergedPresence {
        user_id: row.user_id,
        display_name: row
            .display_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| UNRESOLVED_DISPLAY_NAME.to_owned()),
        avatar_url: row.avatar_url.clone(),
        role: row.role.clone(),
        floor_id: Some(row.floor_id),
        x: row.x,
        y: row.y,
        is_walking: false,
        target_x: None,
        target_y: None,
        status_message: row.status_message.clone(),
        source: PresenceSource::Persistent,
        is_stale: stale,
        last_seen_at: row.last_seen_at,
    }
}

fn overlay(player: &Player, persistent: Option<MergedPresence>) -> MergedPresence {
    let Some(base) = persistent else {
        return MergedPresence {
            user_id: player.id,
            display_name: player.display_name.clone(),
            avatar_url: player.avatar_url.clone(),
            role: player.role.clone(),
            floor_id: player.floor_id,
            x: player.x,
            y: player.y,
            is_walking: player.is_walking,
            target_x: player.target_x,
            target_y: player.target_y,
            status_message: player.status_message.clone(),
            source: PresenceSource::Realtime,
            is_stale: false,
            last_seen_at: None,
        };
    };

    let display_name = if player.has_resolved_name() || base.display_name == UNRESOLVED_DISPLAY_NAME {
        player.display_name.clone()
    } else {
        base.display_name
    };
    MergedPresence {
        user_id: player.id,
        display_name,
        avatar_url: player.avatar_url.clone().or(base.avatar_url),
        role: player.role.clone().or(base.role),
        floor_id: player.floor_id,
        x: player.x,
        y: player.y,
        is_walking: player.is_walking,
        target_x: player.target_x,
        target_y: player.target_y,
        status_message: player.status_message.clone().or(base.status_message),
        source: PresenceSource::Merged,
        is_stale: false,
        last_seen_at: base.last_seen_at,
    }
}

/// Merge persisted rows with realtime players, one entry per user, ordered
/// by user id.
#[must_use]
pub fn merge_workspace_presence(
    area_rows: &[AreaPresenceRow],
    realtime_players: &[Player],
    stale_ttl_secs: u64,
    now: OffsetDateTime,
) -> Vec<MergedPresence> {
    let live = realtime_ids(realtime_players);
    let mut merged: BTreeMap<Uuid, MergedPresence> = BTreeMap::new();

    for row in area_rows {
        // Two active rows for one user: keep the most recent heartbeat.
        if merged
            .get(&row.user_id)
            .is_some_and(|existing| existing.last_seen_at >= row.last_seen_at)
        {
            continue;
        }
        let stale = is_presence_row_stale(row, &live, stale_ttl_secs, now);
        merged.insert(row.user_id, persistent_entry(row, stale));
    }

    for player in realtime_players {
        let base = merged.remove(&player.id);
        merged.insert(player.id, overlay(player, base));
    }

    merged.into_values().collect()
}

// =============================================================================
// STABLE VARIANT
// =============================================================================

/// A merge result and the signature of the inputs that produced it. Treat as
/// immutable; pass it back verbatim.
#[derive(Debug, PartialEq)]
pub struct MergeCache {
    pub signature: String,
    pub result: Arc<Vec<MergedPresence>>,
}

fn timestamp(value: Option<OffsetDateTime>) -> Option<String> {
    value.map(|t| t.unix_timestamp_nanos().to_string())
}

/// Canonical signature of everything that affects merge output. Each entry
/// is a JSON array, so free-text fields cannot bleed into their neighbours.
#[must_use]
pub fn presence_signature(
    area_rows: &[AreaPresenceRow],
    realtime_players: &[Player],
    stale_ttl_secs: u64,
    now: OffsetDateTime,
) -> String {
    let live = realtime_ids(realtime_players);

    let mut rows: Vec<String> = area_rows
        .iter()
        .map(|r| {
            json!([
                r.user_id,
                r.floor_id,
                r.x,
                r.y,
                r.status_message,
                timestamp(r.last_seen_at),
                r.display_name,
                r.avatar_url,
                r.role,
                is_presence_row_stale(r, &live, stale_ttl_secs, now),
            ])
            .to_string()
        })
        .collect();
    rows.sort();

    let mut players: Vec<String> = realtime_players
        .iter()
        .map(|p| {
            json!([
                p.id,
                p.display_name,
                p.avatar_url,
                p.role,
                p.floor_id,
                p.x,
                p.y,
                p.is_walking,
                p.target_x,
                p.target_y,
                p.status_message,
            ])
            .to_string()
        })
        .collect();
    players.sort();

    json!({ "ttl": stale_ttl_secs, "rows": rows, "players": players }).to_string()
}

/// Memoized merge. Returns `previous` itself when the inputs' signature is
/// unchanged, otherwise a fresh cache.
#[must_use]
pub fn merge_workspace_presence_stable(
    area_rows: &[AreaPresenceRow],
    realtime_players: &[Player],
    stale_ttl_secs: u64,
    previous: Option<&Arc<MergeCache>>,
    now: OffsetDateTime,
) -> Arc<MergeCache> {
    let signature = presence_signature(area_rows, realtime_players, stale_ttl_secs, now);
    if let Some(previous) = previous.filter(|p| p.signature == signature) {
        return Arc::clone(previous);
    }
    Arc::new(MergeCache {
        signature,
        result: Arc::new(merge_workspace_presence(area_rows, realtime_players, stale_ttl_secs, now)),
    })
}

#[cfg(test)]
#[path = "merge_test.rs"]
mod tests;
