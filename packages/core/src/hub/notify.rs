//! Typed publishers for entity change events.
//!
//! Every entity update goes to the entity's own topic (`game/<id>`) and to
//! the collection topic (`games`), with the same payload on both.

use chrono::Utc;
use serde_json::{json, Value};

use super::BroadcastHub;

/// Topic for system-wide notices.
pub const SYSTEM_TOPIC: &str = "system";

async fn entity_updated(
    hub: &BroadcastHub,
    entity: &str,
    collection: &str,
    id: &str,
    data: &Value,
) -> usize {
    let mut payload = serde_json::Map::new();
    payload.insert("type".to_string(), json!(format!("{}_update", entity)));
    payload.insert(format!("{}_id", entity), json!(id));
    payload.insert("data".to_string(), data.clone());
    let payload = Value::Object(payload);

    hub.publish(&format!("{}/{}", entity, id), &payload).await
        + hub.publish(collection, &payload).await
}

/// Publish a projection change to `projection/<id>` and `projections`.
pub async fn projection_updated(hub: &BroadcastHub, projection_id: &str, data: &Value) -> usize {
    entity_updated(hub, "projection", "projections", projection_id, data).await
}

/// Publish a game change to `game/<id>` and `games`.
pub async fn game_updated(hub: &BroadcastHub, game_id: &str, data: &Value) -> usize {
    entity_updated(hub, "game", "games", game_id, data).await
}

/// Publish a player change to `player/<id>` and `players`.
pub async fn player_updated(hub: &BroadcastHub, player_id: &str, data: &Value) -> usize {
    entity_updated(hub, "player", "players", player_id, data).await
}

/// One bulk message on `projections`, then a per-projection update for every
/// item carrying an `id`.
pub async fn projections_bulk_updated(hub: &BroadcastHub, projections: &[Value]) -> usize {
    let mut delivered = hub
        .publish(
            "projections",
            json!({ "type": "bulk_projections_update", "data": projections }),
        )
        .await;

    for projection in projections {
        let id = match projection.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => continue,
        };
        delivered += hub
            .publish(
                &format!("projection/{}", id),
                json!({ "type": "projection_update", "projection_id": id, "data": projection }),
            )
            .await;
    }
    delivered
}

/// System notice, either to the listed clients directly or to `system`.
pub async fn system_notification(
    hub: &BroadcastHub,
    message: &str,
    level: &str,
    targets: Option<&[String]>,
) -> usize {
    let payload = json!({
        "type": "system_notification",
        "message": message,
        "level": level,
        "timestamp": Utc::now().to_rfc3339(),
    });

    match targets {
        Some(clients) => {
            let mut delivered = 0;
            for client_id in clients {
                if hub.send_direct(client_id, &payload).await {
                    delivered += 1;
                }
            }
            delivered
        }
        None => hub.publish(SYSTEM_TOPIC, &payload).await,
    }
}
