//! Routes decoded client envelopes to hub operations.

use realm_common::ConnectionId;

use super::events::{Envelope, EventType};
use super::hub::HubHandle;
use super::registry::{Group, Target};

/// Act on one inbound envelope from `conn_id`, authenticated as `user_id`.
///
/// Envelopes that lack the id their type needs, and unknown types, are
/// logged and dropped.
pub fn dispatch(hub: &HubHandle, conn_id: ConnectionId, user_id: &str, envelope: Envelope) {
    match envelope.kind.as_str() {
        EventType::JOIN_REALM => match envelope.realm_id {
            Some(realm_id) => hub.join_group(conn_id, Group::Realm(realm_id)),
            None => missing(&envelope.kind, "realm_id", conn_id),
        },
        EventType::JOIN_CHANNEL => match envelope.channel_id {
            Some(channel_id) => hub.join_group(conn_id, Group::Channel(channel_id)),
            None => missing(&envelope.kind, "channel_id", conn_id),
        },
        EventType::LEAVE_REALM => match envelope.realm_id {
            Some(realm_id) => hub.leave_group(conn_id, Group::Realm(realm_id)),
            None => missing(&envelope.kind, "realm_id", conn_id),
        },
        EventType::LEAVE_CHANNEL => match envelope.channel_id {
            Some(channel_id) => hub.leave_group(conn_id, Group::Channel(channel_id)),
            None => missing(&envelope.kind, "channel_id", conn_id),
        },
        EventType::TYPING_START | EventType::TYPING_STOP => {
            let Some(channel_id) = envelope.channel_id.as_deref() else {
                return missing(&envelope.kind, "channel_id", conn_id);
            };
            let is_typing = envelope.kind == EventType::TYPING_START;
            hub.publish_json(
                Target::Group(Group::channel(channel_id)),
                &Envelope::typing(user_id, channel_id, is_typing),
            );
        }
        other => tracing::debug!(conn_id = %conn_id, kind = other, "ignoring unknown envelope type"),
    }
}

fn missing(kind: &str, field: &str, conn_id: ConnectionId) {
    tracing::debug!(conn_id = %conn_id, kind, field, "envelope missing required id");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::Connection;
    use crate::gateway::hub::Hub;

    fn envelope(json: &str) -> Envelope {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn join_and_leave_channel() {
        let (hub, _task) = Hub::spawn();
        let (conn, _q) = Connection::new("usr_a", 8);
        let id = conn.id();
        hub.register(conn).await.unwrap();

        dispatch(&hub, id, "usr_a", envelope(r#"{"type":"join_channel","channel_id":"general"}"#));
        assert_eq!(hub.group_size(Group::channel("general")).await, 1);

        dispatch(&hub, id, "usr_a", envelope(r#"{"type":"leave_channel","channel_id":"general"}"#));
        assert_eq!(hub.group_size(Group::channel("general")).await, 0);
    }

    #[tokio::test]
    async fn join_realm_without_id_is_ignored() {
        let (hub, _task) = Hub::spawn();
        let (conn, _q) = Connection::new("usr_a", 8);
        let id = conn.id();
        hub.register(conn).await.unwrap();

        dispatch(&hub, id, "usr_a", envelope(r#"{"type":"join_realm"}"#));
        dispatch(&hub, id, "usr_a", envelope(r#"{"type":"something_new","realm_id":"r"}"#));
        assert_eq!(hub.stats().await.realms, 0);
    }

    #[tokio::test]
    async fn typing_stop_fans_out_with_sender_id() {
        let (hub, _task) = Hub::spawn();
        let (a, _qa) = Connection::new("usr_a", 8);
        let (b, mut qb) = Connection::new("usr_b", 8);
        let (ida, idb) = (a.id(), b.id());
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.join_group(ida, Group::channel("general"));
        hub.join_group(idb, Group::channel("general"));

        dispatch(&hub, ida, "usr_a", envelope(r#"{"type":"typing_stop","channel_id":"general"}"#));
        hub.stats().await;

        let frame = qb.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "typing");
        assert_eq!(json["channel_id"], "general");
        assert_eq!(json["data"]["user_id"], "usr_a");
        assert_eq!(json["data"]["is_typing"], false);
    }
}
