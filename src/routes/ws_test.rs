use super::*;
use crate::config::SyncConfig;
use crate::state::test_helpers;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{Duration, timeout};

struct TestClient {
    id: ParticipantId,
    rx: mpsc::Receiver<Frame>,
}

async fn connect(state: &AppState) -> TestClient {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel::<Frame>(64);
    state.connections.connect(id).await;
    state.channel.attach(id, tx).await;
    TestClient { id, rx }
}

async fn send(state: &AppState, client: &TestClient, event: &str, data: Value) -> Vec<Frame> {
    let text = json!({ "event": event, "data": data }).to_string();
    process_inbound_text(state, client.id, &text).await
}

async fn join(state: &AppState, client: &TestClient, room_id: &str) -> Vec<Frame> {
    send(state, client, events::JOIN_ROOM, json!({ "roomId": room_id })).await
}

async fn recv_room_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("room frame receive timed out")
        .expect("room channel closed unexpectedly")
}

async fn assert_no_room_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no room frame"
    );
}

fn stroke(id: &str, timestamp: i64) -> Value {
    json!({
        "id": id,
        "strokeId": format!("stroke-{id}"),
        "type": "start",
        "points": [{ "x": 1.0, "y": 2.0, "timestamp": timestamp }],
        "style": { "color": "#000000", "lineWidth": 2.0, "lineCap": "round", "lineJoin": "round" },
        "timestamp": timestamp
    })
}

fn assert_error(frames: &[Frame], code: &str) {
    assert_eq!(frames.len(), 1, "expected exactly one reply");
    assert_eq!(frames[0].event, "error");
    assert_eq!(frames[0].data_str(FRAME_CODE), Some(code));
}

/// Two clients in `room_id`, with the join notification already drained.
async fn pair_in_room(state: &AppState, room_id: &str) -> (TestClient, TestClient) {
    let a = connect(state).await;
    let mut b = connect(state).await;
    join(state, &b, room_id).await;
    join(state, &a, room_id).await;
    let joined = recv_room_frame(&mut b.rx).await;
    assert_eq!(joined.event, "user-joined");
    (a, b)
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

#[tokio::test]
async fn join_replies_room_joined_then_full_state_sync() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;

    let frames = join(&state, &a, "art-1").await;

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].event, "room-joined");
    assert_eq!(frames[0].data["roomId"], json!("art-1"));
    assert_eq!(frames[0].data["clientCount"], json!(1));
    assert_eq!(frames[1].event, "state-sync");
    assert_eq!(frames[1].data["isComplete"], json!(true));
    assert_eq!(frames[1].data["version"], json!(0));
    assert_eq!(frames[1].data["canvasState"]["participants"], json!([a.id.to_string()]));
    assert_eq!(frames[1].parent_id, frames[0].parent_id);
    assert_eq!(state.connections.get(a.id).await.unwrap().current_room_id.as_deref(), Some("art-1"));
}

#[tokio::test]
async fn join_announces_newcomer_to_peers_only() {
    let state = test_helpers::test_app_state();
    let mut a = connect(&state).await;
    let b = connect(&state).await;
    join(&state, &a, "art-1").await;

    join(&state, &b, "art-1").await;

    let notice = recv_room_frame(&mut a.rx).await;
    assert_eq!(notice.event, "user-joined");
    assert_eq!(notice.room_id.as_deref(), Some("art-1"));
    assert_eq!(notice.data["userId"], json!(b.id));
    assert_eq!(notice.data["clientCount"], json!(2));
}

#[tokio::test]
async fn join_rejects_bad_requests() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;

    assert_error(&join(&state, &a, "not a room!").await, "INVALID_ROOM_ID");
    assert_error(&send(&state, &a, events::JOIN_ROOM, json!({})).await, "INVALID_PAYLOAD");

    let frames = send(&state, &a, events::JOIN_ROOM, json!({ "roomId": "ghost", "createIfNotExists": false })).await;
    assert_error(&frames, "ROOM_NOT_FOUND");
}

#[tokio::test]
async fn rejoining_same_room_keeps_history_and_stays_quiet() {
    let state = test_helpers::test_app_state();
    let (a, mut b) = pair_in_room(&state, "art-1").await;
    send(&state, &a, events::DRAWING_EVENT, stroke("e1", 10)).await;
    recv_room_frame(&mut b.rx).await;

    let frames = join(&state, &a, "art-1").await;
    assert_eq!(frames[1].data["drawingHistory"].as_array().map(Vec::len), Some(1));
    assert_no_room_frame(&mut b.rx).await;
}

#[tokio::test]
async fn switching_rooms_tells_the_old_room() {
    let state = test_helpers::test_app_state();
    let (a, mut b) = pair_in_room(&state, "room-a").await;

    join(&state, &a, "room-b").await;

    let notice = recv_room_frame(&mut b.rx).await;
    assert_eq!(notice.event, "user-left");
    assert_eq!(notice.data["userId"], json!(a.id));
    assert_eq!(notice.data["clientCount"], json!(1));
    assert_eq!(state.rooms.room_of(a.id).await.as_deref(), Some("room-b"));
}

#[tokio::test]
async fn leave_replies_and_notifies_peers() {
    let state = test_helpers::test_app_state();
    let (a, mut b) = pair_in_room(&state, "art-1").await;

    let frames = send(&state, &a, events::LEAVE_ROOM, json!({})).await;
    assert_eq!(frames[0].event, "room-left");
    assert!(frames[0].data.contains_key("timestamp"));
    assert_eq!(recv_room_frame(&mut b.rx).await.event, "user-left");

    assert_error(&send(&state, &a, events::LEAVE_ROOM, json!({})).await, "NOT_IN_ROOM");
}

#[tokio::test]
async fn last_leave_destroys_room() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;
    join(&state, &a, "art-1").await;

    send(&state, &a, events::LEAVE_ROOM, json!({})).await;

    let frames = send(&state, &a, events::JOIN_ROOM, json!({ "roomId": "art-1", "createIfNotExists": false })).await;
    assert_error(&frames, "ROOM_NOT_FOUND");
}

#[tokio::test]
async fn disconnect_cleans_up_and_notifies_peers() {
    let state = test_helpers::test_app_state();
    let (a, mut b) = pair_in_room(&state, "art-1").await;

    disconnect(&state, a.id).await;

    let notice = recv_room_frame(&mut b.rx).await;
    assert_eq!(notice.event, "user-left");
    assert!(state.rooms.room_of(a.id).await.is_none());
    assert!(state.connections.get(a.id).await.is_none());
    assert_eq!(state.channel.group_size("art-1").await, 1);
}

// =============================================================================
// DRAWING
// =============================================================================

#[tokio::test]
async fn drawing_requires_a_room() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;
    assert_error(&send(&state, &a, events::DRAWING_EVENT, stroke("e1", 1)).await, "NOT_IN_ROOM");
}

#[tokio::test]
async fn drawing_is_stamped_and_relayed_to_peers() {
    let state = test_helpers::test_app_state();
    let (mut a, mut b) = pair_in_room(&state, "art-1").await;

    let mut payload = stroke("e1", 10);
    payload["userId"] = json!("someone-else");
    let frames = send(&state, &a, events::DRAWING_EVENT, payload).await;
    assert!(frames.is_empty(), "drawing has no direct reply");

    let relayed = recv_room_frame(&mut b.rx).await;
    assert_eq!(relayed.event, "drawing-event");
    assert_eq!(relayed.data["id"], json!("e1"));
    assert_eq!(relayed.data["userId"], json!(a.id));
    assert_eq!(relayed.data["roomId"], json!("art-1"));
    assert!(relayed.data["serverTimestamp"].as_i64().unwrap_or(0) > 0);
    assert_no_room_frame(&mut a.rx).await;
}

#[tokio::test]
async fn invalid_and_duplicate_drawings_are_rejected() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;
    join(&state, &a, "art-1").await;

    let mut bad = stroke("e1", 10);
    bad["points"] = json!([]);
    assert_error(&send(&state, &a, events::DRAWING_EVENT, bad).await, "INVALID_DRAWING_EVENT");

    assert!(send(&state, &a, events::DRAWING_EVENT, stroke("e1", 10)).await.is_empty());
    assert_error(&send(&state, &a, events::DRAWING_EVENT, stroke("e1", 11)).await, "INVALID_DRAWING_EVENT");

    let room = state.rooms.member_room(a.id).await.unwrap();
    assert_eq!(room.history().len(), 1);
    assert_eq!(room.history().version(), 1);
}

#[tokio::test]
async fn frame_for_another_room_is_a_mismatch() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;
    join(&state, &a, "art-1").await;

    let text = json!({ "event": events::DRAWING_EVENT, "roomId": "art-2", "data": stroke("e1", 1) }).to_string();
    assert_error(&process_inbound_text(&state, a.id, &text).await, "ROOM_MISMATCH");
}

#[tokio::test]
async fn cursor_goes_to_peers_and_into_canvas_state() {
    let state = test_helpers::test_app_state();
    let (mut a, mut b) = pair_in_room(&state, "art-1").await;

    let frames = send(&state, &a, events::CURSOR_EVENT, json!({ "position": { "x": 4.0, "y": 5.0 } })).await;
    assert!(frames.is_empty());

    let relayed = recv_room_frame(&mut b.rx).await;
    assert_eq!(relayed.event, "cursor-event");
    assert_eq!(relayed.data["position"]["x"], json!(4.0));
    assert_eq!(relayed.data["isActive"], json!(true));
    assert_no_room_frame(&mut a.rx).await;

    let sync = send(&state, &b, events::REQUEST_STATE_SYNC, json!({})).await;
    assert_eq!(sync[0].data["canvasState"]["cursors"].as_array().map(Vec::len), Some(1));

    let bad = send(&state, &a, events::CURSOR_EVENT, json!({ "position": "here" })).await;
    assert_error(&bad, "INVALID_CURSOR_EVENT");
}

// =============================================================================
// UNDO / REDO / CLEAR
// =============================================================================

#[tokio::test]
async fn undo_and_redo_reach_the_whole_room() {
    let state = test_helpers::test_app_state();
    let (mut a, mut b) = pair_in_room(&state, "art-1").await;
    send(&state, &a, events::DRAWING_EVENT, stroke("e1", 10)).await;

    assert!(send(&state, &b, events::UNDO_REQUEST, json!({})).await.is_empty());

    // The pending stroke is flushed ahead of the undo that removes it.
    assert_eq!(recv_room_frame(&mut b.rx).await.event, "drawing-event");
    let undo_b = recv_room_frame(&mut b.rx).await;
    assert_eq!(undo_b.event, "undo-applied");
    assert_eq!(undo_b.data["undoneEvents"][0]["id"], json!("e1"));
    assert_eq!(undo_b.data["userId"], json!(b.id));
    assert_eq!(undo_b.data["version"], json!(2));
    assert_eq!(recv_room_frame(&mut a.rx).await.event, "undo-applied");

    send(&state, &a, events::REDO_REQUEST, json!({})).await;
    let redo_a = recv_room_frame(&mut a.rx).await;
    assert_eq!(redo_a.event, "redo-applied");
    assert_eq!(redo_a.data["redoneEvents"][0]["id"], json!("e1"));
    assert_eq!(redo_a.data["version"], json!(3));
    assert_eq!(recv_room_frame(&mut b.rx).await.event, "redo-applied");
}

#[tokio::test]
async fn undo_and_redo_with_nothing_to_do_fail_to_requester() {
    let state = test_helpers::test_app_state();
    let (mut a, mut b) = pair_in_room(&state, "art-1").await;

    let undo = send(&state, &a, events::UNDO_REQUEST, json!({})).await;
    assert_eq!(undo[0].event, "undo-failed");
    assert_eq!(undo[0].data_str("reason"), Some("nothing to undo"));

    let redo = send(&state, &a, events::REDO_REQUEST, json!({})).await;
    assert_eq!(redo[0].event, "redo-failed");

    assert_no_room_frame(&mut a.rx).await;
    assert_no_room_frame(&mut b.rx).await;
}

#[tokio::test]
async fn clear_canvas_empties_history_for_everyone() {
    let state = test_helpers::test_app_state();
    let (mut a, mut b) = pair_in_room(&state, "art-1").await;
    send(&state, &a, events::DRAWING_EVENT, stroke("e1", 10)).await;
    send(&state, &a, events::DRAWING_EVENT, stroke("e2", 11)).await;

    send(&state, &a, events::CLEAR_CANVAS, json!({})).await;

    assert_eq!(recv_room_frame(&mut b.rx).await.event, "drawing-event");
    assert_eq!(recv_room_frame(&mut b.rx).await.event, "drawing-event");
    let cleared = recv_room_frame(&mut b.rx).await;
    assert_eq!(cleared.event, "canvas-cleared");
    assert_eq!(cleared.data["removedEvents"], json!(2));
    assert_eq!(recv_room_frame(&mut a.rx).await.event, "canvas-cleared");

    let sync = send(&state, &a, events::REQUEST_STATE_SYNC, json!({})).await;
    assert_eq!(sync[0].data["drawingHistory"], json!([]));
    assert_eq!(sync[0].data["version"], json!(3));
}

// =============================================================================
// SYNC AND INTROSPECTION
// =============================================================================

#[tokio::test]
async fn state_sync_is_partial_only_for_current_version() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;
    join(&state, &a, "art-1").await;
    send(&state, &a, events::DRAWING_EVENT, stroke("e1", 10)).await;

    let current = send(&state, &a, events::REQUEST_STATE_SYNC, json!({ "clientVersion": 1 })).await;
    assert_eq!(current[0].event, "state-sync");
    assert_eq!(current[0].data["isComplete"], json!(false));
    assert_eq!(current[0].data["drawingHistory"], json!([]));

    let stale = send(&state, &a, events::REQUEST_STATE_SYNC, json!({ "clientVersion": 0 })).await;
    assert_eq!(stale[0].data["isComplete"], json!(true));
    assert_eq!(stale[0].data["drawingHistory"][0]["id"], json!("e1"));

    let bad = send(&state, &a, events::REQUEST_STATE_SYNC, json!({ "clientVersion": "one" })).await;
    assert_error(&bad, "INVALID_PAYLOAD");
}

#[tokio::test]
async fn corrupt_history_yields_state_sync_failed() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;
    join(&state, &a, "art-1").await;
    {
        let mut room = state.rooms.member_room(a.id).await.unwrap();
        let history = room.history_mut();
        history.append(test_helpers::dummy_event("art-1", "e1", 10)).unwrap();
        history.push_unchecked(test_helpers::dummy_event("art-1", "e0", 5));
    }

    let frames = send(&state, &a, events::REQUEST_STATE_SYNC, json!({})).await;
    assert_eq!(frames[0].event, "state-sync-failed");
    assert_eq!(frames[0].data_str(FRAME_CODE), Some("INVALID_ROOM_STATE"));
}

#[tokio::test]
async fn room_list_and_info() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;
    join(&state, &a, "art-1").await;

    let list = send(&state, &a, events::REQUEST_ROOM_LIST, json!({})).await;
    assert_eq!(list[0].event, "room-list");
    assert_eq!(list[0].data["rooms"][0]["roomId"], json!("art-1"));
    assert_eq!(list[0].data["rooms"][0]["participantCount"], json!(1));

    let info = send(&state, &a, events::REQUEST_ROOM_INFO, json!({ "roomId": "art-1" })).await;
    assert_eq!(info[0].event, "room-info");
    assert_eq!(info[0].data["participants"], json!([a.id.to_string()]));

    let missing = send(&state, &a, events::REQUEST_ROOM_INFO, json!({ "roomId": "nope" })).await;
    assert_error(&missing, "ROOM_NOT_FOUND");
}

#[tokio::test]
async fn ping_echoes_timestamp() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;

    let frames = send(&state, &a, events::PING, json!({ "timestamp": 1234 })).await;
    assert_eq!(frames[0].event, "pong");
    assert_eq!(frames[0].data["timestamp"], json!(1234));
    assert!(frames[0].data.contains_key("serverTimestamp"));
}

#[tokio::test]
async fn unknown_event_and_bad_json_are_reported() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;

    assert_error(&send(&state, &a, "teleport", json!({})).await, "UNKNOWN_EVENT");
    assert_error(&process_inbound_text(&state, a.id, "{not json").await, "INVALID_PAYLOAD");
}

#[tokio::test]
async fn replies_carry_request_id_as_parent() {
    let state = test_helpers::test_app_state();
    let a = connect(&state).await;
    let id = Uuid::new_v4();
    let text = json!({ "id": id, "event": "ping", "data": {} }).to_string();

    let frames = process_inbound_text(&state, a.id, &text).await;
    assert_eq!(frames[0].parent_id, Some(id));
}

#[tokio::test]
async fn drawings_are_batched_until_the_timer_fires() {
    let mut config = SyncConfig::default();
    config.batch.interval = Duration::from_millis(40);
    let state = test_helpers::test_app_state_with(config);
    let (a, mut b) = pair_in_room(&state, "art-1").await;

    for (i, id) in ["e1", "e2", "e3"].iter().enumerate() {
        let ts = 10 + i64::try_from(i).unwrap();
        send(&state, &a, events::DRAWING_EVENT, stroke(id, ts)).await;
    }
    assert!(b.rx.try_recv().is_err(), "nothing before the batch timer");

    for expected in ["e1", "e2", "e3"] {
        assert_eq!(recv_room_frame(&mut b.rx).await.data["id"], json!(expected));
    }
}

// =============================================================================
// END TO END
// =============================================================================

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = crate::routes::app(test_helpers::test_app_state());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

async fn next_frame(stream: &mut WsStream) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("websocket receive timed out")
            .expect("websocket closed")
            .expect("websocket error");
        if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("server sent invalid frame");
        }
    }
}

async fn send_ws(stream: &mut WsStream, event: &str, data: Value) {
    let text = json!({ "event": event, "data": data }).to_string();
    stream
        .send(tokio_tungstenite::tungstenite::Message::text(text))
        .await
        .expect("websocket send failed");
}

#[tokio::test]
async fn websocket_clients_share_strokes() {
    let url = start_server().await;
    let (mut alice, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut bob, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let hello = next_frame(&mut alice).await;
    assert_eq!(hello.event, "connected");
    let alice_id = hello.data_str("userId").unwrap().to_string();
    assert_eq!(next_frame(&mut bob).await.event, "connected");

    send_ws(&mut alice, events::JOIN_ROOM, json!({ "roomId": "e2e" })).await;
    assert_eq!(next_frame(&mut alice).await.event, "room-joined");
    assert_eq!(next_frame(&mut alice).await.event, "state-sync");

    send_ws(&mut bob, events::JOIN_ROOM, json!({ "roomId": "e2e", "createIfNotExists": false })).await;
    assert_eq!(next_frame(&mut bob).await.event, "room-joined");
    assert_eq!(next_frame(&mut bob).await.event, "state-sync");
    assert_eq!(next_frame(&mut alice).await.event, "user-joined");

    send_ws(&mut alice, events::DRAWING_EVENT, stroke("e1", 5)).await;
    let relayed = next_frame(&mut bob).await;
    assert_eq!(relayed.event, "drawing-event");
    assert_eq!(relayed.data["userId"], json!(alice_id));

    alice.close(None).await.unwrap();
    let left = next_frame(&mut bob).await;
    assert_eq!(left.event, "user-left");
    assert_eq!(left.data["userId"], json!(alice_id));
}
