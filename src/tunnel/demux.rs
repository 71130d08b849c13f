//! Egress demultiplexer: applies traffic from the tunnel client to streams.
//!
//! Every lookup tolerates unknown ids. The public side may abandon a stream
//! at any moment, so late `response`/chunk/`end`/`ws-*` messages are routine
//! and only logged at debug level.

use tracing::{debug, warn};

use super::frame::{decode_ws_payload, ChunkFrame, ControlMessage};
use super::streams::{ResponseHead, Route, StreamTable, WsDelivery};

/// Route one control message from the tunnel client.
pub fn route_control(streams: &StreamTable, msg: ControlMessage) -> Route {
    let kind = msg.kind();
    match msg {
        ControlMessage::Response {
            id,
            status,
            headers,
        } => {
            let route = streams.start_response(&id, ResponseHead { status, headers });
            log_route(kind, &id, route);
            route
        }
        ControlMessage::End { id } => {
            let route = streams.finish_http(&id);
            log_route(kind, &id, route);
            route
        }
        ControlMessage::WsFrame {
            id,
            data,
            is_binary,
        } => {
            let payload = match decode_ws_payload(&data) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(%id, error = %e, "Dropping ws-frame with invalid base64");
                    return Route::Dropped;
                }
            };
            let delivery = if is_binary {
                WsDelivery::Binary(payload.into())
            } else {
                WsDelivery::Text(String::from_utf8_lossy(&payload).into_owned())
            };
            let route = streams.deliver_ws(&id, delivery);
            log_route(kind, &id, route);
            route
        }
        ControlMessage::WsClose { id } => {
            let route = streams.close_ws(&id);
            log_route(kind, &id, route);
            route
        }
        ControlMessage::Auth { .. }
        | ControlMessage::Request { .. }
        | ControlMessage::WsInit { .. }
        | ControlMessage::Error { .. } => {
            warn!(kind, "Ignoring message type the tunnel client may not send");
            Route::Unexpected
        }
    }
}

/// Route one chunk frame of response body bytes.
pub fn route_chunk(streams: &StreamTable, frame: ChunkFrame) -> Route {
    let route = streams.append_body(&frame.id, frame.payload);
    log_route("chunk", &frame.id, route);
    route
}

fn log_route(kind: &str, id: &str, route: Route) {
    match route {
        Route::Applied => {}
        Route::UnknownId => debug!(kind, %id, "No stream for id, dropping"),
        Route::Dropped => debug!(kind, %id, "Stream cannot accept message, dropping"),
        Route::Unexpected => warn!(kind, %id, "Unexpected message"),
    }
}
