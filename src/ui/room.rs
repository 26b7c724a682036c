use std::sync::Arc;

use dioxus::prelude::*;
use webrtc_rooms::media::{LocalStream, MediaKind};
use webrtc_rooms::room::{PeerPhase, PeerView, RoomContext, RoomSession, RoomView};
use webrtc_rooms::session::{is_valid_username, load_username, LocalStorage};
use webrtc_rooms::AppError;

use super::Exit;

#[derive(Props)]
pub struct RoomScreenProps<'a> {
    pub ctx: RoomContext,
    pub storage: Arc<dyn LocalStorage>,
    pub room_id: String,
    #[props(!optional)]
    pub local: Option<LocalStream>,
    pub on_exit: EventHandler<'a, Exit>,
}

fn exit_for(error: AppError) -> Exit {
    match error {
        AppError::InvalidRoomId(_) => Exit::Home(None),
        AppError::Media(e) => Exit::NoMedia(e.to_string()),
        other => Exit::Home(Some(other.to_string())),
    }
}

fn phase_label(peer: &PeerView) -> &'static str {
    match (peer.phase, peer.stream.as_ref()) {
        (PeerPhase::Connecting, _) => "connecting",
        (PeerPhase::Muted, _) => "camera paused",
        (PeerPhase::Connected, Some(stream)) if stream.video => "audio and video",
        (PeerPhase::Connected, Some(_)) => "audio only",
        (PeerPhase::Connected, None) => "connected",
        (PeerPhase::Disconnected, _) => "left",
    }
}

#[allow(non_snake_case)]
pub fn RoomScreen<'a>(cx: Scope<'a, RoomScreenProps<'a>>) -> Element<'a> {
    let session = use_ref(cx, || None::<Arc<RoomSession>>);
    let view = use_state(cx, || None::<RoomView>);
    let error_message = use_state(cx, String::new);
    let exit = use_state(cx, || None::<Exit>);

    if let Some(target) = exit.get().clone() {
        exit.set(None);
        cx.props.on_exit.call(target);
    }

    use_future(cx, (), |_| {
        let ctx = cx.props.ctx.clone();
        let room_id = cx.props.room_id.clone();
        let local = cx.props.local.clone();
        let username = load_username(cx.props.storage.as_ref());
        let session = session.clone();
        let view = view.clone();
        let exit = exit.clone();
        async move {
            if !is_valid_username(&username) {
                exit.set(Some(Exit::Home(Some(AppError::InvalidUsername.to_string()))));
                return;
            }
            let joined = match RoomSession::enter(&ctx, &room_id, &username, local).await {
                Ok(joined) => joined,
                Err(e) => {
                    tracing::warn!(room = %room_id, error = %e, "could not enter room");
                    exit.set(Some(exit_for(e)));
                    return;
                }
            };
            let mut updates = joined.view();
            session.set(Some(Arc::new(joined)));
            loop {
                let current = updates.borrow_and_update().clone();
                view.set(Some(current));
                if updates.changed().await.is_err() {
                    break;
                }
            }
        }
    });

    let toggle_camera = move |_| {
        let Some(active) = session.read().clone() else {
            return;
        };
        let error_message = error_message.clone();
        cx.spawn(async move {
            match active.toggle_camera().await {
                Ok(_) => error_message.set(String::new()),
                Err(e) => error_message.set(e.to_string()),
            }
        });
    };

    let hang_up = move |_| {
        let Some(active) = session.read().clone() else {
            return;
        };
        let error_message = error_message.clone();
        let exit = exit.clone();
        cx.spawn(async move {
            match active.hang_up().await {
                Ok(()) => exit.set(Some(Exit::Home(None))),
                Err(e) => error_message.set(e.to_string()),
            }
        });
    };

    let Some(current) = view.get().as_ref() else {
        return cx.render(rsx! {
            div { class: "control-panel", "Joining room {cx.props.room_id}..." }
        });
    };

    let media = match current.media {
        MediaKind::AudioVideo => "audio and video",
        MediaKind::AudioOnly => "audio only",
        MediaKind::None => "no media",
    };
    let camera_label = if current.camera_on { "Stop camera" } else { "Start camera" };

    cx.render(rsx! {
        div { class: "control-panel",
            h3 { "Room {current.room_id}" }
            div { class: "status-item",
                "Share link: ",
                input { id: "shareLink", readonly: "true", value: "{current.share_link}" }
            }
            div { class: "status-item",
                "You: ",
                span { class: "status-value", "{current.username} ({media})" }
            }
            {(!current.published).then(|| rsx!(
                div { class: "status-error", "Others cannot see you right now" }
            ))}
            button {
                onclick: toggle_camera,
                "{camera_label}"
            }
            button {
                onclick: hang_up,
                "Hang up"
            }
        }

        div { class: "control-panel",
            h3 { "In this room" }
            div { class: "peer-list",
                {current.peers.is_empty().then(|| rsx!(
                    span { "Waiting for others to join" }
                ))}
                current.peers.iter().map(|peer| {
                    let label = phase_label(peer);
                    rsx! {
                        div { class: "peer-item", key: "{peer.peer_id}",
                            span { "{peer.username}" }
                            span { class: "status-value", "{label}" }
                        }
                    }
                })
            }
        }

        {(!error_message.get().is_empty()).then(|| rsx!(
            div {
                class: "error-message",
                "{error_message}"
            }
        ))}
    })
}
