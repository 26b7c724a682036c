use std::sync::Arc;

use dioxus::prelude::*;
use webrtc_rooms::media::{LocalStream, MediaKind};
use webrtc_rooms::room::{acquire_media, create_room, resolve_room, RoomContext};
use webrtc_rooms::session::{load_username, validate_and_store, LocalStorage};

use super::Entry;

#[derive(Props)]
pub struct HomeProps<'a> {
    pub ctx: RoomContext,
    pub storage: Arc<dyn LocalStorage>,
    pub on_enter: EventHandler<'a, Entry>,
}

#[allow(non_snake_case)]
pub fn Home<'a>(cx: Scope<'a, HomeProps<'a>>) -> Element<'a> {
    let username = use_state(cx, || load_username(cx.props.storage.as_ref()));
    let room_link = use_state(cx, String::new);
    let error_message = use_state(cx, String::new);
    let mic_status = use_state(cx, || None::<String>);
    // Stream opened by the media check, reused when entering a room.
    let preview = use_ref(cx, || None::<LocalStream>);
    let busy = use_state(cx, || false);
    // Room id resolved by a background task, consumed on the next render.
    let pending_room = use_state(cx, || None::<String>);

    if let Some(room_id) = pending_room.get().clone() {
        pending_room.set(None);
        let local = preview.write_silent().take();
        cx.props.on_enter.call(Entry { room_id, local });
    }

    let store_name = move || match validate_and_store(cx.props.storage.as_ref(), username.get()) {
        Ok(()) => true,
        Err(e) => {
            error_message.set(e.to_string());
            false
        }
    };

    let create = move |_| {
        if !store_name() {
            return;
        }
        let store = cx.props.ctx.store.clone();
        let rooms = cx.props.ctx.config.store.rooms_collection.clone();
        let error_message = error_message.clone();
        let pending_room = pending_room.clone();
        let busy = busy.clone();
        busy.set(true);
        cx.spawn(async move {
            match create_room(store.as_ref(), &rooms).await {
                Ok(room_id) => pending_room.set(Some(room_id)),
                Err(e) => error_message.set(format!("Could not create a room: {}", e)),
            }
            busy.set(false);
        });
    };

    let join = move |_| {
        if !store_name() {
            return;
        }
        let store = cx.props.ctx.store.clone();
        let config = cx.props.ctx.config.clone();
        let link = room_link.get().clone();
        let error_message = error_message.clone();
        let pending_room = pending_room.clone();
        let busy = busy.clone();
        busy.set(true);
        cx.spawn(async move {
            match resolve_room(store.as_ref(), &config.store, &link).await {
                Ok(room_id) => pending_room.set(Some(room_id)),
                Err(e) => error_message.set(e.to_string()),
            }
            busy.set(false);
        });
    };

    let check_media = move |_| {
        let devices = cx.props.ctx.devices.clone();
        let mic_status = mic_status.clone();
        let preview = preview.clone();
        mic_status.set(Some("Listening...".to_string()));
        cx.spawn(async move {
            match acquire_media(devices.as_ref()).await {
                Ok(stream) => {
                    let heard = match stream.audio_frames() {
                        Some(mut frames) => tokio::time::timeout(
                            std::time::Duration::from_secs(1),
                            frames.recv(),
                        )
                        .await
                        .map(|frame| frame.is_ok())
                        .unwrap_or(false),
                        None => true,
                    };
                    let media = match stream.kind() {
                        MediaKind::AudioVideo => "camera and microphone",
                        _ => "microphone only",
                    };
                    mic_status.set(Some(if heard {
                        format!("Ready with {}", media)
                    } else {
                        format!("Ready with {}, but no audio is coming through", media)
                    }));
                    if let Some(previous) = preview.write().replace(stream) {
                        previous.stop();
                    }
                }
                Err(e) => mic_status.set(Some(format!("Media unavailable: {}", e))),
            }
        });
    };

    let is_busy = *busy.get();
    let join_disabled = is_busy || room_link.get().trim().is_empty();

    cx.render(rsx! {
        div { class: "control-panel",
            h3 { "Your name" }
            input {
                id: "username",
                value: "{username}",
                placeholder: "5 to 20 characters",
                oninput: move |evt| {
                    error_message.set(String::new());
                    username.set(evt.value.clone());
                }
            }
        }

        div { class: "control-panel",
            h3 { "Start a call" }
            button {
                onclick: create,
                disabled: "{is_busy}",
                "Create room"
            }
        }

        div { class: "control-panel",
            h3 { "Join a call" }
            input {
                id: "roomLink",
                value: "{room_link}",
                placeholder: "Room id or link",
                oninput: move |evt| room_link.set(evt.value.clone())
            }
            button {
                onclick: join,
                disabled: "{join_disabled}",
                "Join room"
            }
        }

        div { class: "control-panel",
            h3 { "Media check" }
            button {
                onclick: check_media,
                "Test camera and microphone"
            }
            {mic_status.get().as_ref().map(|status| rsx!(
                span { class: "status-value", "{status}" }
            ))}
        }

        {(!error_message.get().is_empty()).then(|| rsx!(
            div {
                class: "error-message",
                "{error_message}"
            }
        ))}
    })
}
