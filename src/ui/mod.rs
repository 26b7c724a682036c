//! Desktop shell: a home screen and a room screen.

mod home;
mod room;

use std::sync::Arc;

use dioxus::prelude::*;
use webrtc_rooms::media::LocalStream;
use webrtc_rooms::room::RoomContext;
use webrtc_rooms::session::LocalStorage;

use self::home::Home;
use self::room::RoomScreen;

/// Root props handed over by `main`.
pub struct Shell {
    pub ctx: RoomContext,
    pub storage: Arc<dyn LocalStorage>,
}

/// A room picked on the home screen, with the stream its media check opened.
#[derive(Debug, Clone)]
pub struct Entry {
    pub room_id: String,
    pub local: Option<LocalStream>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Screen {
    Home,
    Room(String),
    NoMedia(String),
}

/// Where the room screen sends the user when the visit ends.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit {
    Home(Option<String>),
    NoMedia(String),
}

#[allow(non_snake_case)]
pub fn App(cx: Scope<Shell>) -> Element {
    let screen = use_state(cx, || Screen::Home);
    let notice = use_state(cx, || None::<String>);
    // Handed to the room controller, which stops it when the visit ends.
    let held = use_ref(cx, || None::<LocalStream>);

    let enter_room = move |entry: Entry| {
        notice.set(None);
        held.set(entry.local);
        screen.set(Screen::Room(entry.room_id));
    };

    let leave_room = move |exit: Exit| {
        held.set(None);
        match exit {
            Exit::Home(message) => {
                notice.set(message);
                screen.set(Screen::Home);
            }
            Exit::NoMedia(reason) => screen.set(Screen::NoMedia(reason)),
        }
    };

    let body = match screen.get() {
        Screen::Home => rsx! {
            Home {
                ctx: cx.props.ctx.clone(),
                storage: cx.props.storage.clone(),
                on_enter: enter_room
            }
        },
        Screen::Room(room_id) => rsx! {
            RoomScreen {
                key: "{room_id}",
                ctx: cx.props.ctx.clone(),
                storage: cx.props.storage.clone(),
                room_id: room_id.clone(),
                local: held.read().clone(),
                on_exit: leave_room
            }
        },
        Screen::NoMedia(reason) => rsx! {
            div { class: "control-panel",
                h3 { "No media available" }
                p { "Camera and microphone access is needed to join a room: {reason}" }
                button {
                    onclick: move |_| screen.set(Screen::Home),
                    "Back"
                }
            }
        },
    };

    cx.render(rsx! {
        style { include_str!("./style.css") }
        h1 { "WebRTC Rooms" }

        {notice.get().as_ref().map(|message| rsx!(
            div { class: "error-message", "{message}" }
        ))}

        body
    })
}
