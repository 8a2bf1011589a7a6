//! End-to-end clipboard replication between two engines.

mod common;

use common::{connected_pair, connected_pair_with, scripted_pair};
use peersync_core::clipboard::{ClipBundle, ClipPayload, ClipboardAccess};
use peersync_core::protocol::{
    ClipboardHeader, Command, ExtData, FmtType, InterruptCode, State, TextPayload,
};
use peersync_core::transport::StreamTransport;
use peersync_core::ui::{Side, UiEvent};

#[tokio::test]
async fn test_text_is_replicated() {
    let mut pair = connected_pair().await;

    let snapshot = pair
        .zulu
        .engine
        .publish_clipboard(ClipPayload::Text("hello from zulu".to_string()))
        .expect("content changed");
    assert_eq!(snapshot.source_id, "zulu");

    let event = pair
        .alpha
        .wait_for("ClipboardReceived", |e| {
            matches!(e, UiEvent::ClipboardReceived { .. })
        })
        .await;
    assert!(matches!(
        event,
        UiEvent::ClipboardReceived { format: FmtType::TextCb, bytes: 15, .. }
    ));

    let current = pair.alpha.engine.clipboard().current().expect("snapshot");
    assert_eq!(current.source_id, "zulu");
    assert_eq!(
        current.payload,
        ClipPayload::Text("hello from zulu".to_string())
    );
    assert_eq!(
        pair.alpha.clipboard.read().expect("read"),
        Some(ClipPayload::Text("hello from zulu".to_string()))
    );
}

#[tokio::test]
async fn test_bundle_is_streamed() {
    let mut pair = connected_pair().await;
    let bundle = ClipBundle {
        text: b"caption".to_vec(),
        image: vec![0x89; 50_000],
        html: b"<p>caption</p>".to_vec(),
        ..ClipBundle::default()
    };

    pair.alpha
        .engine
        .publish_clipboard(ClipPayload::Bundle(bundle.clone()))
        .expect("content changed");

    let event = pair
        .zulu
        .wait_for("ClipboardReceived", |e| {
            matches!(e, UiEvent::ClipboardReceived { .. })
        })
        .await;
    assert!(matches!(
        event,
        UiEvent::ClipboardReceived { format: FmtType::XclipCb, .. }
    ));

    let current = pair.zulu.engine.clipboard().current().expect("snapshot");
    let ClipPayload::Bundle(received) = &current.payload else {
        panic!("expected a bundle, got {:?}", current.payload);
    };
    assert_eq!(received.text, bundle.text);
    assert_eq!(received.image, bundle.image);
    assert_eq!(received.html, bundle.html);
}

#[tokio::test]
async fn test_received_content_is_not_echoed_back() {
    let mut pair = connected_pair().await;

    pair.zulu
        .engine
        .publish_clipboard(ClipPayload::Text("ping".to_string()))
        .expect("content changed");
    pair.alpha
        .wait_for("ClipboardReceived", |e| {
            matches!(e, UiEvent::ClipboardReceived { .. })
        })
        .await;

    pair.alpha
        .engine
        .publish_clipboard(ClipPayload::Text("pong".to_string()))
        .expect("content changed");
    pair.zulu
        .wait_for("ClipboardReceived", |e| {
            matches!(e, UiEvent::ClipboardReceived { .. })
        })
        .await;

    let current = pair.zulu.engine.clipboard().current().expect("snapshot");
    assert_eq!(current.payload, ClipPayload::Text("pong".to_string()));
    assert_eq!(current.source_id, "alpha");
}

#[tokio::test]
async fn test_oversized_bundle_is_refused() {
    let mut pair = connected_pair_with(|config| {
        config.clipboard.max_payload_bytes = 1024;
    })
    .await;

    pair.alpha
        .engine
        .publish_clipboard(ClipPayload::Bundle(ClipBundle {
            image: vec![1; 4096],
            ..ClipBundle::default()
        }))
        .expect("content changed");

    let failed = pair
        .alpha
        .wait_for("TransferFailed", |e| matches!(e, UiEvent::TransferFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        UiEvent::TransferFailed {
            format: FmtType::XclipCb,
            side: Side::Destination,
            code: InterruptCode::NotAccepted,
            ..
        }
    ));
    assert!(pair.zulu.engine.clipboard().current().is_none());
}

#[tokio::test]
async fn test_overflowing_header_keeps_session_alive() {
    let mut script = scripted_pair().await;

    script
        .send(
            FmtType::XclipCb,
            State::Info,
            Command::Src,
            1,
            ExtData::ClipboardHeader(ClipboardHeader {
                text_len: u64::MAX,
                image_len: 2,
                ..ClipboardHeader::default()
            }),
        )
        .await;
    script
        .send(
            FmtType::TextCb,
            State::Info,
            Command::Src,
            2,
            ExtData::Text(TextPayload {
                text: "still here".to_string(),
            }),
        )
        .await;

    script
        .alpha
        .wait_for("ClipboardReceived", |e| {
            matches!(e, UiEvent::ClipboardReceived { format: FmtType::TextCb, .. })
        })
        .await;
    let current = script.alpha.engine.clipboard().current().expect("snapshot");
    assert_eq!(current.payload, ClipPayload::Text("still here".to_string()));
    assert!(script.alpha.engine.is_connected("zulu").await);
}

#[tokio::test]
async fn test_stray_clipboard_streams_never_carry_an_exchange() {
    let mut pair = connected_pair().await;
    let zulu_side = pair.network.endpoint("zulu");

    for round in 1..=2u8 {
        for protocol in [
            "peersync/clipboard/XCLIP_CB/1",
            "peersync/clipboard/XCLIP_CB/1/1",
        ] {
            let stray = zulu_side
                .open_stream("alpha", protocol)
                .await
                .expect("open stray stream");
            drop(stray);
        }

        let bundle = ClipBundle {
            text: vec![b'a' + round],
            image: vec![round; 2048],
            ..ClipBundle::default()
        };
        pair.alpha
            .engine
            .publish_clipboard(ClipPayload::Bundle(bundle.clone()))
            .expect("content changed");

        pair.zulu
            .wait_for("ClipboardReceived", |e| {
                matches!(e, UiEvent::ClipboardReceived { format: FmtType::XclipCb, .. })
            })
            .await;
        let current = pair.zulu.engine.clipboard().current().expect("snapshot");
        let ClipPayload::Bundle(received) = &current.payload else {
            panic!("expected a bundle, got {:?}", current.payload);
        };
        assert_eq!(received.text, bundle.text);
        assert_eq!(received.image, bundle.image);
    }
}
