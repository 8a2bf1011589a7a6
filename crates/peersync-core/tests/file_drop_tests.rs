//! End-to-end file-drop scenarios between two engines.

mod common;

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use common::{
    connected_pair, connected_pair_with, create_test_file, eventually, patterned_bytes,
    scripted_pair,
};
use peersync_core::file::{DropCmd, FileDropData, FileInfo};
use peersync_core::protocol::{Command, DropResponse, ExtData, FmtType, InterruptCode, State};
use peersync_core::queue::Direction;
use peersync_core::ui::{Side, UiEvent};

#[tokio::test]
async fn test_accepted_drop_is_copied() {
    let mut pair = connected_pair().await;
    let src = tempfile::tempdir().expect("tempdir");
    let content = patterned_bytes(1000);
    let path = create_test_file(src.path(), "x.bin", &content);

    let ts = pair
        .zulu
        .engine
        .send_files("alpha", &[path])
        .await
        .expect("send_files");

    let request = pair
        .alpha
        .wait_for("FileDropRequest", |e| matches!(e, UiEvent::FileDropRequest { .. }))
        .await;
    let UiEvent::FileDropRequest { peer, descriptor } = request else {
        unreachable!()
    };
    assert_eq!(peer, "zulu");
    assert_eq!(descriptor.timestamp, ts);
    assert_eq!(descriptor.total_size, 1000);
    assert_eq!(pair.alpha.engine.pending_file_drops("zulu").await.len(), 1);

    pair.alpha
        .engine
        .respond_to_file_drop("zulu", ts, true)
        .await
        .expect("accept");

    let done = pair
        .alpha
        .wait_for("TransferCompleted", |e| {
            matches!(e, UiEvent::TransferCompleted { .. })
        })
        .await;
    let UiEvent::TransferCompleted {
        timestamp,
        direction,
        files,
        ..
    } = done
    else {
        unreachable!()
    };
    assert_eq!(timestamp, ts);
    assert_eq!(direction, Direction::AsDst);
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).expect("read"), content);

    pair.zulu
        .wait_for("sender TransferCompleted", |e| {
            matches!(e, UiEvent::TransferCompleted { timestamp, .. } if *timestamp == ts)
        })
        .await;
    assert!(pair.zulu.engine.queued_transfers("alpha").await.is_empty());
    assert!(pair.alpha.engine.queued_transfers("zulu").await.is_empty());
}

#[tokio::test]
async fn test_rejected_drop_leaves_queue() {
    let mut pair = connected_pair().await;
    let src = tempfile::tempdir().expect("tempdir");
    let path = create_test_file(src.path(), "x.bin", b"nope");

    let ts = pair
        .zulu
        .engine
        .send_files("alpha", &[path])
        .await
        .expect("send_files");
    assert_eq!(pair.zulu.engine.queued_transfers("alpha").await.len(), 1);

    pair.alpha
        .wait_for("FileDropRequest", |e| matches!(e, UiEvent::FileDropRequest { .. }))
        .await;
    pair.alpha
        .engine
        .respond_to_file_drop("zulu", ts, false)
        .await
        .expect("reject");

    pair.zulu
        .wait_for("TransferRejected", |e| {
            matches!(e, UiEvent::TransferRejected { timestamp, .. } if *timestamp == ts)
        })
        .await;
    assert!(pair.zulu.engine.queued_transfers("alpha").await.is_empty());
    assert!(pair.alpha.downloaded_files().is_empty());
}

#[tokio::test]
async fn test_sender_withdraws_before_answer() {
    let mut pair = connected_pair().await;
    let src = tempfile::tempdir().expect("tempdir");
    let path = create_test_file(src.path(), "x.bin", b"later");

    let ts = pair
        .zulu
        .engine
        .send_files("alpha", &[path])
        .await
        .expect("send_files");
    pair.alpha
        .wait_for("FileDropRequest", |e| matches!(e, UiEvent::FileDropRequest { .. }))
        .await;

    pair.zulu
        .engine
        .cancel_transfer("alpha", ts)
        .await
        .expect("cancel");

    let event = pair
        .alpha
        .wait_for("TransferCancelled", |e| {
            matches!(e, UiEvent::TransferCancelled { .. })
        })
        .await;
    assert!(matches!(
        event,
        UiEvent::TransferCancelled { by_peer: true, timestamp, .. } if timestamp == ts
    ));
    eventually("pending request to be withdrawn", || async {
        pair.alpha.engine.pending_file_drops("zulu").await.is_empty()
    })
    .await;
    assert!(pair
        .alpha
        .engine
        .respond_to_file_drop("zulu", ts, true)
        .await
        .is_err());
}

#[tokio::test]
async fn test_receiver_cancels_mid_transfer() {
    let mut pair = connected_pair_with(|config| {
        config.transfer.chunk_size = 1024;
        config.transfer.progress_tick = Duration::from_millis(5);
    })
    .await;
    let src = tempfile::tempdir().expect("tempdir");
    let size = 16 * 1024 * 1024;
    let path = create_test_file(src.path(), "big.bin", &patterned_bytes(size));

    let ts = pair
        .zulu
        .engine
        .send_files("alpha", &[path])
        .await
        .expect("send_files");
    pair.alpha
        .wait_for("FileDropRequest", |e| matches!(e, UiEvent::FileDropRequest { .. }))
        .await;
    pair.alpha
        .engine
        .respond_to_file_drop("zulu", ts, true)
        .await
        .expect("accept");

    pair.alpha
        .wait_for("receive progress", |e| {
            matches!(e, UiEvent::Progress(p) if p.direction == Direction::AsDst)
        })
        .await;
    pair.alpha
        .engine
        .cancel_transfer("zulu", ts)
        .await
        .expect("cancel");

    let failed = pair
        .alpha
        .wait_for("TransferFailed", |e| matches!(e, UiEvent::TransferFailed { .. }))
        .await;
    let UiEvent::TransferFailed {
        timestamp,
        format,
        side,
        code,
        cancelled_locally,
        ..
    } = failed
    else {
        unreachable!()
    };
    assert_eq!(timestamp, ts);
    assert_eq!(format, FmtType::FileDrop);
    assert_eq!(side, Side::Destination);
    assert_eq!(code, InterruptCode::Cancelled);
    assert!(cancelled_locally);
    assert!(pair.alpha.downloaded_files().is_empty());

    eventually("sender queue to drain", || async {
        pair.zulu.engine.queued_transfers("alpha").await.is_empty()
    })
    .await;
    // A cancelled transfer is not resumable.
    assert!(pair.zulu.engine.interrupted_transfers("alpha").await.is_empty());
    assert!(pair.alpha.engine.interrupted_transfers("zulu").await.is_empty());
}

#[tokio::test]
async fn test_stream_open_failure_then_recover() {
    let mut pair = connected_pair().await;
    pair.network.block_protocol("peersync/file-drop/").await;

    let src = tempfile::tempdir().expect("tempdir");
    let content = patterned_bytes(4096);
    let path = create_test_file(src.path(), "x.bin", &content);

    let ts = pair
        .zulu
        .engine
        .send_files("alpha", &[path])
        .await
        .expect("send_files");
    pair.alpha
        .wait_for("FileDropRequest", |e| matches!(e, UiEvent::FileDropRequest { .. }))
        .await;
    pair.alpha
        .engine
        .respond_to_file_drop("zulu", ts, true)
        .await
        .expect("accept");

    let failed = pair
        .alpha
        .wait_for("TransferFailed", |e| matches!(e, UiEvent::TransferFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        UiEvent::TransferFailed {
            side: Side::Destination,
            code: InterruptCode::StreamFailed,
            cancelled_locally: false,
            ..
        }
    ));
    pair.zulu
        .wait_for("sender TransferFailed", |e| {
            matches!(e, UiEvent::TransferFailed { timestamp, .. } if *timestamp == ts)
        })
        .await;
    eventually("sender queue to drain", || async {
        pair.zulu.engine.queued_transfers("alpha").await.is_empty()
    })
    .await;

    let interrupted = pair.alpha.engine.interrupted_transfers("zulu").await;
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].0, Direction::AsDst);

    pair.network.unblock_all().await;
    pair.alpha
        .engine
        .recover_transfer("zulu", ts)
        .await
        .expect("recover");

    pair.alpha
        .wait_for("RecoverResult", |e| {
            matches!(e, UiEvent::RecoverResult { accepted: true, .. })
        })
        .await;
    let done = pair
        .alpha
        .wait_for("TransferCompleted", |e| {
            matches!(e, UiEvent::TransferCompleted { .. })
        })
        .await;
    let UiEvent::TransferCompleted { files, .. } = done else {
        unreachable!()
    };
    assert_eq!(std::fs::read(&files[0]).expect("read"), content);
    assert!(pair.alpha.engine.interrupted_transfers("zulu").await.is_empty());
}

#[tokio::test]
async fn test_auto_accept_and_deferred_admission() {
    let mut pair = connected_pair_with(|config| {
        config.transfer.auto_accept = true;
        config.transfer.max_concurrent_transfers = 1;
    })
    .await;
    let src = tempfile::tempdir().expect("tempdir");
    let first = create_test_file(src.path(), "one.bin", &patterned_bytes(300_000));
    let second = create_test_file(src.path(), "two.bin", &patterned_bytes(200));

    let ts1 = pair
        .zulu
        .engine
        .send_files("alpha", &[first])
        .await
        .expect("send first");
    let ts2 = pair
        .zulu
        .engine
        .send_files("alpha", &[second])
        .await
        .expect("send second");
    assert!(ts2 > ts1);

    let mut completed = Vec::new();
    while completed.len() < 2 {
        let event = pair
            .alpha
            .wait_for("TransferCompleted", |e| {
                matches!(e, UiEvent::TransferCompleted { .. })
            })
            .await;
        if let UiEvent::TransferCompleted { timestamp, .. } = event {
            completed.push(timestamp);
        }
    }
    completed.sort_unstable();
    assert_eq!(completed, vec![ts1, ts2]);
    assert_eq!(pair.alpha.downloaded_files().len(), 2);
}

#[tokio::test]
async fn test_disconnect_ends_both_sessions() {
    let mut pair = connected_pair().await;

    pair.zulu.engine.send_disconnect_to_all_peers().await;

    pair.alpha
        .wait_for("PeerDisconnected", |e| {
            matches!(e, UiEvent::PeerDisconnected { peer } if peer == "zulu")
        })
        .await;
    pair.zulu
        .wait_for("PeerDisconnected", |e| {
            matches!(e, UiEvent::PeerDisconnected { peer } if peer == "alpha")
        })
        .await;
    eventually("sessions to detach", || async {
        !pair.alpha.engine.is_connected("zulu").await && !pair.zulu.engine.is_connected("alpha").await
    })
    .await;
}

#[tokio::test]
async fn test_vanished_source_is_a_source_interrupt() {
    let mut pair = connected_pair().await;
    let src = tempfile::tempdir().expect("tempdir");
    let path = create_test_file(src.path(), "gone.bin", &patterned_bytes(2048));

    let ts = pair
        .zulu
        .engine
        .send_files("alpha", &[path.clone()])
        .await
        .expect("send_files");
    pair.alpha
        .wait_for("FileDropRequest", |e| matches!(e, UiEvent::FileDropRequest { .. }))
        .await;
    std::fs::remove_file(&path).expect("remove source");
    pair.alpha
        .engine
        .respond_to_file_drop("zulu", ts, true)
        .await
        .expect("accept");

    let failed = pair
        .alpha
        .wait_for("TransferFailed", |e| matches!(e, UiEvent::TransferFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        UiEvent::TransferFailed {
            timestamp,
            format: FmtType::FileDrop,
            side: Side::Source,
            code: InterruptCode::FileNotFound,
            cancelled_locally: false,
            ..
        } if timestamp == ts
    ));

    let local = pair
        .zulu
        .wait_for("sender TransferFailed", |e| matches!(e, UiEvent::TransferFailed { .. }))
        .await;
    assert!(matches!(
        local,
        UiEvent::TransferFailed {
            side: Side::Source,
            code: InterruptCode::FileNotFound,
            cancelled_locally: false,
            ..
        }
    ));
    assert!(pair.alpha.downloaded_files().is_empty());
    eventually("sender queue to drain", || async {
        pair.zulu.engine.queued_transfers("alpha").await.is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_short_stream_is_incomplete_not_success() {
    let mut script = scripted_pair().await;
    let ts = 1_700_000_000_000;
    let descriptor = FileDropData::new(ts, vec![FileInfo::new("/srv/x.bin", "x.bin", 1000)]);

    script
        .send(
            FmtType::FileDrop,
            State::Info,
            Command::Src,
            ts,
            ExtData::FileDrop(descriptor.clone()),
        )
        .await;
    script
        .alpha
        .wait_for("FileDropRequest", |e| matches!(e, UiEvent::FileDropRequest { .. }))
        .await;
    script
        .alpha
        .engine
        .respond_to_file_drop("zulu", ts, true)
        .await
        .expect("accept");

    let answer = script
        .expect("TRANS/DST", |m| m.fmt == FmtType::FileDrop && m.state == State::Trans)
        .await;
    assert!(matches!(answer.ext, ExtData::DropResponse(ref r) if r.cmd == DropCmd::Accept));

    script
        .send(
            FmtType::FileDrop,
            State::Io,
            Command::Src,
            ts,
            ExtData::FileDrop(descriptor),
        )
        .await;
    let (protocol, mut stream) = script.accept_stream().await;
    assert_eq!(protocol, format!("peersync/file-drop/{ts}/1"));
    stream
        .write_all(&patterned_bytes(600))
        .await
        .expect("write partial file");
    drop(stream);

    let failed = script
        .alpha
        .wait_for("TransferFailed", |e| matches!(e, UiEvent::TransferFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        UiEvent::TransferFailed {
            timestamp,
            side: Side::Destination,
            code: InterruptCode::CopyIncomplete,
            cancelled_locally: false,
            ..
        } if timestamp == ts
    ));
    assert!(script.alpha.downloaded_files().is_empty());

    let interrupt = script
        .expect("DST_INTERRUPT", |m| m.command == Command::DstInterrupt)
        .await;
    let ExtData::Interrupt(payload) = &interrupt.ext else {
        panic!("interrupt without payload: {:?}", interrupt.ext);
    };
    assert_eq!(payload.code, InterruptCode::CopyIncomplete);
    assert_eq!(payload.offset, 600);
    assert_eq!(script.alpha.engine.interrupted_transfers("zulu").await.len(), 1);
}

#[tokio::test]
async fn test_offer_reusing_a_live_timestamp_is_refused() {
    let mut script = scripted_pair().await;
    let src = tempfile::tempdir().expect("tempdir");
    let path = create_test_file(src.path(), "mine.bin", &patterned_bytes(512));

    let ts = script
        .alpha
        .engine
        .send_files("zulu", &[path])
        .await
        .expect("send_files");
    let offer = script
        .expect("INFO/SRC", |m| m.fmt == FmtType::FileDrop && m.state == State::Info)
        .await;
    assert_eq!(offer.timestamp, ts);

    let theirs = FileDropData::new(ts, vec![FileInfo::new("/srv/theirs.bin", "theirs.bin", 10)]);
    script
        .send(
            FmtType::FileDrop,
            State::Info,
            Command::Src,
            ts,
            ExtData::FileDrop(theirs),
        )
        .await;

    let refused = script
        .expect("DST_INTERRUPT", |m| m.command == Command::DstInterrupt)
        .await;
    assert_eq!(refused.timestamp, ts);
    assert!(matches!(
        refused.ext,
        ExtData::Interrupt(ref p) if p.code == InterruptCode::QueueFull
    ));
    assert!(script.alpha.engine.pending_file_drops("zulu").await.is_empty());
    let queued = script.alpha.engine.queued_transfers("zulu").await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].direction, Direction::AsSrc);

    script
        .send(
            FmtType::FileDrop,
            State::Trans,
            Command::Dst,
            ts,
            ExtData::DropResponse(DropResponse {
                timestamp: ts,
                cmd: DropCmd::Accept,
                dst_path: None,
            }),
        )
        .await;
    let io = script
        .expect("IO/SRC", |m| {
            m.fmt == FmtType::FileDrop && m.state == State::Io && m.command == Command::Src
        })
        .await;
    assert_eq!(io.timestamp, ts);
}
