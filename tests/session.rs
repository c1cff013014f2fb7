//! End-to-end session behavior: capture through the segmenter, pipelines,
//! and ordered response delivery.

mod common;

use std::sync::atomic::Ordering;

use ember_gateway::config::OtaConfig;
use ember_gateway::protocol::{ControlOut, ResponseFrame};
use ember_gateway::session::{SessionCommand, SessionState};
use ember_gateway::transport::TopicKind;

use common::{
    ScriptedStt, audio_payload, next_control, spawn_session, test_segmenter_config,
};

/// Collect complete response streams (by ordinal) until `count` end markers
async fn collect_streams(rx: &mut common::Outbound, count: usize) -> Vec<ResponseFrame> {
    let mut frames = Vec::new();
    let mut ended = 0;
    while ended < count {
        let (kind, payload) = rx.recv().await.expect("outbound channel closed");
        if kind != TopicKind::AudioOut {
            continue;
        }
        let frame = ResponseFrame::decode(&payload).expect("invalid response frame");
        if frame.is_end() {
            ended += 1;
        }
        frames.push(frame);
    }
    frames
}

/// 1s speech, 0.5s silence, 1s speech at 20ms frames: two utterances, two
/// transcriptions, two ordered tagged response streams.
#[tokio::test]
async fn two_bursts_become_two_ordered_streams() {
    let (stt, calls) = ScriptedStt::new(vec![]);
    let (handle, mut rx) = spawn_session(stt, test_segmenter_config(), OtaConfig::default());
    let _ = next_control(&mut rx).await; // hello_ack

    let mut seq = 0u32;
    for _ in 0..50 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 3_000))).await;
        seq += 1;
    }
    for _ in 0..25 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 0))).await;
        seq += 1;
    }
    for _ in 0..50 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 3_000))).await;
        seq += 1;
    }
    for _ in 0..15 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 0))).await;
        seq += 1;
    }

    let frames = collect_streams(&mut rx, 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // every frame of utterance 0 (including its marker) precedes utterance 1
    let boundary = frames
        .iter()
        .position(|f| f.ordinal == 1)
        .expect("no frames for the second utterance");
    assert!(frames[..boundary].iter().all(|f| f.ordinal == 0));
    assert!(frames[boundary..].iter().all(|f| f.ordinal == 1));
    assert!(frames[boundary - 1].is_end());
    assert!(frames.last().is_some_and(ResponseFrame::is_end));
}

/// A slow first utterance must not let the second utterance's (faster)
/// response jump the queue.
#[tokio::test]
async fn slow_first_pipeline_does_not_reorder_responses() {
    let (stt, _) = ScriptedStt::new(vec![400, 0]);
    let (handle, mut rx) = spawn_session(stt, test_segmenter_config(), OtaConfig::default());
    let _ = next_control(&mut rx).await;

    let mut seq = 0u32;
    for _ in 0..2 {
        for _ in 0..10 {
            handle.send(SessionCommand::Audio(audio_payload(seq, 3_000))).await;
            seq += 1;
        }
        for _ in 0..12 {
            handle.send(SessionCommand::Audio(audio_payload(seq, 0))).await;
            seq += 1;
        }
    }

    let frames = collect_streams(&mut rx, 2).await;
    let ordinals: Vec<u64> = frames.iter().map(|f| f.ordinal).collect();
    let mut sorted = ordinals.clone();
    sorted.sort_unstable();
    assert_eq!(ordinals, sorted, "response frames left out of order");
}

/// Reconnecting with the same identity during the suspend grace period
/// resumes the same session rather than creating a new one.
#[tokio::test]
async fn rebind_during_grace_keeps_the_session() {
    let (stt, _) = ScriptedStt::new(vec![]);
    let (handle, mut rx) = spawn_session(stt, test_segmenter_config(), OtaConfig::default());

    let ControlOut::HelloAck { session_id, .. } = next_control(&mut rx).await else {
        panic!("expected hello_ack first");
    };

    handle.send(SessionCommand::Suspend).await;
    handle.send(SessionCommand::Rebind { audio_params: None }).await;

    let ControlOut::HelloAck {
        session_id: resumed,
        ..
    } = next_control(&mut rx).await
    else {
        panic!("expected hello_ack on rebind");
    };
    assert_eq!(resumed, session_id);
    assert_ne!(handle.state(), SessionState::Suspended);
    assert_ne!(handle.state(), SessionState::Closed);

    // a session resumed into capture still works
    let mut seq = 0u32;
    for _ in 0..10 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 3_000))).await;
        seq += 1;
    }
    for _ in 0..12 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 0))).await;
        seq += 1;
    }
    let frames = collect_streams(&mut rx, 1).await;
    assert!(frames.iter().all(|f| f.ordinal == 0));
}

/// A rebooted device restarts frame sequencing at zero; the rebind must
/// clear the old binding's sequence watermark or every post-reboot frame
/// would be dropped as out-of-order.
#[tokio::test]
async fn sequence_numbers_restart_after_rebind() {
    let (stt, calls) = ScriptedStt::new(vec![]);
    let (handle, mut rx) = spawn_session(stt, test_segmenter_config(), OtaConfig::default());
    let _ = next_control(&mut rx).await; // hello_ack

    // first binding: an utterance at high sequence numbers
    let mut seq = 1_000u32;
    for _ in 0..10 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 3_000))).await;
        seq += 1;
    }
    for _ in 0..12 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 0))).await;
        seq += 1;
    }
    let frames = collect_streams(&mut rx, 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(frames.iter().all(|f| f.ordinal == 0));

    // device reboots: same identity, sequence numbers start over
    handle.send(SessionCommand::Suspend).await;
    handle.send(SessionCommand::Rebind { audio_params: None }).await;
    let _ = next_control(&mut rx).await; // hello_ack on rebind

    let mut seq = 0u32;
    for _ in 0..10 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 3_000))).await;
        seq += 1;
    }
    for _ in 0..12 {
        handle.send(SessionCommand::Audio(audio_payload(seq, 0))).await;
        seq += 1;
    }
    let frames = collect_streams(&mut rx, 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2, "post-reboot audio was never transcribed");
    assert!(frames.iter().all(|f| f.ordinal == 1));
}
