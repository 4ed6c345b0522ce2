//! TTS stage interrupt semantics that hold without live sessions: the
//! first-ever interrupt selects a side without tearing anything down, and
//! later interrupts flip the active index.

use std::time::Duration;

use tokio::time::timeout;

use voicelink::pipeline::{Packet, PacketCommand, PacketPayload, PacketQueue, Stage};
use voicelink::tts::{TtsConfig, TtsStage};

async fn recv_packet(rx: &mut tokio::sync::mpsc::Receiver<Packet>) -> Packet {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("queue closed")
}

/// Run the stage worker without opening synthesizer sessions.
fn worker_only_stage() -> (std::sync::Arc<TtsStage>, std::sync::Arc<PacketQueue>) {
    let stage = TtsStage::new(TtsConfig::default());
    let input = PacketQueue::bounded(16);
    stage.set_input_queue(input.clone());
    stage.base().start().unwrap();
    (stage, input)
}

#[tokio::test]
async fn first_interrupt_only_selects_the_primary_side() {
    let (stage, input) = worker_only_stage();
    assert_eq!(stage.active_idx(), -1);

    input.try_push(Packet::interrupt(1)).unwrap();

    let mut rx = stage.output_queue().take_receiver().unwrap();
    let interrupt = recv_packet(&mut rx).await;
    assert_eq!(interrupt.command, PacketCommand::Interrupt);
    assert_eq!(interrupt.turn_seq, 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(stage.active_idx(), 0);
    assert_eq!(stage.base().cur_turn_seq(), 1);
    // No session existed, so nothing was torn down or rebuilt.
    assert!(stage.health().last_error.is_none());
}

#[tokio::test]
async fn later_interrupts_flip_the_active_index() {
    let (stage, input) = worker_only_stage();

    input.try_push(Packet::interrupt(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(stage.active_idx(), 0);

    input.try_push(Packet::interrupt(2)).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(stage.active_idx(), 1);

    input.try_push(Packet::interrupt(3)).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(stage.active_idx(), 0);
    assert_eq!(stage.base().cur_turn_seq(), 3);
}

#[tokio::test]
async fn stale_text_is_skipped_without_a_session() {
    let (stage, input) = worker_only_stage();

    input.try_push(Packet::interrupt(5)).unwrap();
    input
        .try_push(Packet::data(PacketPayload::Text("老的".into()), 2))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The stale packet was filtered before reaching the synthesizer path,
    // so no "not initialized" error was recorded.
    assert!(stage.health().last_error.is_none());
    assert_eq!(stage.health().dropped, 1);
}

#[tokio::test]
async fn current_turn_text_without_sessions_records_an_error() {
    let (stage, input) = worker_only_stage();

    input
        .try_push(Packet::data(PacketPayload::Text("说点什么".into()), 0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let health = stage.health();
    assert!(
        health
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("not initialized"))
    );
}
