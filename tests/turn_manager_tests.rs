//! Turn manager behavior: semantic sentence boundaries, silence timeout,
//! command interrupts, the broadcast switch, and multi-turn continuity
//! (packets stamped by upstream stages must never be filtered here).

use std::time::Duration;

use tokio::time::timeout;

use voicelink::pipeline::{
    Packet, PacketCommand, PacketPayload, PacketQueue, Stage, TurnManager, TurnManagerConfig,
};

async fn recv_packet(rx: &mut tokio::sync::mpsc::Receiver<Packet>) -> Packet {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("queue closed")
}

fn started_manager(config: TurnManagerConfig) -> (std::sync::Arc<TurnManager>, std::sync::Arc<PacketQueue>) {
    let manager = TurnManager::new(config);
    let input = PacketQueue::bounded(32);
    manager.set_input_queue(input.clone());
    (manager, input)
}

#[tokio::test]
async fn punctuation_closes_the_turn_exactly_once() {
    let (manager, input) = started_manager(TurnManagerConfig::default());
    manager.start().await.unwrap();

    input
        .try_push(Packet::data(PacketPayload::Text("你好".into()), 0))
        .unwrap();
    input
        .try_push(Packet::data(PacketPayload::Text("世界。".into()), 0))
        .unwrap();

    let mut rx = manager.output_queue().take_receiver().unwrap();

    // The semantic interrupt precedes the sentence that opens the turn.
    let interrupt = recv_packet(&mut rx).await;
    assert_eq!(interrupt.command, PacketCommand::Interrupt);
    assert_eq!(interrupt.turn_seq, 1);

    let sentence = recv_packet(&mut rx).await;
    assert_eq!(sentence.command, PacketCommand::None);
    assert_eq!(sentence.turn_seq, 1);
    assert_eq!(sentence.payload, PacketPayload::Text("你好世界。".into()));

    // The first fragment alone must not have advanced the turn.
    assert!(rx.try_recv().is_err());
    assert_eq!(manager.base().cur_turn_seq(), 1);
    assert_eq!(manager.current_turn().unwrap().turn_seq, 1);
}

#[tokio::test]
async fn silence_timeout_closes_turn_on_next_input() {
    let (manager, input) = started_manager(TurnManagerConfig {
        silence_timeout: Duration::from_millis(200),
        ..Default::default()
    });
    manager.start().await.unwrap();

    input
        .try_push(Packet::data(PacketPayload::Text("hello".into()), 0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    input
        .try_push(Packet::data(PacketPayload::Text(" world".into()), 0))
        .unwrap();

    let mut rx = manager.output_queue().take_receiver().unwrap();
    let interrupt = recv_packet(&mut rx).await;
    assert_eq!(interrupt.command, PacketCommand::Interrupt);

    let sentence = recv_packet(&mut rx).await;
    assert_eq!(sentence.payload, PacketPayload::Text("hello world".into()));
    assert_eq!(sentence.turn_seq, 1);
}

#[tokio::test]
async fn command_interrupt_flushes_buffer_into_new_turn() {
    let (manager, input) = started_manager(TurnManagerConfig::default());
    manager.start().await.unwrap();

    input
        .try_push(Packet::data(PacketPayload::Text("partial".into()), 0))
        .unwrap();
    // External barge-in; the manager assigns the real sequence.
    input.try_push(Packet::interrupt(0)).unwrap();

    let mut rx = manager.output_queue().take_receiver().unwrap();
    let interrupt = recv_packet(&mut rx).await;
    assert_eq!(interrupt.command, PacketCommand::Interrupt);
    assert_eq!(interrupt.turn_seq, 1);

    let carried = recv_packet(&mut rx).await;
    assert_eq!(carried.payload, PacketPayload::Text("partial".into()));
    assert_eq!(carried.turn_seq, 1);
}

#[tokio::test]
async fn semantic_interrupt_broadcast_can_be_disabled() {
    let (manager, input) = started_manager(TurnManagerConfig::default());
    manager.set_semantic_interrupt(false);
    manager.start().await.unwrap();

    input
        .try_push(Packet::data(PacketPayload::Text("好的。".into()), 0))
        .unwrap();

    let mut rx = manager.output_queue().take_receiver().unwrap();
    let first = recv_packet(&mut rx).await;
    assert_eq!(first.command, PacketCommand::None);
    assert_eq!(first.payload, PacketPayload::Text("好的。".into()));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn non_text_payloads_pass_through_unchanged() {
    let (manager, input) = started_manager(TurnManagerConfig::default());
    manager.start().await.unwrap();

    input
        .try_push(Packet::data(PacketPayload::Pcm(vec![1, 2, 3]), 0))
        .unwrap();

    let mut rx = manager.output_queue().take_receiver().unwrap();
    let forwarded = recv_packet(&mut rx).await;
    assert_eq!(forwarded.payload, PacketPayload::Pcm(vec![1, 2, 3]));
}

#[tokio::test]
async fn every_sentence_closes_even_with_a_fixed_upstream_seq() {
    // Upstream stages stamp text with their own counter, which does not
    // advance on semantic closes; a whole conversation can arrive at
    // turn_seq 0. Each sentence must still open a new turn.
    let (manager, input) = started_manager(TurnManagerConfig::default());
    manager.start().await.unwrap();

    input
        .try_push(Packet::data(PacketPayload::Text("第一句。".into()), 0))
        .unwrap();
    input
        .try_push(Packet::data(PacketPayload::Text("第二句。".into()), 0))
        .unwrap();

    let mut rx = manager.output_queue().take_receiver().unwrap();
    for (turn, text) in [(1u64, "第一句。"), (2, "第二句。")] {
        let interrupt = recv_packet(&mut rx).await;
        assert_eq!(interrupt.command, PacketCommand::Interrupt);
        assert_eq!(interrupt.turn_seq, turn);

        let sentence = recv_packet(&mut rx).await;
        assert_eq!(sentence.turn_seq, turn);
        assert_eq!(sentence.payload, PacketPayload::Text(text.into()));
    }
    assert_eq!(manager.base().cur_turn_seq(), 2);
}

#[tokio::test]
async fn archived_turn_keeps_the_spoken_text() {
    let (manager, input) = started_manager(TurnManagerConfig::default());
    manager.start().await.unwrap();

    input
        .try_push(Packet::data(PacketPayload::Text("第一句。".into()), 0))
        .unwrap();
    input
        .try_push(Packet::data(PacketPayload::Text("第二句。".into()), 0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let previous = manager.previous_turn().expect("previous turn archived");
    assert_eq!(previous.turn_seq, 1);
    assert_eq!(previous.text, "第二句。");
}
