//! Opus encoder stage: whole-frame framing, interrupt buffer clearing, and
//! encode-channel backpressure.

use std::time::Duration;

use tokio::time::timeout;

use voicelink::audio::OpusEncoder;
use voicelink::pipeline::{Packet, PacketCommand, PacketPayload, PacketQueue, Stage};

const STEREO_FRAME: usize = 960 * 2;

fn sine_frame(frames: usize) -> Vec<i16> {
    (0..frames * STEREO_FRAME)
        .map(|i| ((i as f64 * 0.05).sin() * 8000.0) as i16)
        .collect()
}

async fn recv_audio(rx: &mut tokio::sync::mpsc::Receiver<Packet>) -> Packet {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("queue closed")
}

#[tokio::test]
async fn one_frame_packet_per_whole_960_sample_chunk() {
    let encoder = OpusEncoder::new(48_000, 2).unwrap();
    let input = PacketQueue::bounded(16);
    encoder.set_input_queue(input.clone());
    encoder.start().await.unwrap();

    input
        .try_push(Packet::data(PacketPayload::Pcm(sine_frame(3)), 0))
        .unwrap();

    let mut rx = encoder.output_queue().take_receiver().unwrap();
    for _ in 0..3 {
        let packet = recv_audio(&mut rx).await;
        let PacketPayload::Audio(frame) = packet.payload else {
            panic!("expected audio frame");
        };
        assert!(!frame.payload.is_empty());
    }

    // A partial chunk must never produce a frame.
    input
        .try_push(Packet::data(PacketPayload::Pcm(vec![0i16; 500]), 0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn partial_chunks_accumulate_across_packets() {
    let encoder = OpusEncoder::new(48_000, 2).unwrap();
    let input = PacketQueue::bounded(16);
    encoder.set_input_queue(input.clone());
    encoder.start().await.unwrap();

    // 1200 + 720 = 1920 samples: exactly one stereo frame.
    input
        .try_push(Packet::data(PacketPayload::Pcm(vec![100i16; 1200]), 0))
        .unwrap();
    input
        .try_push(Packet::data(PacketPayload::Pcm(vec![100i16; 720]), 0))
        .unwrap();

    let mut rx = encoder.output_queue().take_receiver().unwrap();
    let packet = recv_audio(&mut rx).await;
    assert!(matches!(packet.payload, PacketPayload::Audio(_)));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn interrupt_clears_the_accumulation_buffer() {
    let encoder = OpusEncoder::new(48_000, 2).unwrap();
    let input = PacketQueue::bounded(16);
    encoder.set_input_queue(input.clone());
    encoder.start().await.unwrap();

    // Leave a partial chunk buffered, then interrupt.
    input
        .try_push(Packet::data(PacketPayload::Pcm(vec![7i16; 1000]), 0))
        .unwrap();
    input.try_push(Packet::interrupt(1)).unwrap();
    // Completing what would have been the old frame must not emit audio:
    // the buffer restarted empty at the interrupt.
    input
        .try_push(Packet::data(PacketPayload::Pcm(vec![7i16; 920]), 1))
        .unwrap();

    let mut rx = encoder.output_queue().take_receiver().unwrap();
    let first = recv_audio(&mut rx).await;
    assert_eq!(first.command, PacketCommand::Interrupt);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn frames_carry_the_turn_they_were_encoded_for() {
    let encoder = OpusEncoder::new(48_000, 2).unwrap();
    let input = PacketQueue::bounded(16);
    encoder.set_input_queue(input.clone());
    encoder.start().await.unwrap();

    // A multi-frame request, then a barge-in while the encode task is
    // still pacing through it. Whatever makes it out of the old request
    // must still be stamped with the old turn, never relabeled as turn 1.
    input
        .try_push(Packet::data(PacketPayload::Pcm(sine_frame(5)), 0))
        .unwrap();
    input.try_push(Packet::interrupt(1)).unwrap();

    let mut rx = encoder.output_queue().take_receiver().unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let mut audio_frames = 0;
    while let Ok(packet) = rx.try_recv() {
        match packet.payload {
            PacketPayload::Audio(_) => {
                assert_eq!(packet.turn_seq, 0, "stale frame relabeled as current");
                audio_frames += 1;
            }
            _ => assert_eq!(packet.command, PacketCommand::Interrupt),
        }
    }
    assert!(audio_frames >= 1);
    encoder.stop().await;
}

#[tokio::test]
async fn full_encode_channel_drops_instead_of_blocking() {
    let encoder = OpusEncoder::with_encode_capacity(48_000, 2, 1).unwrap();
    let input = PacketQueue::bounded(128);
    encoder.set_input_queue(input.clone());
    encoder.start().await.unwrap();

    for _ in 0..100 {
        input
            .try_push(Packet::data(PacketPayload::Pcm(sine_frame(1)), 0))
            .unwrap();
    }

    // The 20 ms pacer keeps the encode task busy, so nearly every request
    // behind the capacity-1 channel is dropped rather than queued.
    let mut rx = encoder.output_queue().take_receiver().unwrap();
    let first = recv_audio(&mut rx).await;
    assert!(matches!(first.payload, PacketPayload::Audio(_)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let health = encoder.health();
    assert!(
        health.dropped >= 90,
        "expected most requests dropped, got {}",
        health.dropped
    );
    encoder.stop().await;
}
