//! Resampler round-trip properties: identity, channel fan-out/mix-down,
//! accumulation behavior, and spectral fidelity of the 48 kHz stereo →
//! 16 kHz mono path.

use std::f64::consts::PI;
use std::time::Duration;

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;
use tokio::time::timeout;

use voicelink::audio::Resampler;
use voicelink::pipeline::{Packet, PacketPayload, PacketQueue, Stage};

async fn recv_pcm(rx: &mut tokio::sync::mpsc::Receiver<Packet>) -> Vec<i16> {
    let packet = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("queue closed");
    match packet.payload {
        PacketPayload::Pcm(samples) => samples,
        other => panic!("expected PCM payload, got {}", other.kind()),
    }
}

async fn drain_pcm(rx: &mut tokio::sync::mpsc::Receiver<Packet>) -> Vec<i16> {
    let mut all = Vec::new();
    while let Ok(Some(packet)) = timeout(Duration::from_millis(200), rx.recv()).await {
        if let PacketPayload::Pcm(samples) = packet.payload {
            all.extend(samples);
        }
    }
    all
}

#[tokio::test]
async fn equal_rates_and_channels_is_identity() {
    let resampler = Resampler::new(16_000, 16_000, 1, 1).unwrap();
    let input = PacketQueue::bounded(16);
    resampler.set_input_queue(input.clone());
    resampler.start().await.unwrap();

    // One 20 ms block at 16 kHz mono.
    let samples: Vec<i16> = (0..320).map(|i| (i * 7 % 2000) as i16 - 1000).collect();
    input
        .try_push(Packet::data(PacketPayload::Pcm(samples.clone()), 0))
        .unwrap();

    let mut rx = resampler.output_queue().take_receiver().unwrap();
    assert_eq!(recv_pcm(&mut rx).await, samples);
}

#[tokio::test]
async fn mono_to_stereo_duplicates_every_sample() {
    let resampler = Resampler::new(16_000, 16_000, 1, 2).unwrap();
    let input = PacketQueue::bounded(16);
    resampler.set_input_queue(input.clone());
    resampler.start().await.unwrap();

    let samples: Vec<i16> = (0..320).map(|i| i as i16).collect();
    input
        .try_push(Packet::data(PacketPayload::Pcm(samples.clone()), 0))
        .unwrap();

    let mut rx = resampler.output_queue().take_receiver().unwrap();
    let out = recv_pcm(&mut rx).await;
    assert_eq!(out.len(), samples.len() * 2);
    for (i, &sample) in samples.iter().enumerate() {
        assert_eq!(out[2 * i], sample);
        assert_eq!(out[2 * i + 1], sample);
    }
}

#[tokio::test]
async fn stereo_to_mono_averages_pairs() {
    let resampler = Resampler::new(48_000, 48_000, 2, 1).unwrap();
    let input = PacketQueue::bounded(16);
    resampler.set_input_queue(input.clone());
    resampler.start().await.unwrap();

    // One 20 ms stereo block at 48 kHz: 960 frames of (1000, 3000).
    let mut samples = Vec::with_capacity(1920);
    for _ in 0..960 {
        samples.push(1000i16);
        samples.push(3000i16);
    }
    input
        .try_push(Packet::data(PacketPayload::Pcm(samples), 0))
        .unwrap();

    let mut rx = resampler.output_queue().take_receiver().unwrap();
    let out = recv_pcm(&mut rx).await;
    assert_eq!(out.len(), 960);
    assert!(out.iter().all(|&s| (s - 2000).abs() <= 1));
}

#[tokio::test]
async fn input_shorter_than_a_block_is_held_back() {
    let resampler = Resampler::new(16_000, 16_000, 1, 1).unwrap();
    let input = PacketQueue::bounded(16);
    resampler.set_input_queue(input.clone());
    resampler.start().await.unwrap();

    // 300 < 320 samples: nothing may come out yet.
    input
        .try_push(Packet::data(PacketPayload::Pcm(vec![5i16; 300]), 0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut rx = resampler.output_queue().take_receiver().unwrap();
    assert!(rx.try_recv().is_err());

    // Topping up past one block releases exactly one block.
    input
        .try_push(Packet::data(PacketPayload::Pcm(vec![5i16; 100]), 0))
        .unwrap();
    let out = recv_pcm(&mut rx).await;
    assert_eq!(out.len(), 320);
}

#[tokio::test]
async fn downsample_48k_stereo_to_16k_mono_keeps_the_tone() {
    let resampler = Resampler::new(48_000, 16_000, 2, 1).unwrap();
    let input = PacketQueue::bounded(256);
    resampler.set_input_queue(input.clone());
    resampler.start().await.unwrap();
    let mut rx = resampler.output_queue().take_receiver().unwrap();

    // 2 s of a 1 kHz sine at 48 kHz stereo, fed as 20 ms packets.
    let total_frames = 96_000;
    let mut produced = Vec::with_capacity(total_frames * 2);
    for n in 0..total_frames {
        let value = (0.5 * (2.0 * PI * 1000.0 * n as f64 / 48_000.0).sin() * 32767.0) as i16;
        produced.push(value);
        produced.push(value);
    }
    let mut collected = Vec::new();
    for chunk in produced.chunks(1920) {
        if input
            .try_push(Packet::data(PacketPayload::Pcm(chunk.to_vec()), 0))
            .is_err()
        {
            // Keep the bounded queue from overflowing by draining as we go.
            collected.extend(drain_pcm(&mut rx).await);
            input
                .try_push(Packet::data(PacketPayload::Pcm(chunk.to_vec()), 0))
                .unwrap();
        }
    }
    collected.extend(drain_pcm(&mut rx).await);

    // ~32k output samples at 16 kHz (rubato may hold back a partial block).
    assert!(
        collected.len() > 30_000 && collected.len() <= 32_100,
        "unexpected output length {}",
        collected.len()
    );

    // Spectral check: dominant bin within ±5 Hz of 1 kHz.
    let fft_len = 16_384;
    let offset = 2_000; // skip the resampler transient
    let mut buffer: Vec<Complex<f64>> = collected[offset..offset + fft_len]
        .iter()
        .map(|&s| Complex::new(s as f64 / 32768.0, 0.0))
        .collect();
    FftPlanner::new().plan_fft_forward(fft_len).process(&mut buffer);

    let peak_bin = (1..fft_len / 2)
        .max_by(|&a, &b| {
            buffer[a]
                .norm_sqr()
                .partial_cmp(&buffer[b].norm_sqr())
                .unwrap()
        })
        .unwrap();
    let peak_hz = peak_bin as f64 * 16_000.0 / fft_len as f64;
    assert!(
        (peak_hz - 1000.0).abs() <= 5.0,
        "dominant frequency {peak_hz:.1} Hz"
    );
}
