//! Property-based tests for LANSHARE
//!
//! Tests invariants of liveness derivation, chunking, and reassembly.

use bytes::Bytes;
use lanshare_core::connection::ChannelMessage;
use lanshare_core::transfer::{ControlMessage, ReceiveOutcome, TransferReceiver};
use lanshare_core::{CHUNK_SIZE, FileMeta};
use lanshare_discovery::{Device, DeviceId, DeviceStatus, ONLINE_WINDOW};
use proptest::prelude::*;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Liveness Properties
// ============================================================================

proptest! {
    /// Status is Online exactly while the silence is below the window
    #[test]
    fn prop_status_follows_silence(silence_ms in 0u64..120_000, window_ms in 1u64..60_000) {
        let last_seen_at = Instant::now();
        let device = Device {
            id: DeviceId::random(),
            display_name: "phone".to_string(),
            last_seen_at,
        };

        let now = last_seen_at + Duration::from_millis(silence_ms);
        let window = Duration::from_millis(window_ms);
        let expected = if silence_ms < window_ms {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        };

        prop_assert_eq!(device.status_at(now, window), expected);
        prop_assert_eq!(device.silence(now), Duration::from_millis(silence_ms));
    }

    /// A clock reading before the last heartbeat never marks a device offline
    #[test]
    fn prop_earlier_clock_is_online(earlier_ms in 0u64..10_000) {
        let base = Instant::now();
        let device = Device {
            id: DeviceId::random(),
            display_name: "laptop".to_string(),
            last_seen_at: base + Duration::from_millis(earlier_ms),
        };
        prop_assert_eq!(device.status_at(base, ONLINE_WINDOW), DeviceStatus::Online);
    }
}

// ============================================================================
// Chunking Properties
// ============================================================================

fn split(data: &[u8], chunk_size: usize) -> Vec<ChannelMessage> {
    data.chunks(chunk_size)
        .map(|c| ChannelMessage::Binary(Bytes::copy_from_slice(c)))
        .collect()
}

fn deliver(data: &[u8], chunk_size: usize) -> (Vec<u64>, Bytes) {
    let mut receiver = TransferReceiver::new(DeviceId::from("sender"), chunk_size, u64::MAX);
    let meta = FileMeta::new("blob.bin", data.len() as u64, "application/octet-stream");
    receiver
        .handle(ChannelMessage::Text(ControlMessage::Meta(meta).to_json()))
        .unwrap();

    let mut progress = Vec::new();
    for chunk in split(data, chunk_size) {
        match receiver.handle(chunk).unwrap() {
            ReceiveOutcome::Progress(p) => progress.push(p.bytes_received),
            other => panic!("unexpected {other:?}"),
        }
    }

    match receiver
        .handle(ChannelMessage::Text(ControlMessage::End.to_json()))
        .unwrap()
    {
        ReceiveOutcome::Completed(file) => (progress, file.data),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_chunk_boundaries() {
    let c = CHUNK_SIZE;
    for n in [0, 1, c - 1, c, c + 1, 10 * c + 7] {
        let data: Vec<u8> = (0..n).map(|i| (i % 253) as u8).collect();
        let meta = FileMeta::new("blob.bin", n as u64, "application/octet-stream");

        let expected_chunks = n.div_ceil(c) as u64;
        assert_eq!(meta.chunk_count(c), expected_chunks, "chunk count for {n}");

        let (progress, received) = deliver(&data, c);
        assert_eq!(progress.len() as u64, expected_chunks);
        assert_eq!(&received[..], &data[..], "round trip for {n}");
    }
}

proptest! {
    /// Reassembly is byte-exact for any size and chunk size
    #[test]
    fn prop_reassembly_byte_exact(
        data in prop::collection::vec(any::<u8>(), 0..20_000),
        chunk_size in 1usize..5_000,
    ) {
        let (_, received) = deliver(&data, chunk_size);
        prop_assert_eq!(&received[..], &data[..]);
    }

    /// Progress rises strictly and ends at the file size
    #[test]
    fn prop_progress_monotonic(len in 1usize..50_000, chunk_size in 1usize..20_000) {
        let data = vec![0xAB; len];
        let (progress, _) = deliver(&data, chunk_size);

        prop_assert!(progress.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(progress.last().copied(), Some(len as u64));
        prop_assert!(progress.iter().all(|&b| b <= len as u64));
    }

    /// Only the final chunk may be shorter than the chunk size
    #[test]
    fn prop_chunk_count_matches_split(len in 0u64..200_000, chunk_size in 1usize..40_000) {
        let meta = FileMeta::new("x", len, "application/octet-stream");
        let data = vec![0u8; len as usize];
        prop_assert_eq!(meta.chunk_count(chunk_size), split(&data, chunk_size).len() as u64);
    }
}
