use proptest::prelude::*;

use pane_stream::frame::{FrameError, MAX_PANE_ID_LEN, decode_frame, encode_frame, wire_pane_id};

// --- Strategies ---

/// Pane IDs that fit a frame header: up to 63 arbitrary non-NUL chars is
/// at most 252 bytes, and ASCII IDs cover the full 0..=255 byte range.
fn arb_pane_id() -> impl Strategy<Value = String> {
    prop_oneof!["[^\\x00]{0,63}", "[ -~]{0,255}"]
}

fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2048)
}

proptest! {
    #[test]
    fn round_trip_preserves_id_and_payload(id in arb_pane_id(), data in arb_payload()) {
        prop_assume!(id.len() <= MAX_PANE_ID_LEN);
        let frame = encode_frame(&id, &data);
        prop_assert_eq!(frame.len(), 1 + id.len() + data.len());

        let decoded = decode_frame(&frame).unwrap();
        prop_assert_eq!(decoded.pane_id, id.as_str());
        prop_assert_eq!(decoded.data, data.as_slice());
    }

    #[test]
    fn long_ascii_ids_truncate_to_first_255_bytes(id in "[a-z%0-9]{256,600}", data in arb_payload()) {
        let frame = encode_frame(&id, &data);
        prop_assert_eq!(frame[0] as usize, MAX_PANE_ID_LEN);

        let decoded = decode_frame(&frame).unwrap();
        prop_assert_eq!(decoded.pane_id, &id[..MAX_PANE_ID_LEN]);
        prop_assert_eq!(decoded.data, data.as_slice());

        // Truncation is deterministic and the truncated ID is stable.
        prop_assert_eq!(encode_frame(&id, &data), frame.clone());
        prop_assert_eq!(encode_frame(decoded.pane_id, &data), frame);
    }

    #[test]
    fn truncated_ids_stay_valid_utf8(id in "[^\\x00]{64,200}") {
        let wire = wire_pane_id(&id);
        prop_assert!(wire.len() <= MAX_PANE_ID_LEN);
        prop_assert!(id.starts_with(wire));
        if id.len() > MAX_PANE_ID_LEN {
            // A char is at most 4 bytes, so the cut loses at most 3.
            prop_assert!(wire.len() >= MAX_PANE_ID_LEN - 3);
        }
        let frame = encode_frame(&id, b"x");
        prop_assert_eq!(decode_frame(&frame).unwrap().pane_id, wire);
    }

    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        match decode_frame(&bytes) {
            Ok(frame) => {
                prop_assert_eq!(frame.pane_id.len(), bytes[0] as usize);
                prop_assert_eq!(1 + frame.pane_id.len() + frame.data.len(), bytes.len());
            }
            Err(FrameError::Empty) => prop_assert!(bytes.is_empty()),
            Err(FrameError::Truncated { declared, available }) => {
                prop_assert!(declared > available);
                prop_assert_eq!(available, bytes.len() - 1);
            }
            Err(FrameError::InvalidPaneId) => {}
        }
    }

    #[test]
    fn short_frames_report_truncation(len in 1u8..=255, have in 0usize..255) {
        prop_assume!(have < len as usize);
        let mut bytes = vec![len];
        bytes.extend(std::iter::repeat_n(b'a', have));
        prop_assert_eq!(
            decode_frame(&bytes),
            Err(FrameError::Truncated { declared: len as usize, available: have })
        );
    }
}

#[test]
fn empty_frame_is_rejected() {
    assert_eq!(decode_frame(&[]), Err(FrameError::Empty));
}
