use proptest::prelude::*;
use tessera_domain::{TileId, UserId};
use tessera_protocol::{EPOCH_LEN, Frame, FrameError, HEADER_LEN, TIMESTAMP_MAX};

fn submission(tile: u8, payload: &[u8]) -> Frame {
	let mut data = vec![0u8; HEADER_LEN];
	data[3] = tile;
	data.extend_from_slice(payload);
	Frame::decode(data).expect("decode submission")
}

#[test]
fn ids_sort_by_time_then_tile() {
	let mut a = submission(200, &[]);
	a.stamp(10).expect("stamp");
	let mut b = submission(1, &[]);
	b.stamp(11).expect("stamp");
	let mut c = submission(2, &[]);
	c.stamp(11).expect("stamp");

	assert!(a.id() < b.id());
	assert!(b.id() < c.id());
	assert!(a.as_bytes()[..4] < b.as_bytes()[..4]);
}

#[test]
fn submission_bytes_survive_into_bytes() {
	let mut f = submission(9, &[1, 2, 3]);
	f.stamp(77).expect("stamp");
	f.set_user_id(UserId(12)).expect("user id");
	let raw = f.clone().into_bytes();
	assert_eq!(&raw[..], f.as_bytes());
	assert_eq!(Frame::decode_stored(raw.to_vec()).expect("decode stored"), f);
}

#[test]
fn header_only_submission_is_minimal() {
	assert!(Frame::decode(vec![0u8; HEADER_LEN]).is_ok());
	match Frame::decode(vec![1, 2, 3]) {
		Err(FrameError::TooShort { need, have }) => {
			assert_eq!(need, HEADER_LEN);
			assert_eq!(have, 3);
		}
		other => panic!("expected TooShort, got: {other:?}"),
	}
}

#[test]
fn checkpoint_frame_is_longer_by_epoch() {
	let mut f = submission(3, &[0xEE]);
	f.stamp_checkpoint(42);
	assert_eq!(f.len(), HEADER_LEN + EPOCH_LEN + 1);
	assert_eq!(f.checkpoint_epoch(), Some(42));
	assert_eq!(f.payload(), &[0xEE]);
}

proptest! {
	#[test]
	fn stored_frames_reencode_byte_for_byte(
		ts in 1u32..=TIMESTAMP_MAX,
		tile in any::<u8>(),
		user in 0u32..=UserId::MAX_FRAME,
		deleted in any::<bool>(),
		payload in prop::collection::vec(any::<u8>(), 0..64),
	) {
		let mut f = submission(tile, &payload);
		f.stamp(ts).unwrap();
		f.set_user_id(UserId(user)).unwrap();
		f.set_deleted(deleted);

		let back = Frame::decode_stored(f.as_bytes().to_vec()).unwrap();
		prop_assert_eq!(back.as_bytes(), f.as_bytes());
		prop_assert_eq!(back.timestamp(), ts);
		prop_assert_eq!(back.tile_id(), TileId(tile));
		prop_assert_eq!(back.user_id(), UserId(user));
		prop_assert_eq!(back.deleted(), deleted);
		prop_assert_eq!(back.payload(), &payload[..]);
	}
}
