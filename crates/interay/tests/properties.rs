//! Property-based tests for the wire primitives.

use interay::transport::{ReceiveOutcome, ReceiveTracker};
use interay::{GenericSerializer, PacketBuffer, Serializer, TypeTag, Value, method_id};
use proptest::prelude::*;

fn reference_hash(name: &str) -> u32 {
    name.encode_utf16()
        .fold(0u32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as u32))
}

proptest! {
    #[test]
    fn prop_packet_fields_read_back(a in any::<u16>(), b in any::<u32>(), c in any::<i64>(), d in any::<f64>(), tail in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut packet = PacketBuffer::new(2 + 4 + 8 + 8 + tail.len());
        packet.write_u16(a).unwrap();
        packet.write_u32(b).unwrap();
        packet.write_i64(c).unwrap();
        packet.write_f64(d).unwrap();
        packet.write_bytes(&tail).unwrap();
        prop_assert_eq!(packet.remaining(), 0);

        packet.rewind();
        prop_assert_eq!(packet.read_u16().unwrap(), a);
        prop_assert_eq!(packet.read_u32().unwrap(), b);
        prop_assert_eq!(packet.read_i64().unwrap(), c);
        prop_assert_eq!(packet.read_f64().unwrap().to_bits(), d.to_bits());
        prop_assert_eq!(packet.read_bytes(tail.len()).unwrap(), tail);
    }
}

proptest! {
    #[test]
    fn prop_out_of_range_keeps_cursor(size in 0usize..128, start in 0usize..128, extra in 1usize..64) {
        let start = start.min(size);
        let mut packet = PacketBuffer::new(size);
        packet.seek(start).unwrap();

        let too_many = size - start + extra;
        prop_assert!(packet.read_bytes(too_many).is_err());
        prop_assert_eq!(packet.position(), start);
        prop_assert!(packet.write_bytes(&vec![0; too_many]).is_err());
        prop_assert_eq!(packet.position(), start);
    }
}

proptest! {
    #[test]
    fn prop_method_hash_is_stable(name in "\\PC{0,40}") {
        prop_assert_eq!(method_id(&name), method_id(&name));
        prop_assert_eq!(method_id(&name).0, reference_hash(&name));
    }
}

proptest! {
    #[test]
    fn prop_strings_survive_the_codec(text in "\\PC{0,200}") {
        let serializer = GenericSerializer::new();
        let value = Value::from(text.as_str());
        let mut packet = PacketBuffer::new(serializer.encoded_len(&value).unwrap());
        serializer.serialize(&mut packet, &value).unwrap();

        packet.rewind();
        prop_assert_eq!(serializer.deserialize(&mut packet).unwrap(), value);
        prop_assert_eq!(packet.remaining(), 0);
    }
}

proptest! {
    #[test]
    fn prop_integer_arrays_survive_the_codec(items in prop::collection::vec(any::<i32>(), 0..100)) {
        let serializer = GenericSerializer::new();
        let value = Value::array(TypeTag::I32, items.into_iter().map(Value::I32).collect());
        let mut packet = PacketBuffer::new(serializer.encoded_len(&value).unwrap());
        serializer.serialize(&mut packet, &value).unwrap();

        packet.rewind();
        prop_assert_eq!(serializer.deserialize(&mut packet).unwrap(), value);
    }
}

proptest! {
    #[test]
    fn prop_truncated_payloads_fail(text in "[a-z]{1,50}", cut in 1usize..10) {
        let serializer = GenericSerializer::new();
        let value = Value::from(text.as_str());
        let mut full = PacketBuffer::new(serializer.encoded_len(&value).unwrap());
        serializer.serialize(&mut full, &value).unwrap();

        let bytes = full.written();
        let keep = bytes.len().saturating_sub(cut);
        let mut truncated = PacketBuffer::from_vec(bytes[..keep].to_vec());
        prop_assert!(serializer.deserialize(&mut truncated).is_err());
    }
}

fn scrambled_sequences() -> impl Strategy<Value = Vec<u32>> {
    (1u32..200).prop_flat_map(|count| {
        let mut sequences: Vec<u32> = (1..=count).collect();
        sequences.extend((1..=count).step_by(3));
        Just(sequences).prop_shuffle()
    })
}

proptest! {
    #[test]
    fn prop_receiver_delivers_in_order(sequences in scrambled_sequences()) {
        let count = *sequences.iter().max().unwrap();
        let mut tracker = ReceiveTracker::default();
        let mut delivered = Vec::new();

        for sequence in sequences {
            let outcome = tracker.receive(sequence, sequence.to_le_bytes().to_vec());
            prop_assert_ne!(outcome, ReceiveOutcome::OutOfWindow);
            while let Some(data) = tracker.pop_ready() {
                delivered.push(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
            }
        }

        prop_assert_eq!(delivered, (1..=count).collect::<Vec<_>>());
        prop_assert_eq!(tracker.buffered(), 0);
    }
}
