use proptest::prelude::*;
use vmx86_decoder::{decode_one, DecodeError, DecodeMode, MAX_INSTRUCTION_LEN};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    // Arbitrary input never panics and any success consumes a prefix of the window.
    #[test]
    fn decode_is_total(bytes in proptest::collection::vec(any::<u8>(), 0..24), ip in any::<u64>()) {
        match decode_one(DecodeMode::Bits64, ip, &bytes) {
            Ok(d) => {
                prop_assert!(d.len() >= 1);
                prop_assert!(d.len() <= MAX_INSTRUCTION_LEN);
                prop_assert!(d.len() <= bytes.len());
            }
            Err(DecodeError::EmptyInput) => prop_assert!(bytes.is_empty()),
            Err(DecodeError::Truncated { available }) => {
                prop_assert_eq!(available, bytes.len().min(MAX_INSTRUCTION_LEN));
            }
            Err(DecodeError::Invalid) => {}
        }
    }

    // Appending bytes after a complete instruction does not change the decode.
    #[test]
    fn trailing_bytes_are_ignored(tail in proptest::collection::vec(any::<u8>(), 0..8)) {
        let mut bytes = vec![0x48, 0x8D, 0x44, 0x24, 0x08]; // lea rax, [rsp+8]
        bytes.extend_from_slice(&tail);
        let d = decode_one(DecodeMode::Bits64, 0x4000, &bytes).unwrap();
        prop_assert_eq!(d.len(), 5);
    }
}
