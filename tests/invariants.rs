//! Property-based checks for the register-encoding invariants in §8/§9 that
//! don't need a full command-engine drive to exercise: LBA28 encode/decode,
//! the IDENTIFY pair-swapped ASCII fields, the checksum byte, and the
//! "count 0 means 256" convention.

use ide_hba::device::identify::{read_swapped_ascii, IdentifyBuilder};
use ide_hba::Taskfile;
use proptest::prelude::*;

proptest! {
    #[test]
    fn lba28_round_trips_for_any_28_bit_value(sector in 0u32..(1 << 28), mode_bits in 0u8..16) {
        let mut tf = Taskfile::default();
        tf.drivehead = 0xE0 | mode_bits;
        tf.set_lba28(sector);
        prop_assert!(tf.is_lba());
        prop_assert_eq!(tf.lba28(), sector);
        prop_assert_eq!(tf.drivehead & 0xF0, 0xE0 | (mode_bits & 0xF0));
    }

    #[test]
    fn swapped_ascii_round_trips_for_any_printable_text(
        text in "[ -~]{0,24}",
        len in 2usize..32,
    ) {
        let mut b = IdentifyBuilder::new();
        b.write_swapped_ascii(20, len, &text);
        let buf = b.finish();
        let decoded = read_swapped_ascii(&buf, 20, len);
        let expected: String = text.chars().take(len).collect::<String>();
        prop_assert_eq!(decoded, expected.trim_end().to_string());
    }

    #[test]
    fn identify_checksum_byte_always_zeroes_the_buffer_sum(
        word1 in any::<u16>(), word3 in any::<u8>(), word6 in any::<u8>(),
    ) {
        let mut b = IdentifyBuilder::new();
        b.write_word(1, word1);
        b.write_word(3, word3 as u16);
        b.write_word(6, word6 as u16);
        let buf = b.finish();
        let sum = buf.iter().fold(0u8, |acc, &x| acc.wrapping_add(x));
        prop_assert_eq!(sum, 0);
        prop_assert_eq!(buf[510], 0xA5);
    }

    #[test]
    fn count_or_256_never_reports_zero(count in any::<u8>()) {
        let mut tf = Taskfile::default();
        tf.count = count;
        let n = tf.count_or_256();
        prop_assert!(n >= 1 && n <= 256);
        prop_assert_eq!(n == 256, count == 0);
    }
}
