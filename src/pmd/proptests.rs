use super::{Status, SECTOR_SIZE};
use crate::test::{bring_up, checksum, read, write, write_segment};
use proptest::prelude::*;

const MAX_SECTORS: u64 = 64;
const MAX_RW_LEN: usize = 16 * SECTOR_SIZE;

fn make_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

/// (sector_count, start_sector, data), 满足 start_sector * 512 + data.len() <= size
fn in_range_strategy() -> BoxedStrategy<(u64, u64, Vec<u8>)> {
    (1u64..=MAX_SECTORS)
        .prop_flat_map(|sectors| (Just(sectors), 0..sectors))
        .prop_flat_map(|(sectors, start)| {
            let remaining = ((sectors - start) as usize) * SECTOR_SIZE;
            (
                Just(sectors),
                Just(start),
                prop::collection::vec(any::<u8>(), 0..=remaining.min(MAX_RW_LEN)),
            )
        })
        .boxed()
}

/// (sector_count, start_sector, byte_length), 满足 start_sector * 512 + byte_length > size
fn out_of_range_strategy() -> BoxedStrategy<(u64, u64, usize)> {
    (1u64..=MAX_SECTORS)
        .prop_flat_map(|sectors| (Just(sectors), 0..=sectors + 4))
        .prop_flat_map(|(sectors, start)| {
            let size = sectors as usize * SECTOR_SIZE;
            let min_len = (size + 1).saturating_sub(start as usize * SECTOR_SIZE);
            (Just(sectors), Just(start), min_len..=min_len + 2 * SECTOR_SIZE)
        })
        .boxed()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_write_then_read_returns_pattern((sectors, start, data) in in_range_strategy()) {
        let (_host, device) = bring_up(sectors);

        prop_assert_eq!(write(&device, start, data.clone()), Status::Ok);
        let (status, back) = read(&device, start, data.len());
        prop_assert_eq!(status, Status::Ok);
        prop_assert_eq!(back, data);
    }

    #[test]
    fn prop_out_of_range_leaves_store_untouched(
        (sectors, start, len) in out_of_range_strategy(),
        seed in any::<u8>(),
    ) {
        let (_host, device) = bring_up(sectors);
        prop_assert_eq!(
            write(&device, 0, make_pattern(device.size_bytes(), seed)),
            Status::Ok
        );
        let before = checksum(&device);

        prop_assert_eq!(write_segment(&device, start, vec![!seed; len]), Status::IoError);
        let stats = device.run_queue();
        prop_assert_eq!(stats.total(), 0);

        prop_assert_eq!(checksum(&device), before);
    }
}
