use std::sync::Arc;

use crate::{
    CdevConfig, CdevError, CpuCache, Interrupt, MmlsDevice, MmlsRange, RamDiskBackend,
    SECTOR_SIZE, STATIC_BUFFER_SIZE,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
    Flush { offset: u32, len: u32 },
    CheckMedium,
}

const MAX_DEVICE_SIZE: u32 = 256 * 1024;
const MAX_OPS: usize = 48;
const MAX_RW_LEN: usize = 6 * 1024;

const SECTOR_SIZE_U32: u32 = SECTOR_SIZE as u32;

fn device_size_strategy() -> impl Strategy<Value = u32> {
    (1u32..=MAX_DEVICE_SIZE / SECTOR_SIZE_U32).prop_map(|sectors| sectors * SECTOR_SIZE_U32)
}

// Offsets deliberately run a little past the end so the out-of-range path is exercised too.
fn offset_strategy(size: u32) -> BoxedStrategy<u32> {
    let any = 0u32..size + SECTOR_SIZE_U32;
    let sector_aligned = (0u32..=size / SECTOR_SIZE_U32).prop_map(|lba| lba * SECTOR_SIZE_U32);
    let near_end = (0u32..=SECTOR_SIZE_U32).prop_map(move |delta| size.saturating_sub(delta));

    prop_oneof![
        4 => any,
        2 => sector_aligned,
        2 => near_end,
    ]
    .boxed()
}

fn op_strategy(size: u32) -> BoxedStrategy<Op> {
    prop_oneof![
        5 => (offset_strategy(size), prop::collection::vec(any::<u8>(), 0..=MAX_RW_LEN))
            .prop_map(|(offset, data)| Op::Write { offset, data }),
        4 => (offset_strategy(size), 0usize..=MAX_RW_LEN)
            .prop_map(|(offset, len)| Op::Read { offset, len }),
        1 => (offset_strategy(size), 0u32..=2 * MAX_RW_LEN as u32)
            .prop_map(|(offset, len)| Op::Flush { offset, len }),
        1 => Just(Op::CheckMedium),
    ]
    .boxed()
}

fn scenario_strategy() -> BoxedStrategy<(u32, Vec<Op>)> {
    device_size_strategy()
        .prop_flat_map(|size| (Just(size), prop::collection::vec(op_strategy(size), 1..=MAX_OPS)))
        .boxed()
}

fn static_ops_strategy() -> BoxedStrategy<Vec<Op>> {
    prop::collection::vec(op_strategy(STATIC_BUFFER_SIZE as u32), 1..=MAX_OPS).boxed()
}

/// Runs `ops` against `dev` and a flat byte model. When `backend` is given, committed writes must
/// also be visible on its medium.
fn run_ops(dev: &MmlsDevice, backend: Option<&RamDiskBackend>, ops: &[Op]) -> TestCaseResult {
    let size = dev.query_size() as usize;
    let mut model = vec![0u8; size];
    let intr = Interrupt::new();

    for op in ops {
        match op {
            Op::Write { offset, data } => {
                let offset = *offset as usize;
                let res = dev.write(offset as u64, data, &intr);
                if offset >= size {
                    prop_assert!(matches!(res, Err(CdevError::OutOfRange { .. })), "{res:?}");
                    continue;
                }
                let n = res.unwrap();
                prop_assert_eq!(n, data.len().min(size - offset));
                model[offset..offset + n].copy_from_slice(&data[..n]);
            }
            Op::Read { offset, len } => {
                let offset = *offset as usize;
                let mut buf = vec![0xA5u8; *len];
                let res = dev.read(offset as u64, &mut buf, &intr);
                if offset >= size {
                    prop_assert!(matches!(res, Err(CdevError::OutOfRange { .. })), "{res:?}");
                    continue;
                }
                let n = res.unwrap();
                prop_assert_eq!(n, (*len).min(size - offset));
                prop_assert_eq!(&buf[..n], &model[offset..offset + n]);
                // Bytes past the clipped count are untouched.
                prop_assert!(buf[n..].iter().all(|&b| b == 0xA5));
            }
            Op::Flush { offset, len } => {
                let res = dev.flush_range(MmlsRange::new(*offset as u64, *len as u64), &intr);
                if *offset as usize >= size {
                    prop_assert!(res.is_err());
                    continue;
                }
                let flushed = res.unwrap();
                prop_assert_eq!(flushed.size as usize, (*len as usize).min(size - *offset as usize));
            }
            Op::CheckMedium => {
                if let Some(backend) = backend {
                    let mut medium = vec![0u8; size];
                    backend.read_medium(0, &mut medium);
                    prop_assert_eq!(medium.as_slice(), model.as_slice());
                }
            }
        }
    }

    let mut all = vec![0u8; size];
    prop_assert_eq!(dev.read(0, &mut all, &intr).unwrap(), size);
    prop_assert_eq!(all.as_slice(), model.as_slice());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_physical_device_matches_reference((size, ops) in scenario_strategy()) {
        let backend = Arc::new(RamDiskBackend::new(size as u64).unwrap());
        let dev = MmlsDevice::init(0, &CdevConfig::default(), backend.clone(), Arc::new(CpuCache))
            .unwrap();
        run_ops(&dev, Some(&backend), &ops)?;
    }

    #[test]
    fn prop_static_device_matches_reference(ops in static_ops_strategy()) {
        let dev = MmlsDevice::init(
            0,
            &CdevConfig::default(),
            Arc::new(RamDiskBackend::absent()),
            Arc::new(CpuCache),
        )
        .unwrap();
        run_ops(&dev, None, &ops)?;
    }
}
