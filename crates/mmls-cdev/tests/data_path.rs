use mmls_cdev::{
    BackingMode, CdevConfig, CdevError, CpuCache, Interrupt, MmlsDevice, OverrunPolicy,
    RamDiskBackend, SectorRequest, UserBuffer, UserBufferMut, UserFault, STATIC_BUFFER_SIZE,
};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

fn ram_device(size: u64) -> (Arc<RamDiskBackend>, MmlsDevice) {
    let backend = Arc::new(RamDiskBackend::new(size).unwrap());
    let dev = MmlsDevice::init(
        0,
        &CdevConfig::default(),
        backend.clone(),
        Arc::new(CpuCache),
    )
    .unwrap();
    (backend, dev)
}

fn static_device() -> MmlsDevice {
    MmlsDevice::init(
        0,
        &CdevConfig::default(),
        Arc::new(RamDiskBackend::absent()),
        Arc::new(CpuCache),
    )
    .unwrap()
}

#[test]
fn overlong_write_is_clipped_to_device_size() {
    let (_, dev) = ram_device(8192);
    let intr = Interrupt::new();

    let n = dev.write(0, &vec![0xABu8; 8200], &intr).unwrap();
    assert_eq!(n, 8192);

    let mut buf = vec![0u8; 100];
    let n = dev.read(8190, &mut buf, &intr).unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf[..2], &[0xAB, 0xAB]);
    assert!(buf[2..].iter().all(|b| *b == 0));

    assert_eq!(dev.stats().clipped, 2);
}

#[test]
fn offset_at_end_is_out_of_range() {
    let (_, dev) = ram_device(8192);
    let intr = Interrupt::new();

    let err = dev.write(8192, &vec![1u8; 10], &intr).unwrap_err();
    assert!(matches!(
        err,
        CdevError::OutOfRange {
            offset: 8192,
            len: 10,
            size: 8192
        }
    ));
    assert_eq!(err.errno(), mmls_cdev::error::ERANGE);

    let mut buf = [0u8; 1];
    assert!(matches!(
        dev.read(u64::MAX, &mut buf[..], &intr),
        Err(CdevError::OutOfRange { .. })
    ));
    assert_eq!(dev.stats().writes, 0);
}

#[test]
fn reject_policy_fails_overlong_requests() {
    let backend = Arc::new(RamDiskBackend::new(8192).unwrap());
    let config = CdevConfig {
        overrun: OverrunPolicy::Reject,
        ..CdevConfig::default()
    };
    let dev = MmlsDevice::init(0, &config, backend, Arc::new(CpuCache)).unwrap();

    let err = dev
        .write(8000, &vec![0u8; 400], &Interrupt::new())
        .unwrap_err();
    assert!(matches!(err, CdevError::OutOfRange { offset: 8000, .. }));
    assert_eq!(
        dev.write(8000, &vec![0u8; 192], &Interrupt::new()).unwrap(),
        192
    );
}

#[test]
fn writes_commit_every_touched_sector() {
    let (backend, dev) = ram_device(8192);
    let intr = Interrupt::new();

    dev.write(8190, b"zz".as_slice(), &intr).unwrap();
    let req = backend.last_request().unwrap();
    assert_eq!((req.start, req.count), (15, 1));
    assert_eq!(req.target, dev.virt_base());

    dev.write(511, b"ab".as_slice(), &intr).unwrap();
    assert_eq!(
        backend.last_request().unwrap(),
        SectorRequest::covering(511, 2, dev.virt_base())
    );
    assert_eq!(backend.write_commands(), 2);

    let mut medium = [0u8; 2];
    backend.read_medium(511, &mut medium);
    assert_eq!(&medium, b"ab");
}

#[test]
fn command_failure_surfaces_from_read() {
    let (backend, dev) = ram_device(4096);
    backend.set_fail_commands(true);

    let mut buf = [0u8; 16];
    let err = dev.read(0, &mut buf[..], &Interrupt::new()).unwrap_err();
    assert!(matches!(err, CdevError::Command { op: "read", .. }));

    backend.set_fail_commands(false);
    assert_eq!(dev.read(0, &mut buf[..], &Interrupt::new()).unwrap(), 16);
}

#[test]
fn static_buffer_serves_without_commands() {
    let dev = static_device();
    assert_eq!(dev.mode(), BackingMode::StaticBuffer);
    assert_eq!(dev.query_size(), STATIC_BUFFER_SIZE as u64);

    let intr = Interrupt::new();
    dev.write(100, b"hello".as_slice(), &intr).unwrap();
    let mut buf = [0u8; 5];
    dev.read(100, &mut buf[..], &intr).unwrap();
    assert_eq!(&buf, b"hello");
}

/// A caller buffer whose memory stops being accessible at `valid` bytes.
struct FaultingBuffer {
    data: Vec<u8>,
    valid: usize,
}

impl UserBuffer for FaultingBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn copy_from_user(&self, at: usize, dst: &mut [u8]) -> Result<(), UserFault> {
        if at + dst.len() > self.valid {
            return Err(UserFault { at: at.max(self.valid) });
        }
        dst.copy_from_slice(&self.data[at..at + dst.len()]);
        Ok(())
    }
}

impl UserBufferMut for FaultingBuffer {
    fn copy_to_user(&mut self, at: usize, src: &[u8]) -> Result<(), UserFault> {
        if at + src.len() > self.valid {
            return Err(UserFault { at: at.max(self.valid) });
        }
        self.data[at..at + src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[test]
fn write_fault_keeps_earlier_chunks_and_skips_commit() {
    let (backend, dev) = ram_device(16384);
    let buf = FaultingBuffer {
        data: vec![0x5A; 12288],
        valid: 4096,
    };

    let err = dev.write(0, &buf, &Interrupt::new()).unwrap_err();
    assert!(matches!(err, CdevError::Fault { at: 4096 }));
    assert_eq!(err.errno(), mmls_cdev::error::EFAULT);
    assert_eq!(backend.write_commands(), 0);

    // The first chunk landed in the window; nothing reached the medium.
    let mut medium = [0xFFu8; 1];
    backend.read_medium(0, &mut medium);
    assert_eq!(medium, [0]);
    assert!(!dev.is_torn_down());
}

#[test]
fn read_fault_reports_first_inaccessible_index() {
    let dev = static_device();
    dev.write(0, &vec![7u8; 8192], &Interrupt::new()).unwrap();

    let mut buf = FaultingBuffer {
        data: vec![0; 8192],
        valid: 4096,
    };
    let err = dev.read(0, &mut buf, &Interrupt::new()).unwrap_err();
    assert!(matches!(err, CdevError::Fault { at: 4096 }));
    assert!(buf.data[..4096].iter().all(|b| *b == 7));
    assert!(buf.data[4096..].iter().all(|b| *b == 0));
}

#[test]
fn handle_implements_std_io() {
    let cdev = mmls_cdev::MmlsCdev::init(
        CdevConfig::default(),
        Arc::new(RamDiskBackend::new(4096).unwrap()),
    )
    .unwrap();
    let mut file = cdev.open(0).unwrap();

    file.write_all(b"mmls").unwrap();
    assert_eq!(file.stream_position().unwrap(), 4);

    file.seek(SeekFrom::End(-4)).unwrap();
    file.write_all(b"tail").unwrap();
    // At the end: reads report EOF and writes accept nothing.
    let mut rest = Vec::new();
    assert_eq!(file.read_to_end(&mut rest).unwrap(), 0);
    assert_eq!(
        file.write_all(b"x").unwrap_err().kind(),
        std::io::ErrorKind::WriteZero
    );

    file.rewind().unwrap();
    let mut all = Vec::new();
    file.read_to_end(&mut all).unwrap();
    assert_eq!(all.len(), 4096);
    assert_eq!(&all[..4], b"mmls");
    assert_eq!(&all[4092..], b"tail");
}
