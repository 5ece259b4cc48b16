use std::sync::Arc;

use anyhow::{bail, ensure, Context};
use clap::{Parser, Subcommand};
use mmls_cdev::control::{MMLS_IOC_DUMP_MEM, MMLS_IOC_FLUSH_RANGE, MMLS_IOC_SIZE};
use mmls_cdev::{
    CachePolicy, CdevConfig, DeviceHandle, MmlsBackend, MmlsCdev, MmlsRange, RamDiskBackend,
    SoftAddressSpace, PAGE_SIZE,
};
use tracing_subscriber::EnvFilter;

/// Simulated region size when `--size` is not given.
const DEFAULT_DEVICE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "mmls-ctl",
    about = "Exercise an MMLS character device over an in-memory region."
)]
struct Args {
    /// Size of the simulated MMLS region in bytes (0: no region, use the static buffer)
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_DEVICE_SIZE, value_parser = parse_u64, global = true)]
    size: u64,

    /// Physical base address reported for the region (page aligned)
    #[arg(long, value_name = "ADDR", default_value_t = RamDiskBackend::DEFAULT_PHYS_START, value_parser = parse_u64, global = true)]
    phys_base: u64,

    /// Cache policy for mappings: wb, wc, uc or 0/1/2 (overrides MMLS_MMAP_TYPE)
    #[arg(long, value_name = "POLICY", global = true)]
    mmap_type: Option<CachePolicy>,

    /// Pretend discovery found nothing, forcing the static buffer
    #[arg(long = "static", action = clap::ArgAction::SetTrue, global = true)]
    force_static: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print what the device looks like after initialization
    Info,

    /// Write a pattern through the data path, read it back, and verify it
    RwTest {
        #[arg(long, default_value_t = 0, value_parser = parse_u64)]
        offset: u64,
        #[arg(long, default_value_t = 4096, value_parser = parse_u64)]
        len: u64,
        #[arg(long, default_value_t = 0xA5, value_parser = parse_u8)]
        pattern: u8,
    },

    /// Map the whole device, fill it, flush it, and verify through the mapping
    MmapTest {
        #[arg(long, default_value_t = 0x1F, value_parser = parse_u8)]
        pattern: u8,
    },

    /// Print the bytes of a range as seen by the device
    Dump {
        #[arg(long, default_value_t = 0, value_parser = parse_u64)]
        offset: u64,
        #[arg(long, default_value_t = 16, value_parser = parse_u64)]
        len: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = CdevConfig::from_env().context("read MMLS_* environment")?;
    if let Some(policy) = args.mmap_type {
        config.mmap_policy = policy;
    }

    let backend: Arc<dyn MmlsBackend> = if args.force_static || args.size == 0 {
        Arc::new(RamDiskBackend::absent())
    } else {
        ensure!(
            args.phys_base % PAGE_SIZE == 0,
            "--phys-base 0x{:x} is not page aligned",
            args.phys_base
        );
        Arc::new(
            RamDiskBackend::with_phys_start(args.size, args.phys_base)
                .context("allocate simulated region")?,
        )
    };

    let cdev = MmlsCdev::init(config, backend).context("initialize mmls devices")?;
    let mut file = cdev.open(0).context("open mmls0")?;

    match args.command {
        Command::Info => info(&cdev),
        Command::RwTest {
            offset,
            len,
            pattern,
        } => rw_test(&mut file, offset, len, pattern),
        Command::MmapTest { pattern } => mmap_test(&file, pattern),
        Command::Dump { offset, len } => dump(&file, offset, len),
    }
}

fn info(cdev: &MmlsCdev) -> anyhow::Result<()> {
    for device in cdev.devices() {
        println!("{}:", MmlsCdev::device_name(device.index()));
        println!("  mode:         {:?}", device.mode());
        println!("  size:         {}", device.query_size());
        match device.phys_start() {
            Some(phys) => println!("  phys_start:   0x{phys:x}"),
            None => println!("  phys_start:   -"),
        }
        println!("  sectors:      {}", device.sector_count());
        println!("  mmap policy:  {}", device.mmap_policy());
    }
    Ok(())
}

fn rw_test(file: &mut DeviceHandle, offset: u64, len: u64, pattern: u8) -> anyhow::Result<()> {
    let len = usize::try_from(len).context("--len does not fit in memory")?;
    let data = vec![pattern; len];

    file.seek(std::io::SeekFrom::Start(offset))?;
    let written = file.write(&data).context("write")?;

    file.seek(std::io::SeekFrom::Start(offset))?;
    let mut back = vec![0u8; written];
    let read = file.read(&mut back).context("read back")?;

    ensure!(read == written, "read {read} bytes back, wrote {written}");
    if let Some(bad) = back.iter().position(|b| *b != pattern) {
        bail!(
            "mismatch at offset {}: expected 0x{pattern:02X}, got 0x{:02X}",
            offset + bad as u64,
            back[bad]
        );
    }
    println!("wrote and verified {written} of {len} bytes at offset {offset}");
    Ok(())
}

fn mmap_test(file: &DeviceHandle, pattern: u8) -> anyhow::Result<()> {
    let mut size = [0u8; 8];
    file.ioctl(MMLS_IOC_SIZE, &mut size).context("size query")?;
    let size = u64::from_le_bytes(size);

    let space = Arc::new(SoftAddressSpace::new());
    let mapping = file.mmap(space, 0, size).context("mmap")?;
    println!(
        "mapped {} bytes at 0x{:x} (phys 0x{:x}, {})",
        mapping.len(),
        mapping.vaddr(),
        mapping.phys_addr(),
        mapping.policy()
    );

    mapping.fill(pattern)?;

    let mut head: Vec<(u64, u8)> = Vec::new();
    let mut range = MmlsRange::new(0, 16).to_bytes();
    file.ioctl_with_sink(MMLS_IOC_DUMP_MEM, &mut range, &mut head)
        .context("dump")?;
    for (offset, value) in &head {
        println!("mmls_iomem[{offset}]=0x{value:02X}");
    }

    let mut range = MmlsRange::new(0, size).to_bytes();
    file.ioctl(MMLS_IOC_FLUSH_RANGE, &mut range)
        .context("flush range")?;

    let mut page = vec![0u8; PAGE_SIZE as usize];
    for index in 0..mapping.pages() {
        mapping.read(index * PAGE_SIZE, &mut page)?;
        if let Some(bad) = page.iter().position(|b| *b != pattern) {
            bail!(
                "mismatch at offset {}: expected 0x{pattern:02X}, got 0x{:02X}",
                index * PAGE_SIZE + bad as u64,
                page[bad]
            );
        }
    }
    println!("verified {} pages", mapping.pages());
    Ok(())
}

fn dump(file: &DeviceHandle, offset: u64, len: u64) -> anyhow::Result<()> {
    let mut bytes: Vec<(u64, u8)> = Vec::new();
    let mut range = MmlsRange::new(offset, len).to_bytes();
    file.ioctl_with_sink(MMLS_IOC_DUMP_MEM, &mut range, &mut bytes)
        .context("dump")?;
    for (offset, value) in bytes {
        println!("mmls_iomem[{offset}]=0x{value:02X}");
    }
    Ok(())
}

fn parse_u64(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("{raw:?}: {err}"))
}

fn parse_u8(raw: &str) -> Result<u8, String> {
    let value = parse_u64(raw)?;
    u8::try_from(value).map_err(|_| format!("{raw:?} does not fit in a byte"))
}
