use std::{error::Error, process::ExitCode, sync::Arc};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use rand::Rng;

use device::{SimHost, DEFAULT_SEGMENT_SIZE};
use pmd::{Device, PmdConfig, Status, SECTOR_SIZE};

mod device;
mod logging;
mod pmd;


/// 自检时每个请求的大小
const REQUEST_BYTES: usize = 64 * 1024;

/// 接受十进制或 0x 开头的十六进制
fn parse_u64(arg: &str) -> Result<u64, String> {
    let parsed = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    parsed.map_err(|err| format!("invalid number {:?}: {}", arg, err))
}

fn cli() -> Command {
    Command::new("PMD")
        .about("Exposes a physical memory window as a block device and exercises it")
        .arg(
            Arg::new("sectors")
                .short('n')
                .long("sectors")
                .value_parser(parse_u64)
                .help("Capacity in 512-byte sectors"),
        )
        .arg(
            Arg::new("base")
                .short('b')
                .long("base")
                .value_parser(parse_u64)
                .help("Physical base address of the backing region"),
        )
        .arg(
            Arg::new("fallback-offset")
                .long("fallback-offset")
                .value_parser(parse_u64)
                .help("Offset added to the base when the primary mapping fails"),
        )
        .arg(
            Arg::new("major")
                .short('m')
                .long("major")
                .value_parser(value_parser!(u32))
                .help("Major number to register"),
        )
        .arg(
            Arg::new("segment")
                .short('s')
                .long("segment")
                .value_parser(value_parser!(usize))
                .help("Segment size the host splits requests into (default 4096)"),
        )
        .arg(
            Arg::new("refuse-primary")
                .long("refuse-primary")
                .action(ArgAction::SetTrue)
                .help("Make the primary mapping fail to exercise the fallback address"),
        )
        .arg(
            Arg::new("pattern")
                .short('p')
                .long("pattern")
                .value_parser(parse_u64)
                .help("Byte written across the device (random data when omitted)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count),
        )
}

/// --segment 未给出时使用 host 的默认 segment 大小
fn segment_size(matches: &ArgMatches) -> usize {
    matches
        .get_one::<usize>("segment")
        .copied()
        .unwrap_or(DEFAULT_SEGMENT_SIZE)
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    logging::init(logging::level_from_verbosity(matches.get_count("verbose")));

    let defaults = PmdConfig::default();
    let config = PmdConfig {
        base_address: matches
            .get_one::<u64>("base")
            .copied()
            .unwrap_or(defaults.base_address),
        fallback_offset: matches
            .get_one::<u64>("fallback-offset")
            .copied()
            .unwrap_or(defaults.fallback_offset),
        sector_count: matches
            .get_one::<u64>("sectors")
            .copied()
            .unwrap_or(defaults.sector_count),
        major: matches
            .get_one::<u32>("major")
            .copied()
            .unwrap_or(defaults.major),
    };
    let segment = segment_size(&matches);
    let pattern = match matches
        .get_one::<u64>("pattern")
        .map(|byte| u8::try_from(*byte))
        .transpose()
    {
        Ok(pattern) => pattern,
        Err(_) => {
            eprintln!("pmd: pattern must fit in a single byte");
            return ExitCode::FAILURE;
        }
    };

    match pmd_selftest(
        config,
        segment,
        matches.get_flag("refuse-primary"),
        pattern,
    ) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pmd: {}", err);
            ExitCode::FAILURE
        }
    }
}

/// 在模拟 host 上拉起设备, 整盘写入再读回校验, 探测一次越界访问, 最后拆除
fn pmd_selftest(
    config: PmdConfig,
    segment: usize,
    refuse_primary: bool,
    pattern: Option<u8>,
) -> Result<(), Box<dyn Error>> {
    if segment == 0 || segment % SECTOR_SIZE != 0 {
        return Err(format!("segment size must be a multiple of {}", SECTOR_SIZE).into());
    }
    let host = Arc::new(SimHost::with_segment_size(segment));
    if refuse_primary {
        host.refuse_mapping(config.base_address);
    }

    let device = Device::init(Arc::clone(&host), config)?;
    println!(
        "pmd: {} sectors ({} bytes) mapped at {:#x}",
        device.capacity(),
        device.size_bytes(),
        device.mapped_at()
    );
    device.open();

    // 整盘内容
    let image: Vec<u8> = match pattern {
        Some(byte) => vec![byte; device.size_bytes()],
        None => {
            let mut image = vec![0u8; device.size_bytes()];
            rand::thread_rng().fill(&mut image[..]);
            image
        }
    };

    let sectors_per_request = (REQUEST_BYTES / SECTOR_SIZE) as u64;
    device.with_queue(|queue| {
        for (i, chunk) in image.chunks(REQUEST_BYTES).enumerate() {
            queue.submit_write(i as u64 * sectors_per_request, chunk.to_vec());
        }
    });
    let written = device.run_queue();
    info!("pmd: write pass {:?}", written);
    let writes = device
        .with_queue(|queue| queue.take_finished())
        .unwrap_or_default();
    if writes.iter().any(|request| request.status != Status::Ok) {
        return Err("in-range write was rejected".into());
    }

    device.with_queue(|queue| {
        for (i, chunk) in image.chunks(REQUEST_BYTES).enumerate() {
            queue.submit_read(i as u64 * sectors_per_request, chunk.len());
        }
        // 越过末尾一个扇区
        queue.submit_read(device.capacity(), SECTOR_SIZE);
    });
    let read = device.run_queue();
    info!("pmd: read pass {:?}", read);

    let finished = device
        .with_queue(|queue| queue.take_finished())
        .unwrap_or_default();
    let (probe, reads) = match finished.split_last() {
        Some((probe, reads)) => (probe, reads),
        None => return Err("host queue lost the read requests".into()),
    };
    let readback: Vec<u8> = reads
        .iter()
        .filter(|request| request.status == Status::Ok)
        .flat_map(|request| request.buffer.iter().copied())
        .collect();

    device.release();
    device.teardown();

    if readback != image {
        return Err("read back data does not match what was written".into());
    }
    if probe.status != Status::IoError {
        return Err("out-of-range read was not rejected".into());
    }
    println!(
        "pmd: verified {} segments written, {} read, {} rejected",
        written.completed, read.completed, read.failed
    );
    Ok(())
}

#[test]
fn segment_defaults_to_host_page() {
    let matches = cli().try_get_matches_from(["pmd"]).unwrap();
    assert_eq!(segment_size(&matches), DEFAULT_SEGMENT_SIZE);

    let matches = cli()
        .try_get_matches_from(["pmd", "--segment", "1024", "-n", "0x10"])
        .unwrap();
    assert_eq!(segment_size(&matches), 1024);
    assert_eq!(matches.get_one::<u64>("sectors"), Some(&16));
}
