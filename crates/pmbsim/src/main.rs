use std::fmt;

use clap::Parser;
use log::LevelFilter;
use pmb::arch::software::EmulatedPmb;
use pmb::{
    BootLayout, HumanSize, NR_PMB_ENTRIES, PhysicalAddress, Pmb, PmbConfig, PmbFlags, SizeClass,
    Slot, VirtualAddress,
};

#[derive(Parser)]
#[command(name = "pmbsim")]
#[command(about = "Replays PMB boot takeover and mapping requests against an emulated PMB")]
struct Args {
    /// Place mappings as 64M tiles at a fixed virtual offset from their physical address
    #[arg(long, value_parser = parse_tile_offset)]
    tiled: Option<usize>,

    /// Physical RAM as <phys>:<size>
    #[arg(long, value_parser = parse_ram, default_value = "0x40000000:512M")]
    ram: Ram,

    /// Slot left valid by the bootloader, as <virt>:<phys>:<size>[:flags] (repeatable)
    #[arg(long, value_parser = parse_boot_slot)]
    bootloader: Vec<BootSlot>,

    /// Log every register access
    #[arg(short, long)]
    verbose: bool,

    /// Operations to replay in order: map:<phys>:<size>[:flags],
    /// fixed:<phys>:<size>:<virt>[:flags], unmap:<virt>, resume
    #[arg(value_parser = parse_op)]
    ops: Vec<Op>,
}

#[derive(Debug, Clone, Copy)]
struct Ram {
    phys: PhysicalAddress,
    size: usize,
}

#[derive(Debug, Clone, Copy)]
struct BootSlot {
    virt: VirtualAddress,
    phys: PhysicalAddress,
    size: SizeClass,
    flags: PmbFlags,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Map {
        phys: PhysicalAddress,
        size: usize,
        flags: PmbFlags,
    },
    Fixed {
        phys: PhysicalAddress,
        size: usize,
        virt: VirtualAddress,
        flags: PmbFlags,
    },
    Unmap {
        virt: VirtualAddress,
    },
    Resume,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Map { phys, size, flags } => write!(f, "map {} {} {}", phys, HumanSize(*size), flags),
            Op::Fixed {
                phys,
                size,
                virt,
                flags,
            } => write!(f, "map {} {} at {} {}", phys, HumanSize(*size), virt, flags),
            Op::Unmap { virt } => write!(f, "unmap {}", virt),
            Op::Resume => f.write_str("resume"),
        }
    }
}

/// Writes log records to stderr.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl StderrLogger {
    fn install(verbose: bool) -> Result<(), log::SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(if verbose {
            LevelFilter::Trace
        } else {
            LevelFilter::Info
        });
        Ok(())
    }
}

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("[{:5} {}] {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

fn parse_number(s: &str) -> Result<usize, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        usize::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|err| format!("invalid number '{}': {}", s, err))
}

/// Parses a size in bytes, with an optional K, M or G suffix.
fn parse_size(s: &str) -> Result<usize, String> {
    let (digits, shift) = match s.as_bytes().last() {
        Some(b'K' | b'k') => (&s[..s.len() - 1], 10),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 20),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    parse_number(digits)?
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

fn parse_flags(s: &str) -> Result<PmbFlags, String> {
    let mut flags = PmbFlags::empty();
    for flag in s.split(',') {
        flags = flags
            | match flag {
                "c" | "cached" => PmbFlags::CACHED,
                "wt" => PmbFlags::CACHED | PmbFlags::WRITE_THROUGH,
                "uc" | "uncached" => PmbFlags::empty(),
                "ub" => PmbFlags::UNBUFFERED,
                _ => return Err(format!("unknown flag '{}'", flag)),
            };
    }
    Ok(flags)
}

fn parse_tile_offset(s: &str) -> Result<usize, String> {
    let offset = parse_number(s)?;
    if offset % SizeClass::Size64M.bytes() != 0 {
        return Err(format!("tile offset {:#x} is not 64M aligned", offset));
    }
    Ok(offset)
}

fn parse_ram(s: &str) -> Result<Ram, String> {
    let (phys, size) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <phys>:<size>, got '{}'", s))?;
    Ok(Ram {
        phys: PhysicalAddress::new(parse_number(phys)?),
        size: parse_size(size)?,
    })
}

fn parse_boot_slot(s: &str) -> Result<BootSlot, String> {
    let fields: Vec<&str> = s.split(':').collect();
    let (virt, phys, size, flags) = match fields[..] {
        [virt, phys, size] => (virt, phys, size, PmbFlags::CACHED),
        [virt, phys, size, flags] => (virt, phys, size, parse_flags(flags)?),
        _ => return Err(format!("expected <virt>:<phys>:<size>[:flags], got '{}'", s)),
    };

    let bytes = parse_size(size)?;
    let size = SizeClass::ALL
        .into_iter()
        .find(|class| class.bytes() == bytes)
        .ok_or_else(|| format!("{} is not a PMB slot size", HumanSize(bytes)))?;

    Ok(BootSlot {
        virt: VirtualAddress::new(parse_number(virt)?),
        phys: PhysicalAddress::new(parse_number(phys)?),
        size,
        flags,
    })
}

fn parse_op(s: &str) -> Result<Op, String> {
    let fields: Vec<&str> = s.split(':').collect();
    let op = match fields[..] {
        ["map", phys, size] => Op::Map {
            phys: PhysicalAddress::new(parse_number(phys)?),
            size: parse_size(size)?,
            flags: PmbFlags::CACHED,
        },
        ["map", phys, size, flags] => Op::Map {
            phys: PhysicalAddress::new(parse_number(phys)?),
            size: parse_size(size)?,
            flags: parse_flags(flags)?,
        },
        ["fixed", phys, size, virt] => Op::Fixed {
            phys: PhysicalAddress::new(parse_number(phys)?),
            size: parse_size(size)?,
            virt: VirtualAddress::new(parse_number(virt)?),
            flags: PmbFlags::CACHED,
        },
        ["fixed", phys, size, virt, flags] => Op::Fixed {
            phys: PhysicalAddress::new(parse_number(phys)?),
            size: parse_size(size)?,
            virt: VirtualAddress::new(parse_number(virt)?),
            flags: parse_flags(flags)?,
        },
        ["unmap", virt] => Op::Unmap {
            virt: VirtualAddress::new(parse_number(virt)?),
        },
        ["resume"] => Op::Resume,
        _ => return Err(format!("unrecognised operation '{}'", s)),
    };
    Ok(op)
}

/// The handoff most bootloaders leave: all of RAM cached and uncached.
fn default_boot_slots(ram: &Ram) -> Vec<BootSlot> {
    [(0x8000_0000, PmbFlags::CACHED), (0xa000_0000, PmbFlags::empty())]
        .into_iter()
        .map(|(virt, flags)| BootSlot {
            virt: VirtualAddress::new(virt),
            phys: ram.phys.align_down(SizeClass::Size512M.bytes()),
            size: SizeClass::Size512M,
            flags,
        })
        .collect()
}

fn run(pmb: &Pmb<EmulatedPmb>, op: &Op) {
    let result = match *op {
        Op::Map { phys, size, flags } => pmb.remap(phys, size, flags).map(Some),
        Op::Fixed {
            phys,
            size,
            virt,
            flags,
        } => pmb.remap_fixed(phys, size, virt, flags).map(Some),
        Op::Unmap { virt } => pmb.unmap(virt).map(|()| None),
        Op::Resume => {
            pmb.resume();
            Ok(None)
        }
    };

    match result {
        Ok(Some(virt)) => log::info!("{} -> {}", op, virt),
        Ok(None) => log::info!("{}", op),
        Err(err) => log::error!("{}: {}", op, err),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    StderrLogger::install(args.verbose).map_err(|err| err.to_string())?;

    let config = match args.tiled {
        Some(offset) => PmbConfig::tiled_64m(offset),
        None => PmbConfig::DEFAULT,
    };

    let boot_slots = if args.bootloader.is_empty() {
        default_boot_slots(&args.ram)
    } else {
        args.bootloader
    };
    if boot_slots.len() > NR_PMB_ENTRIES {
        return Err(format!("at most {} bootloader slots", NR_PMB_ENTRIES).into());
    }

    let hw = EmulatedPmb::new();
    for (slot, boot) in Slot::all().zip(&boot_slots) {
        hw.preload(slot, boot.virt, boot.phys, boot.size, boot.flags);
    }

    let pmb = Pmb::new(hw, config);
    pmb.boot_takeover(&BootLayout::new(args.ram.phys, args.ram.size));

    for op in &args.ops {
        run(&pmb, op);
    }

    print!("{}", pmb.snapshot());
    Ok(())
}
