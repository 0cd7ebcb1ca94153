extern crate clap;
use crossbeam_channel::{bounded, Receiver}; // Ctrl-C notification
use log::{error, info, warn};

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use memcard_protocol::card::{BLOCK_SIZE, PAGE_SIZE, PROGRAMMING_BUFFER_SIZE};
use memcard_protocol::CardSize;
use rexi_core::exi::DeviceKind;
use rexi_core::ExiConfig;
use rexi_storage::FileStoreProvider;

mod host;
use host::{CardDriver, Machine};

/// Configures command-line interface using clap
fn get_cli_config<'a>() -> clap::ArgMatches<'a> {
    let description = "GameCube memory card tool built on an emulated Expansion Interface";
    clap::App::new("Rust EXI Memory Card Tool (REXI)")
        .version("0.1")
        .about(description)
        .arg(
            clap::Arg::with_name("slot")
                .long("slot")
                .takes_value(true)
                .possible_values(&["a", "b"])
                .default_value("a")
                .help("Memory card slot to use"),
        )
        .arg(
            clap::Arg::with_name("card")
                .long("card")
                .takes_value(true)
                .value_name("PATH")
                .conflicts_with("folder")
                .help("Raw card image file"),
        )
        .arg(
            clap::Arg::with_name("folder")
                .long("folder")
                .takes_value(true)
                .value_name("DIR")
                .help("Directory holding one file per card block"),
        )
        .arg(
            clap::Arg::with_name("size")
                .long("size")
                .takes_value(true)
                .value_name("MBITS")
                .possible_values(&["4", "8", "16", "32", "64", "128"])
                .default_value("128")
                .help("Card capacity in megabits"),
        )
        .subcommand(clap::SubCommand::with_name("probe").about("Print card identification and status"))
        .subcommand(
            clap::SubCommand::with_name("dump")
                .about("Copy the whole card into a file")
                .arg(clap::Arg::with_name("OUT").required(true)),
        )
        .subcommand(
            clap::SubCommand::with_name("restore")
                .about("Write a raw image back onto the card")
                .arg(clap::Arg::with_name("IN").required(true)),
        )
        .subcommand(clap::SubCommand::with_name("erase").about("Erase the entire card"))
        .subcommand(
            clap::SubCommand::with_name("savestate")
                .about("Serialise the Expansion Interface state")
                .arg(clap::Arg::with_name("OUT").required(true)),
        )
        .get_matches()
}

fn build_setup(matches: &clap::ArgMatches) -> Result<(ExiConfig, FileStoreProvider, usize)> {
    let card_index = match matches.value_of("slot") {
        Some("b") => 1,
        _ => 0,
    };
    let megabits: u16 = matches
        .value_of("size")
        .unwrap_or("128")
        .parse()
        .context("card size must be a number")?;
    let card_size = match CardSize::from_megabits(megabits) {
        Some(size) => size,
        None => bail!("unsupported card size {} Mbit", megabits),
    };

    let mut provider = FileStoreProvider::new(".");
    let kind = if let Some(dir) = matches.value_of("folder") {
        provider = provider.with_card(card_index, dir);
        DeviceKind::MemoryCardFolder
    } else {
        if let Some(path) = matches.value_of("card") {
            provider = provider.with_card(card_index, path);
        }
        DeviceKind::MemoryCard
    };

    let mut config = ExiConfig {
        card_size,
        slot_a: DeviceKind::None,
        slot_b: DeviceKind::None,
        ..ExiConfig::default()
    };
    match card_index {
        0 => config.slot_a = kind,
        _ => config.slot_b = kind,
    }
    Ok((config, provider, card_index))
}

fn probe(card: &mut CardDriver, size: CardSize) {
    let id = card.nintendo_id();
    println!("Nintendo ID:  {} Mbit", id);
    println!("Card ID:      {:04x}", card.card_id());
    println!("Status:       {:02x}", card.status());
    println!("User blocks:  {}", size.user_blocks());
    if id != size.megabits() as u32 {
        warn!("Card reports {} Mbit, configured for {}", id, size.megabits());
    }
}

fn dump(card: &mut CardDriver, size: CardSize, out: &Path, stop: &Receiver<()>) -> Result<()> {
    let mut image = vec![0u8; size.bytes()];
    for (page, chunk) in image.chunks_mut(PAGE_SIZE).enumerate() {
        if !stop.is_empty() {
            bail!("interrupted after {} pages", page);
        }
        card.read_page((page * PAGE_SIZE) as u32, chunk)?;
    }
    fs::write(out, &image).with_context(|| format!("writing {}", out.display()))?;
    info!("Dumped {} bytes to {}", image.len(), out.display());
    Ok(())
}

fn restore(card: &mut CardDriver, size: CardSize, input: &Path, stop: &Receiver<()>) -> Result<()> {
    let image = fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    if image.len() != size.bytes() {
        bail!(
            "{} is {} bytes, a {} Mbit card holds {}",
            input.display(),
            image.len(),
            size.megabits(),
            size.bytes()
        );
    }

    for (block, data) in image.chunks(BLOCK_SIZE).enumerate() {
        if !stop.is_empty() {
            bail!("interrupted at block {}", block);
        }
        let base = (block * BLOCK_SIZE) as u32;
        card.erase_sector(base)
            .with_context(|| format!("erasing block {}", block))?;
        for (i, chunk) in data.chunks(PROGRAMMING_BUFFER_SIZE).enumerate() {
            // Erased flash already reads back as 0xFF
            if chunk.iter().all(|b| *b == 0xFF) {
                continue;
            }
            let address = base + (i * PROGRAMMING_BUFFER_SIZE) as u32;
            card.program(address, chunk)
                .with_context(|| format!("programming {:x}", address))?;
        }
    }
    info!("Restored {} blocks from {}", image.len() / BLOCK_SIZE, input.display());
    Ok(())
}

fn run(machine: &mut Machine, matches: &clap::ArgMatches, size: CardSize, card_index: usize, stop: &Receiver<()>) -> Result<()> {
    match matches.subcommand() {
        ("probe", _) => {
            let mut card = CardDriver::new(machine, card_index as u32);
            probe(&mut card, size);
            println!(
                "EXI interrupt: {}",
                if machine.irq().is_asserted() { "asserted" } else { "clear" }
            );
        }
        ("dump", Some(sub)) => {
            let out = PathBuf::from(sub.value_of("OUT").unwrap_or_default());
            dump(&mut CardDriver::new(machine, card_index as u32), size, &out, stop)?;
        }
        ("restore", Some(sub)) => {
            let input = PathBuf::from(sub.value_of("IN").unwrap_or_default());
            restore(&mut CardDriver::new(machine, card_index as u32), size, &input, stop)?;
        }
        ("erase", _) => {
            CardDriver::new(machine, card_index as u32).chip_erase()?;
            info!("Card erased");
        }
        ("savestate", Some(sub)) => {
            let out = PathBuf::from(sub.value_of("OUT").unwrap_or_default());
            let state = machine.save_state();
            fs::write(&out, &state).with_context(|| format!("writing {}", out.display()))?;
            info!("Saved {} bytes of state to {}", state.len(), out.display());
        }
        _ => bail!("no command given, see --help"),
    }
    Ok(())
}

/// Main entry point for the memory card tool
fn main() {
    env_logger::init();

    // Set up Ctrl-C handler with channel communication
    let (signal_sender, signal_receiver) = bounded(1);
    let handler_result = ctrlc::set_handler(move || {
        if signal_sender.is_full() {
            std::process::exit(-1); // Second Ctrl-C: give up immediately
        }
        let _send_result = signal_sender.send(());
    });

    if let Err(e) = handler_result {
        error!("Signal handler failed: {:?}", e);
        return;
    }

    let cli_matches = get_cli_config();
    let (config, provider, card_index) = match build_setup(&cli_matches) {
        Ok(setup) => setup,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    };

    let size = config.card_size;
    let mut machine = Machine::new(&config, Rc::new(provider));
    let result = run(&mut machine, &cli_matches, size, card_index, &signal_receiver);

    // Always write the card back, even after an error or Ctrl-C
    machine.shutdown();

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
