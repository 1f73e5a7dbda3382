use std::{fs, num::ParseIntError, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use flashnchips::{
    cli::{
        board_info, config::Config, flash, merge_fs, read_flash, reboot, write_bin, ConnectArgs,
        FlashConfigArgs,
    },
    flasher::id::make_id_block,
    logging::{initialize_logger, level_for},
};
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};

#[derive(Debug, Parser)]
#[command(about, propagate_version = true, version)]
struct Cli {
    /// More output, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Flash a firmware directory to a target device
    Flash(FlashArgs),
    /// Display information about the connected board and exit without flashing
    BoardInfo(ConnectArgs),
    /// Read a region of flash into a file
    ReadFlash(ReadFlashArgs),
    /// Reset the target device into its firmware
    Reboot(ConnectArgs),
    /// Write a binary file to flash through the ROM bootloader, without a stub
    WriteBin(WriteBinArgs),
    /// Merge the files of one filesystem image into another
    MergeFs(MergeFsArgs),
    /// Write a freshly generated device ID block to a file
    GenId(GenIdArgs),
}

#[derive(Debug, Args)]
struct FlashArgs {
    /// Firmware directory holding `0x<offset>.bin` files and an optional
    /// `fs` directory
    dir: PathBuf,

    #[command(flatten)]
    connect_args: ConnectArgs,
    #[command(flatten)]
    flash_config_args: FlashConfigArgs,
}

#[derive(Debug, Args)]
struct ReadFlashArgs {
    /// Offset to start reading from
    #[arg(value_parser = parse_uint32)]
    addr: u32,
    /// Number of bytes to read
    #[arg(value_parser = parse_uint32)]
    size: u32,
    /// File to write the data to
    file: PathBuf,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct WriteBinArgs {
    /// Address at which to write the binary file
    #[arg(value_parser = parse_uint32)]
    addr: u32,
    /// File containing the binary data to write
    file: PathBuf,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct MergeFsArgs {
    /// Filesystem image whose files are kept
    old: PathBuf,
    /// Filesystem image whose files win
    new: PathBuf,
    /// File to write the merged image to, with the capacity of `old`
    out: PathBuf,
}

#[derive(Debug, Args)]
struct GenIdArgs {
    /// File to write the block to
    file: PathBuf,
    /// Domain the ID belongs to, defaults to the configured one
    #[arg(long)]
    domain: Option<String>,
}

fn parse_uint32(input: &str) -> Result<u32, ParseIntError> {
    parse_int::parse(input)
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let cli = Cli::parse();
    initialize_logger(level_for(cli.verbose));
    debug!("{:#?}", cli.subcommand);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match cli.subcommand {
        Commands::Flash(args) => flash(
            &args.connect_args,
            &config,
            &args.flash_config_args,
            &args.dir,
        ),
        Commands::BoardInfo(args) => board_info(&args, &config),
        Commands::ReadFlash(args) => read_flash(
            &args.connect_args,
            &config,
            args.addr,
            args.size as usize,
            &args.file,
        ),
        Commands::Reboot(args) => reboot(&args, &config),
        Commands::WriteBin(args) => write_bin(&args.connect_args, &config, args.addr, &args.file),
        Commands::MergeFs(args) => merge_fs(&args.old, &args.new, &args.out),
        Commands::GenId(args) => gen_id(args, &config),
    }
}

fn gen_id(args: GenIdArgs, config: &Config) -> Result<()> {
    let domain = args.domain.as_deref().unwrap_or(&config.flasher.id_domain);

    fs::write(&args.file, make_id_block(domain))
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", args.file.display()))?;

    println!("Wrote a new ID block to {}", args.file.display());
    Ok(())
}
