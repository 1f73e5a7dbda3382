//! Types and functions for the command-line interface
//!
//! No stability guarantees apply

use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::Args;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use miette::{IntoDiagnostic, Result, WrapErr};
use serialport::available_ports;

use self::config::Config;
use crate::{
    connection::Connection,
    error::Error,
    flasher::{
        FlashJob, FlashParams, FlashStub, Flasher, FlasherConfig, MergeDecision, Prompter,
        StubClient,
    },
    fs::merge::merge_filesystems,
    interface::{Interface, Port},
    progress::{FlasherEvent, ProgressCallbacks},
    targets::{Chip, Esp8266},
};

pub mod config;

/// Baud rate the ROM bootloader talks at
const ROM_BAUD: u32 = 115_200;

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "FLASHNCHIPS_PORT")]
    pub port: Option<String>,
    /// Baud rate used once the flasher stub is running
    #[arg(short = 'b', long)]
    pub baud: Option<u32>,
    /// Serial port for the protocol traffic, the control lines stay on
    /// `--port`
    #[arg(long)]
    pub data_port: Option<String>,
    /// Flasher stub descriptor, TOML or JSON
    #[arg(long, env = "FLASHNCHIPS_STUB")]
    pub stub: Option<PathBuf>,
    /// Start with inverted DTR and RTS levels
    #[arg(long)]
    pub inverted: bool,
}

/// Settings of a flashing run
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashConfigArgs {
    /// Write every image in full, even where the device already holds it
    #[arg(long)]
    pub no_minimize_writes: bool,
    /// Replace the device's filesystem instead of merging into it
    #[arg(long)]
    pub no_merge_fs: bool,
    /// Do not generate a device ID
    #[arg(long)]
    pub no_id: bool,
    /// Flash parameters as `mode,size,frequency` or a number
    #[arg(long)]
    pub flash_params: Option<FlashParamsArg>,
    /// Save the filesystem read from the device to this file
    #[arg(long, value_name = "FILE")]
    pub dump_fs: Option<PathBuf>,
}

/// [FlashParams] as a command-line value
#[derive(Debug, Clone, Copy)]
pub struct FlashParamsArg(pub FlashParams);

impl std::str::FromStr for FlashParamsArg {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(FlashParamsArg)
    }
}

impl FlashConfigArgs {
    /// Apply the flags on top of `config`
    pub fn apply(&self, config: &mut FlasherConfig) {
        if self.no_minimize_writes {
            config.minimize_writes = false;
        }
        if self.no_merge_fs {
            config.merge_fs = false;
        }
        if self.no_id {
            config.generate_id = false;
        }
        if let Some(FlashParamsArg(params)) = self.flash_params {
            config.flash_params = Some(params);
        }
        if let Some(path) = &self.dump_fs {
            config.dump_fs = Some(path.clone());
        }
    }
}

/// The flasher configuration for `args`, starting from the file
pub fn flasher_config(args: &ConnectArgs, config: &Config) -> FlasherConfig {
    let mut flasher = config.flasher_config();
    if let Some(baud) = args.baud {
        flasher.flash_baud_rate = baud;
    }
    if let Some(data_port) = &args.data_port {
        flasher.data_port = Some(data_port.clone());
    }
    if args.inverted {
        flasher.invert_signals = true;
    }
    flasher
}

/// The serial port named on the command line or in the configuration, or
/// one picked by the user
pub fn serial_port_name(args: &ConnectArgs, config: &Config) -> Result<String> {
    if let Some(port) = args.port.as_ref().or(config.connection.serial.as_ref()) {
        return Ok(port.clone());
    }

    let ports = available_ports()
        .map_err(Error::from)
        .wrap_err("Failed to list serial ports")?;

    match ports.as_slice() {
        [] => Err(Error::NoPort.into()),
        [port] => Ok(port.port_name.clone()),
        ports => {
            let names: Vec<&str> = ports.iter().map(|p| p.port_name.as_str()).collect();
            let index = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("Detected serial ports")
                .items(&names)
                .default(0)
                .interact_opt()
                .map_err(Error::from)?
                .ok_or(Error::Cancelled)?;

            Ok(ports[index].port_name.clone())
        }
    }
}

pub fn open_port(name: &str) -> Result<Port> {
    let port = Interface::open(name, ROM_BAUD)
        .wrap_err_with(|| format!("Failed to open serial port {name}"))?;
    Ok(Box::new(port))
}

pub fn load_stub(args: &ConnectArgs) -> Result<FlashStub> {
    let path = args
        .stub
        .as_deref()
        .ok_or_else(|| Error::InvalidStub("no stub descriptor given, use --stub".into()))?;

    FlashStub::from_file(path)
        .wrap_err_with(|| format!("Failed to load stub {}", path.display()))
}

/// Open the ports and connect to the ROM bootloader
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Connection> {
    let flasher_config = flasher_config(args, config);
    let name = serial_port_name(args, config)?;

    println!("Serial port: {name}");
    println!("Connecting...\n");

    let mut connection = Connection::new(open_port(&name)?)
        .with_flash_timeout(flasher_config.timeouts.rom_flash());
    if let Some(data_port) = &flasher_config.data_port {
        connection = connection.with_data_port(open_port(data_port)?);
    }
    connection.set_signals_inverted(flasher_config.invert_signals);

    connection.connect()?;
    Ok(connection)
}

/// Connect and start the flasher stub
pub fn connect_stub(args: &ConnectArgs, config: &Config) -> Result<StubClient> {
    let stub = load_stub(args)?;
    let flasher_config = flasher_config(args, config);

    let mut client = StubClient::new(connect(args, config)?, flasher_config.timeouts);
    client.connect(&stub, flasher_config.flash_baud_rate)?;
    Ok(client)
}

pub fn board_info(args: &ConnectArgs, config: &Config) -> Result<()> {
    let mut connection = connect(args, config)?;
    println!("Chip type:         {}", Chip::Esp8266);
    println!("MAC address:       {}", connection.read_mac()?);

    if args.stub.is_none() {
        info!("No stub given, skipping the flash chip");
        return Ok(());
    }

    let stub = load_stub(args)?;
    let flasher_config = flasher_config(args, config);
    let mut client = StubClient::new(connection, flasher_config.timeouts);
    client.connect(&stub, flasher_config.flash_baud_rate)?;

    let id = client.flash_chip_id()?;
    println!("Flash chip ID:     {id:#010x}");
    println!("Flash size:        {}", flash_size_str(Esp8266::flash_size(id)));

    client.disconnect()?;
    Ok(())
}

pub fn read_flash(
    args: &ConnectArgs,
    config: &Config,
    addr: u32,
    size: usize,
    file: &Path,
) -> Result<()> {
    let mut client = connect_stub(args, config)?;

    let mut progress = CliProgress::default();
    progress.init(addr, size);
    let data = client.read(addr, size, |n| progress.update(n))?;
    progress.finish();

    client.disconnect()?;

    fs::write(file, data)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", file.display()))?;
    println!("Read {size} bytes at {addr:#x} into {}", file.display());
    Ok(())
}

/// Write a binary file to flash through the ROM bootloader, without the stub
pub fn write_bin(args: &ConnectArgs, config: &Config, addr: u32, file: &Path) -> Result<()> {
    let data = fs::read(file)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
    let erase_workaround = config.flasher.erase_bug_workaround;

    let mut connection = connect(args, config)?;
    connection.flash_write(addr, &data, erase_workaround)?;
    connection.reboot_into_firmware()?;

    println!("Wrote {} bytes at {addr:#x}", data.len());
    Ok(())
}

pub fn reboot(args: &ConnectArgs, config: &Config) -> Result<()> {
    let name = serial_port_name(args, config)?;
    let mut connection = Connection::new(open_port(&name)?);
    connection.set_signals_inverted(args.inverted || config.flasher.invert_signals);

    connection.reboot_into_firmware()?;
    println!("Rebooted into firmware");
    Ok(())
}

/// Flash the firmware directory at `dir`, rendering the run's events
pub fn flash(
    args: &ConnectArgs,
    config: &Config,
    flash_args: &FlashConfigArgs,
    dir: &Path,
) -> Result<()> {
    let mut flasher_config = flasher_config(args, config);
    flash_args.apply(&mut flasher_config);
    debug!("Flasher config: {flasher_config:#?}");

    let stub = load_stub(args)?;
    let port = open_port(&serial_port_name(args, config)?)?;
    let data_port = flasher_config
        .data_port
        .as_deref()
        .map(open_port)
        .transpose()?;

    let mut flasher = Flasher::new(Chip::Esp8266, flasher_config, stub);
    flasher
        .load(dir)
        .wrap_err_with(|| format!("Failed to load firmware from {}", dir.display()))?;
    flasher.set_port(port);
    if let Some(data_port) = data_port {
        flasher.set_data_port(data_port);
    }

    let job = flasher.spawn(Box::new(DialoguerPrompter));
    render_events(&job);
    job.join()?;

    println!("\nFlashing has completed!");
    Ok(())
}

/// Merge two filesystem images into a third, keeping the capacity of `old`
pub fn merge_fs(old: &Path, new: &Path, out: &Path) -> Result<()> {
    let read = |path: &Path| {
        fs::read(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read {}", path.display()))
    };

    let merged = merge_filesystems(&read(old)?, &read(new)?)?;
    fs::write(out, merged)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", out.display()))
}

/// Show the events of `job` until it ends
pub fn render_events(job: &FlashJob) {
    let mut progress = CliProgress::default();
    progress.init(0, job.total_bytes());

    for event in job.events() {
        match event {
            FlasherEvent::Progress(done) => progress.update(done as usize),
            FlasherEvent::Status(message) => progress.set_message(message),
            FlasherEvent::Done { success, message } => {
                progress.finish();
                debug!("Run finished (success: {success}): {message}");
            }
        }
    }
}

fn flash_size_str(size: usize) -> String {
    if size >= 1 << 20 {
        format!("{}MB", size >> 20)
    } else {
        format!("{}KB", size >> 10)
    }
}

/// Progress bar on the terminal
#[derive(Default)]
pub struct CliProgress {
    pb: Option<ProgressBar>,
}

impl CliProgress {
    pub fn set_message(&self, message: String) {
        if let Some(pb) = &self.pb {
            pb.set_message(message);
        }
    }
}

impl ProgressCallbacks for CliProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>9}/{total_bytes:9} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        let pb = ProgressBar::new(total as u64)
            .with_style(style)
            .with_message(format!("{addr:#x}"));

        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(pb) = &self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish();
        }
    }
}

/// Asks the user on the terminal
pub struct DialoguerPrompter;

impl Prompter for DialoguerPrompter {
    fn retry_connect(&mut self, error: &Error) -> bool {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "{error}. Put the device into flashing mode manually and retry?"
            ))
            .default(true)
            .interact_opt()
            .ok()
            .flatten()
            .unwrap_or(false)
    }

    fn merge_failed(&mut self, error: &Error) -> MergeDecision {
        const CHOICES: [(&str, MergeDecision); 3] = [
            ("Cancel", MergeDecision::Abort),
            ("Write the new filesystem", MergeDecision::WriteNew),
            ("Keep the old filesystem", MergeDecision::KeepOld),
        ];

        let items: Vec<&str> = CHOICES.iter().map(|(label, _)| *label).collect();
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Failed to merge the device's filesystem: {error}. What now?"
            ))
            .items(&items)
            .default(0)
            .interact_opt()
            .ok()
            .flatten()
            .map_or(MergeDecision::Abort, |index| CHOICES[index].1)
    }
}
