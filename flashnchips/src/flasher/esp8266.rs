//! Flashing of ESP8266 devices
//!
//! A run connects to the ROM bootloader, starts the flasher stub and then:
//!
//! 1. detects the flash size and checks the firmware against it
//! 2. patches the flash parameters into the boot image header
//! 3. adds a device ID block unless the device already has one
//! 4. merges the device's filesystem with the new one
//! 5. drops the sectors which already hold the right content
//! 6. erases and writes what is left, resuming after link failures
//! 7. verifies every image and reboots into the new firmware

use std::{fs, path::Path};

use log::{debug, error, info, warn};
use md5::{Digest, Md5};

use crate::{
    connection::Connection,
    error::Error,
    flasher::{
        client::StubClient,
        dedup::dedup_images,
        id::{find_id, make_id_block, ID_BLOCK_OFFSET, ID_BLOCK_SIZE},
        stubs::FlashStub,
        FlashParams,
        FlasherConfig,
        MergeDecision,
        Prompter,
    },
    fs::merge::{build_image, merge_image},
    image::FirmwareImage,
    interface::Port,
    progress::EventSink,
    targets::{
        esp8266::{DEFAULT_FLASH_SIZE, FLASH_SECTOR_SIZE},
        Esp8266,
    },
};

/// Attempts at writing an image without making progress
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Flashes firmware images onto an ESP8266
pub struct Esp8266Flasher {
    config: FlasherConfig,
    stub: FlashStub,
    firmware: Option<FirmwareImage>,
    port: Option<Port>,
    data_port: Option<Port>,
}

impl Esp8266Flasher {
    pub fn new(config: FlasherConfig, stub: FlashStub) -> Self {
        Esp8266Flasher {
            config,
            stub,
            firmware: None,
            port: None,
            data_port: None,
        }
    }

    pub fn config(&self) -> &FlasherConfig {
        &self.config
    }

    pub fn load(&mut self, path: &Path) -> Result<(), Error> {
        self.set_firmware(FirmwareImage::load_dir(path)?);
        Ok(())
    }

    pub fn set_firmware(&mut self, firmware: FirmwareImage) {
        self.firmware = Some(firmware);
    }

    pub fn set_port(&mut self, port: Port) {
        self.port = Some(port);
    }

    pub fn set_data_port(&mut self, port: Port) {
        self.data_port = Some(port);
    }

    fn merges_fs(&self, firmware: &FirmwareImage) -> bool {
        self.config.merge_fs
            && (firmware.contains(self.config.spiffs_offset) || !firmware.files().is_empty())
    }

    pub fn total_bytes(&self) -> usize {
        let Some(firmware) = &self.firmware else {
            return 0;
        };

        // The filesystem is read before it is written
        let fs_read = if self.merges_fs(firmware) {
            self.config.spiffs_size
        } else {
            0
        };

        firmware.len() + fs_read
    }

    /// Flash the loaded firmware
    ///
    /// The ports are kept for the next run, whatever the outcome.
    pub fn run(&mut self, prompter: &mut dyn Prompter, events: &EventSink) -> Result<(), Error> {
        let result = self.run_inner(prompter, events);

        match &result {
            Ok(()) => events.done(true, "All done!"),
            Err(e) => {
                error!("Flashing failed: {e}");
                events.done(false, e.to_string());
            }
        }

        result
    }

    fn run_inner(&mut self, prompter: &mut dyn Prompter, events: &EventSink) -> Result<(), Error> {
        let firmware = self.firmware.clone().ok_or(Error::NoFirmware)?;
        let port = self.port.take().ok_or(Error::NoPort)?;

        let mut connection =
            Connection::new(port).with_flash_timeout(self.config.timeouts.rom_flash());
        if let Some(data_port) = self.data_port.take() {
            connection = connection.with_data_port(data_port);
        }
        connection.set_signals_inverted(self.config.invert_signals);

        let mut client = StubClient::new(connection, self.config.timeouts);
        let result = Run {
            config: &self.config,
            stub: &self.stub,
            events,
            done: 0,
            id_generated: false,
        }
        .execute(&mut client, prompter, firmware);

        let (port, data_port) = client.into_connection().into_ports();
        self.port = Some(port);
        self.data_port = data_port;

        result
    }
}

/// State of a single flashing run
struct Run<'a> {
    config: &'a FlasherConfig,
    stub: &'a FlashStub,
    events: &'a EventSink,
    /// Bytes processed so far
    done: usize,
    id_generated: bool,
}

impl Run<'_> {
    fn execute(
        mut self,
        client: &mut StubClient,
        prompter: &mut dyn Prompter,
        mut firmware: FirmwareImage,
    ) -> Result<(), Error> {
        self.events.set_progress(0);

        self.events.status("Connecting to ROM...");
        while let Err(e) = client.connection().connect() {
            error!("Failed to talk to the bootloader: {e}");
            if !prompter.retry_connect(&e) {
                return Err(Error::Unreachable);
            }
        }

        match client.connection().read_mac() {
            Ok(mac) => info!("MAC address: {mac}"),
            Err(e) => warn!("Failed to read the MAC address: {e}"),
        }

        self.events.status("Running flasher...");
        client.connect(self.stub, self.config.flash_baud_rate)?;

        let flash_size = match client.flash_chip_id() {
            Ok(id) => Esp8266::flash_size(id),
            Err(e) => {
                error!("Failed to get flash chip ID: {e}");
                DEFAULT_FLASH_SIZE
            }
        };
        info!("Flash size: {flash_size}");

        firmware.sanity_check(flash_size)?;

        self.patch_flash_params(&mut firmware, flash_size);

        if self.config.generate_id && !firmware.contains(ID_BLOCK_OFFSET) {
            self.ensure_id(client, &mut firmware)?;
        }

        if self.config.merge_fs {
            self.merge_fs(client, prompter, &mut firmware)?;
        }

        let images = if self.config.minimize_writes {
            let mut skipped = 0;
            let images = dedup_images(client, firmware.blobs(), FLASH_SECTOR_SIZE, |n| {
                skipped += n
            });
            self.done += skipped;
            images
        } else {
            firmware.blobs().clone()
        };
        self.events.set_progress(self.done);

        for (&addr, data) in &images {
            self.write_image(client, addr, data)?;
        }

        self.verify(client, &firmware)?;

        self.events.status("Rebooting into firmware...");
        client
            .disconnect()
            .and_then(|()| client.connection().connect())
            .and_then(|()| client.connection().reboot_into_firmware())
            .map_err(|e| Error::RebootFailed(Box::new(e)))
    }

    fn patch_flash_params(&self, firmware: &mut FirmwareImage, flash_size: usize) {
        let Some(boot) = firmware.get_mut(0).filter(|boot| boot.len() >= 4) else {
            return;
        };

        let params = self
            .config
            .flash_params
            .unwrap_or_else(|| FlashParams::for_flash_size(flash_size));
        params.patch(boot);

        self.events.status(format!(
            "Adjusting flash params in the image 0x0000 to {params}"
        ));
    }

    fn ensure_id(
        &mut self,
        client: &mut StubClient,
        firmware: &mut FirmwareImage,
    ) -> Result<(), Error> {
        let block = client.read(ID_BLOCK_OFFSET, ID_BLOCK_SIZE, |_| {})?;

        if find_id(&block) {
            self.events.status("Existing ID found");
        } else {
            self.events.status("Generating new ID");
            firmware.insert(ID_BLOCK_OFFSET, make_id_block(&self.config.id_domain))?;
            self.id_generated = true;
        }

        Ok(())
    }

    /// Replace the filesystem image of `firmware` with the merge of the
    /// device's filesystem and the new files
    fn merge_fs(
        &mut self,
        client: &mut StubClient,
        prompter: &mut dyn Prompter,
        firmware: &mut FirmwareImage,
    ) -> Result<(), Error> {
        let offset = self.config.spiffs_offset;
        if !firmware.contains(offset) && firmware.files().is_empty() {
            info!("No filesystem in the new firmware");
            return Ok(());
        }

        match self.merged_fs(client, prompter, firmware) {
            Ok(image) => {
                firmware.remove(offset);
                if let Some(image) = image {
                    firmware.insert(offset, image)?;
                }
                self.events.status("Merged flash content");
                Ok(())
            }
            // Overwriting the filesystem of a device which had no ID is fine
            Err(e) if self.id_generated => {
                warn!("Failed to merge flash content, writing the new filesystem: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The filesystem image to write, if any
    fn merged_fs(
        &mut self,
        client: &mut StubClient,
        prompter: &mut dyn Prompter,
        firmware: &FirmwareImage,
    ) -> Result<Option<Vec<u8>>, Error> {
        let (offset, size) = (self.config.spiffs_offset, self.config.spiffs_size);

        self.events.status(format!(
            "Reading file system image ({size} @ {offset:#x})..."
        ));
        let (events, done) = (self.events, self.done);
        let device = client.read(offset, size, |n| events.set_progress(done + n))?;
        self.done += size;

        if let Some(path) = &self.config.dump_fs {
            if let Err(e) = fs::write(path, &device) {
                error!("Failed to write {}: {e}", path.display());
            }
        }

        let new = firmware.get(offset);
        match merge_image(&device, new, firmware.files()) {
            Ok(merged) => Ok((!merged.is_empty()).then_some(merged)),
            Err(e) => match prompter.merge_failed(&e) {
                MergeDecision::Abort => Err(e),
                MergeDecision::WriteNew => match new {
                    Some(new) => Ok(Some(new.to_vec())),
                    None => build_image(firmware.files(), size).map(Some),
                },
                MergeDecision::KeepOld => Ok(None),
            },
        }
    }

    /// Erase and write one image, resuming from the last confirmed sector
    /// when the link fails
    fn write_image(&mut self, client: &mut StubClient, addr: u32, data: &[u8]) -> Result<(), Error> {
        let mut padded = data.to_vec();
        padded.resize(data.len().next_multiple_of(FLASH_SECTOR_SIZE), 0xff);

        let mut offset = 0;
        let mut attempts = 0;
        loop {
            let at = addr + offset as u32;
            let chunk = &padded[offset..];
            let mut confirmed = 0;

            self.events
                .status(format!("Erasing {} @ {at:#x}...", chunk.len()));
            let mut result = client.erase(at, chunk.len() as u32);

            if result.is_ok() {
                self.events
                    .status(format!("Writing {} @ {at:#x}...", chunk.len()));
                let (events, done) = (self.events, self.done);
                result = client.write(at, chunk, false, |written| {
                    confirmed = written;
                    events.set_progress(done + (offset + written).min(data.len()));
                });
            }

            let e = match result {
                Ok(()) => break,
                Err(e) => e,
            };

            let resume = offset + confirmed / FLASH_SECTOR_SIZE * FLASH_SECTOR_SIZE;
            if resume > offset {
                attempts = 0;
            }
            attempts += 1;

            // A corrupted write is not retried, it points at a bad link
            if matches!(e, Error::DataLoss { .. }) || attempts >= MAX_WRITE_ATTEMPTS {
                return Err(flash_error(addr, data.len(), e));
            }

            warn!(
                "Writing {at:#x} failed after {confirmed} bytes, resuming at {:#x}: {e}",
                addr as usize + resume
            );
            offset = resume;

            self.reconnect(client)
                .map_err(|e| flash_error(addr, data.len(), e))?;
        }

        self.done += data.len();
        self.events.set_progress(self.done);
        Ok(())
    }

    /// Reset into the bootloader and start the stub again
    fn reconnect(&self, client: &mut StubClient) -> Result<(), Error> {
        self.events.status("Reconnecting...");
        client.disconnect()?;
        client.connection().connect()?;
        client.connect(self.stub, self.config.flash_baud_rate)
    }

    fn verify(&self, client: &mut StubClient, firmware: &FirmwareImage) -> Result<(), Error> {
        for (&addr, data) in firmware.blobs() {
            self.events
                .status(format!("Verifying image at {addr:#x}..."));

            let digest = client
                .digest(addr, data.len(), 0)
                .map_err(|e| Error::VerifyFailed {
                    addr,
                    source: Box::new(e),
                })?;

            let expected = Md5::digest(data);
            debug!(
                "Image {addr:#x} ({} bytes): local {}, device {}",
                data.len(),
                hex::encode(&expected),
                hex::encode(&digest.digest)
            );

            if digest.digest[..] != expected[..] {
                error!("Hash mismatch for image {addr:#x}");
                return Err(Error::DataLoss {
                    expected: hex::encode(&expected),
                    received: hex::encode(&digest.digest),
                });
            }
        }

        Ok(())
    }
}

fn flash_error(addr: u32, size: usize, source: Error) -> Error {
    Error::FlashImage {
        addr,
        size,
        source: Box::new(source),
    }
}
