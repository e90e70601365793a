use std::io::{Read, Write};
use std::path::Path;

use crate::audio_queue::AudioConsumer;
use crate::cartridge::Cartridge;
use crate::cheats::{GameGenieCheat, GameSharkCheat};
use crate::cpu::Cpu;
use crate::error::CoreError;
use crate::input::Button;
use crate::mmu::Mmu;
use crate::ppu::{DOTS_PER_FRAME, FRAMEBUFFER_SIZE};
use crate::savestate::{
    SAVE_STATE_MAGIC, SAVE_STATE_VERSION, StateReader, StateWriter, compress_blob,
    decompress_blob,
};

pub const CYCLES_PER_FRAME: u32 = DOTS_PER_FRAME;
pub const CYCLES_PER_SECOND: u32 = 4_194_304;
pub const FRAME_RATE: f64 = CYCLES_PER_FRAME as f64 / CYCLES_PER_SECOND as f64;

pub const DMG_BOOT_ROM_SIZE: usize = 0x100;
pub const CGB_BOOT_ROM_SIZE: usize = 0x900;

type DrawCallback = Box<dyn FnMut(&[u8], bool) + Send>;

/// The assembled machine: CPU plus the MMU that owns every peripheral.
/// Hosts drive it with [`GbCore::update`] and consume the draw callback,
/// audio queue and serial output.
pub struct GbCore {
    pub cpu: Cpu,
    pub mmu: Mmu,
    cgb: bool,
    speed_factor: u32,
    draw_callback: Option<DrawCallback>,
    boot_rom: Option<Vec<u8>>,
    pub game_sharks: Vec<GameSharkCheat>,
    pub game_genies: Vec<GameGenieCheat>,
}

impl GbCore {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new_post_boot(false),
            mmu: Mmu::new(false),
            cgb: false,
            speed_factor: 1,
            draw_callback: None,
            boot_rom: None,
            game_sharks: Vec::new(),
            game_genies: Vec::new(),
        }
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb
    }

    pub fn rom_loaded(&self) -> bool {
        self.mmu.cart.is_some()
    }

    pub fn game_title(&self) -> &str {
        self.mmu.cart.as_ref().map(|c| c.title.as_str()).unwrap_or("")
    }

    /// Validate a ROM image, apply Game Genie patches and boot the machine.
    pub fn load_rom(&mut self, data: Vec<u8>) -> Result<(), CoreError> {
        let cart = Cartridge::load(data)?;
        self.install_cart(cart);
        Ok(())
    }

    /// Load from disk; `load_battery` also pulls in the `.sav` sidecar.
    pub fn load_rom_from_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        load_battery: bool,
    ) -> Result<(), CoreError> {
        let cart = if load_battery {
            Cartridge::from_file(path)?
        } else {
            Cartridge::load(std::fs::read(path)?)?
        };
        self.install_cart(cart);
        Ok(())
    }

    fn install_cart(&mut self, mut cart: Cartridge) {
        for cheat in &self.game_genies {
            if cheat.enabled {
                cheat.apply(&mut cart.rom);
            }
        }
        self.cgb = cart.cgb;
        self.cpu = Cpu::new_post_boot(self.cgb);
        self.mmu = Mmu::new(self.cgb);
        cart.set_speed_factor(self.speed_factor);
        self.mmu.load_cart(cart);
        self.mmu.apu.set_speed_factor(self.speed_factor);
        self.mount_boot_rom();
    }

    /// Install a boot ROM image to be mapped on the next load/reset.
    pub fn load_boot_rom(&mut self, data: Vec<u8>) -> Result<(), CoreError> {
        if data.len() != DMG_BOOT_ROM_SIZE && data.len() != CGB_BOOT_ROM_SIZE {
            return Err(CoreError::InvalidRom("unsupported boot ROM size"));
        }
        self.boot_rom = Some(data);
        Ok(())
    }

    fn mount_boot_rom(&mut self) {
        if let Some(boot) = self.boot_rom.clone() {
            self.cpu = Cpu::new_power_on();
            self.mmu.load_boot_rom(boot);
        }
    }

    /// Re-initialize every component, keeping the loaded cartridge.
    /// `full` also wipes battery-backed RAM.
    pub fn reset(&mut self, full: bool) {
        let cart = self.mmu.cart.take();
        self.cpu = Cpu::new_post_boot(self.cgb);
        self.mmu = Mmu::new(self.cgb);
        if let Some(mut cart) = cart {
            cart.reset();
            if full {
                cart.ram.fill(0);
            }
            self.mmu.load_cart(cart);
        }
        self.mmu.apu.set_speed_factor(self.speed_factor);
        self.mount_boot_rom();
    }

    /// Run the machine for a dot-cycle budget (scaled by fast-forward).
    /// The draw callback fires on each VBlank entry.
    pub fn update(&mut self, cycles: u32) {
        if !self.rom_loaded() {
            return;
        }
        let target = self.cpu.cycles + cycles as u64 * self.speed_factor as u64;
        while self.cpu.cycles < target {
            self.cpu.step(&mut self.mmu);
            if let Some(first_frame) = self.mmu.ppu.take_frame() {
                self.vblank_handler(first_frame);
            }
        }
    }

    pub fn run_frame(&mut self) {
        self.update(CYCLES_PER_FRAME);
    }

    fn vblank_handler(&mut self, first_frame: bool) {
        for i in 0..self.game_sharks.len() {
            if self.game_sharks[i].enabled {
                let (addr, val) = (self.game_sharks[i].addr, self.game_sharks[i].new_data);
                self.mmu.write_byte(addr, val);
            }
        }
        if let Some(callback) = self.draw_callback.as_mut() {
            callback(self.mmu.ppu.framebuffer().as_slice(), first_frame);
        }
    }

    /// `callback(framebuffer, first_frame)`: the slice is the RGB
    /// framebuffer, valid for the duration of the call; `first_frame` marks
    /// the first completed frame after an LCD enable.
    pub fn set_draw_callback(&mut self, callback: impl FnMut(&[u8], bool) + Send + 'static) {
        self.draw_callback = Some(Box::new(callback));
    }

    pub fn set_button_state(&mut self, button: Button, pressed: bool) {
        self.mmu.joypad.set_button(button, pressed, &mut self.mmu.if_reg);
    }

    pub fn enable_fast_forward(&mut self, factor: u32) {
        self.speed_factor = factor.max(1);
        self.apply_speed_factor();
    }

    pub fn disable_fast_forward(&mut self) {
        self.speed_factor = 1;
        self.apply_speed_factor();
    }

    fn apply_speed_factor(&mut self) {
        if let Some(cart) = self.mmu.cart.as_mut() {
            cart.set_speed_factor(self.speed_factor);
        }
        self.mmu.apu.set_speed_factor(self.speed_factor);
    }

    /// Pull side of the audio sample queue; take once and hand to the audio
    /// thread. `load_rom` and `reset` rebuild the machine (and its queue), so
    /// take the consumer and set the sample rate after loading.
    pub fn take_audio_consumer(&mut self) -> Option<AudioConsumer> {
        self.mmu.apu.take_consumer()
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.mmu.apu.set_sample_rate(rate);
    }

    pub fn take_serial_output(&mut self) -> Vec<u8> {
        self.mmu.take_serial()
    }

    pub fn has_battery(&self) -> bool {
        self.mmu.cart.as_ref().is_some_and(|c| c.has_battery)
    }

    pub fn save_battery<W: Write>(&mut self, sink: &mut W) -> Result<(), CoreError> {
        match self.mmu.cart.as_mut() {
            Some(cart) if cart.has_battery => cart.save_battery(sink),
            _ => Ok(()),
        }
    }

    pub fn load_battery<R: Read>(&mut self, source: &mut R) -> Result<(), CoreError> {
        match self.mmu.cart.as_mut() {
            Some(cart) if cart.has_battery => cart.load_battery(source),
            _ => Ok(()),
        }
    }

    /// Save states are refused while the boot ROM is still mapped.
    pub fn can_save_state(&self) -> bool {
        self.rom_loaded() && !self.mmu.boot_mapped
    }

    pub fn save_state<W: Write>(&self, sink: &mut W) -> Result<(), CoreError> {
        let Some(cart) = self.mmu.cart.as_ref() else {
            return Err(CoreError::RomNotFound);
        };
        sink.write_all(SAVE_STATE_MAGIC)?;
        sink.write_all(&[SAVE_STATE_VERSION, cart.rom_checksum()])?;
        sink.write_all(self.mmu.ppu.framebuffer().as_slice())?;

        let mut w = StateWriter::new();
        self.cpu.save_state(&mut w);
        self.mmu.save_state(&mut w);
        self.mmu.ppu.save_state(&mut w);
        self.mmu.apu.save_state(&mut w);
        self.mmu.joypad.save_state(&mut w);
        self.mmu.serial.save_state(&mut w);
        cart.save_state(&mut w);
        sink.write_all(&compress_blob(&w.into_bytes())?)?;
        Ok(())
    }

    /// Atomically replace the whole machine state from a save-state stream.
    /// The matching ROM must already be loaded.
    pub fn load_state<R: Read>(&mut self, source: &mut R) -> Result<(), CoreError> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;

        let header_len = SAVE_STATE_MAGIC.len() + 2;
        if data.len() < header_len + FRAMEBUFFER_SIZE {
            return Err(CoreError::CorruptSaveState("file too short"));
        }
        if &data[..SAVE_STATE_MAGIC.len()] != SAVE_STATE_MAGIC {
            return Err(CoreError::CorruptSaveState("bad magic"));
        }
        if data[SAVE_STATE_MAGIC.len()] != SAVE_STATE_VERSION {
            return Err(CoreError::CorruptSaveState("unsupported version"));
        }
        let checksum = data[SAVE_STATE_MAGIC.len() + 1];
        let Some(cart) = self.mmu.cart.as_ref() else {
            return Err(CoreError::RomNotFound);
        };
        if checksum != cart.rom_checksum() {
            return Err(CoreError::RomNotFound);
        }

        let framebuffer = &data[header_len..header_len + FRAMEBUFFER_SIZE];
        let blob = decompress_blob(&data[header_len + FRAMEBUFFER_SIZE..])?;
        let mut r = StateReader::new(&blob);
        self.cpu.load_state(&mut r)?;
        self.mmu.load_state(&mut r)?;
        self.mmu.ppu.load_state(&mut r)?;
        self.mmu.apu.load_state(&mut r)?;
        self.mmu.joypad.load_state(&mut r)?;
        self.mmu.serial.load_state(&mut r)?;
        self.mmu
            .cart
            .as_mut()
            .expect("checked above")
            .load_state(&mut r)?;
        self.mmu.ppu.load_framebuffer(framebuffer);
        self.cgb = self.mmu.is_cgb();
        Ok(())
    }
}

impl Default for GbCore {
    fn default() -> Self {
        Self::new()
    }
}
