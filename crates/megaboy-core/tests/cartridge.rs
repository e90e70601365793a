mod common;

use std::sync::Arc;

use megaboy_core::cartridge::Cartridge;
use megaboy_core::clock::ManualClock;
use megaboy_core::error::CoreError;

use common::{build_rom, set_title};

#[test]
fn rom_only_header_fields() {
    let mut rom = build_rom(0x00, 0x00, 0x00);
    set_title(&mut rom, "TESTTITLE");
    let cart = Cartridge::load(rom).unwrap();

    assert_eq!(cart.rom_banks, 2);
    assert_eq!(cart.ram_banks, 0);
    assert!(!cart.has_battery);
    assert!(!cart.has_timer);
    assert_eq!(cart.title, "TESTTITLE");
}

#[test]
fn title_stops_at_nul() {
    let mut rom = build_rom(0x00, 0x00, 0x00);
    set_title(&mut rom, "AB");
    rom[0x137] = b'Z'; // past the NUL at 0x136
    let cart = Cartridge::load(rom).unwrap();
    assert_eq!(cart.title, "AB");
}

#[test]
fn battery_roundtrips_ram_bit_exact() {
    let rom = build_rom(0x03, 0x00, 0x03); // MBC1 + RAM + battery, 4 banks
    let mut cart = Cartridge::load(rom.clone()).unwrap();

    cart.write(0x0000, 0x0A);
    cart.write(0x4000, 0x00);
    for i in 0..16u16 {
        cart.write(0xA000 + i, 0x30 + i as u8);
    }

    let mut blob = Vec::new();
    cart.save_battery(&mut blob).unwrap();
    assert_eq!(blob.len(), 4 * 0x2000);

    let mut fresh = Cartridge::load(rom).unwrap();
    fresh.load_battery(&mut blob.as_slice()).unwrap();
    assert_eq!(fresh.ram, cart.ram);
}

#[test]
fn battery_length_mismatch_is_rejected() {
    let rom = build_rom(0x03, 0x00, 0x03);
    let mut cart = Cartridge::load(rom).unwrap();
    let short = vec![0u8; 0x2000];
    assert!(matches!(
        cart.load_battery(&mut short.as_slice()),
        Err(CoreError::InvalidBattery)
    ));
}

#[test]
fn rtc_battery_roundtrips_and_applies_wall_time() {
    let rom = build_rom(0x10, 0x00, 0x03); // MBC3 + timer + RAM + battery
    let clock = Arc::new(ManualClock::new(1_000));
    let mut cart = Cartridge::load_with_clock(rom.clone(), Box::new(Arc::clone(&clock))).unwrap();

    cart.write(0x0000, 0x0A);
    cart.write(0x4000, 0x08);
    cart.write(0xA000, 30); // seconds = 30
    let mut blob = Vec::new();
    cart.save_battery(&mut blob).unwrap();
    assert_eq!(blob.len(), 4 * 0x2000 + 18);

    // An hour and five seconds pass in the real world.
    clock.advance(3_605);
    let mut fresh = Cartridge::load_with_clock(rom, Box::new(Arc::clone(&clock))).unwrap();
    fresh.load_battery(&mut blob.as_slice()).unwrap();

    fresh.write(0x0000, 0x0A);
    fresh.write(0x6000, 0x00);
    fresh.write(0x6000, 0x01);
    fresh.write(0x4000, 0x08);
    let seconds = fresh.read(0xA000);
    fresh.write(0x4000, 0x09);
    let minutes = fresh.read(0xA000);
    fresh.write(0x4000, 0x0A);
    let hours = fresh.read(0xA000);

    assert_eq!(seconds, 35);
    assert_eq!(minutes, 0);
    assert_eq!(hours, 1);
}

#[test]
fn rtc_halt_suppresses_wall_time_on_load() {
    let rom = build_rom(0x10, 0x00, 0x03);
    let clock = Arc::new(ManualClock::new(5_000));
    let mut cart = Cartridge::load_with_clock(rom.clone(), Box::new(Arc::clone(&clock))).unwrap();

    cart.write(0x0000, 0x0A);
    cart.write(0x4000, 0x0C);
    cart.write(0xA000, 0x40); // halt
    let mut blob = Vec::new();
    cart.save_battery(&mut blob).unwrap();

    clock.advance(86_400);
    let mut fresh = Cartridge::load_with_clock(rom, Box::new(clock)).unwrap();
    fresh.load_battery(&mut blob.as_slice()).unwrap();

    fresh.write(0x0000, 0x0A);
    fresh.write(0x6000, 0x00);
    fresh.write(0x6000, 0x01);
    fresh.write(0x4000, 0x08);
    assert_eq!(fresh.read(0xA000), 0, "halted RTC ignores elapsed time");
}

#[test]
fn battery_sidecar_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let rom_path = dir.path().join("game.gb");
    std::fs::write(&rom_path, build_rom(0x03, 0x00, 0x03)).unwrap();

    let mut cart = Cartridge::from_file(&rom_path).unwrap();
    cart.write(0x0000, 0x0A);
    cart.write(0xA000, 0x5A);
    cart.save_battery_file().unwrap();

    let data = std::fs::read(rom_path.with_extension("sav")).unwrap();
    assert_eq!(data[0], 0x5A);

    let again = Cartridge::from_file(&rom_path).unwrap();
    assert_eq!(again.ram[0], 0x5A, "sidecar picked up on load");
}

#[test]
fn mbc1_mode1_probes_upper_bank_windows() {
    // 4 MiB image: banks 0x00/0x20/0x40/0x60 become reachable at 0x0000 in
    // mode 1 through the secondary register.
    let rom = build_rom(0x01, 0x07, 0x00);
    let mut cart = Cartridge::load(rom).unwrap();

    cart.write(0x6000, 0x01);
    for bank2 in 0u8..4 {
        cart.write(0x4000, bank2);
        assert_eq!(cart.read(0x0000), bank2 << 5, "bank2 {bank2}");
    }
}
