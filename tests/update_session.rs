//! Bootloader sessions end to end: happy path, corrupted frames, timeout
//! behavior, and bank-activation atomicity under simulated power loss.

use cockpit_vm::bootloader::command::Command;
use cockpit_vm::bootloader::{frame, Bootloader, Config, Outcome, SERIAL_TRIGGER};
use cockpit_vm::flash::{Bank, BankManager, BankMetadata, Layout, IMAGE_CRC};
use cockpit_vm::image::write_image;
use cockpit_vm::sim::{SimFlash, SimHost};
use cockpit_vm::{Hypervisor, Instruction, Op};

const FLASH_BYTES: usize = 0x1_0000;

type Banks = BankManager<SimFlash<FLASH_BYTES>>;

fn sample_image(version: u16) -> Vec<u8> {
    let instrs = [
        Instruction::new(Op::Push, 10),
        Instruction::new(Op::Push, 20),
        Instruction::plain(Op::Add),
        Instruction::plain(Op::Halt),
    ];
    let mut buf = [0u8; 256];
    let len = write_image(version, &instrs, &[], &mut buf).unwrap();
    buf[..len].to_vec()
}

fn frame_bytes(cmd: &Command) -> Vec<u8> {
    let mut payload = [0u8; 1100];
    let n = cmd.write(&mut payload).unwrap();
    let mut wire = [0u8; 1110];
    let m = frame::encode(&payload[..n], &mut wire).unwrap();
    wire[..m].to_vec()
}

fn queue_update(host: &mut SimHost, image: &[u8]) {
    host.queue_serial(&frame_bytes(&Command::Handshake { version: 1 }));
    host.queue_serial(&frame_bytes(&Command::PrepareFlash {
        size: image.len() as u32,
    }));
    host.queue_serial(&frame_bytes(&Command::Data { chunk: image }));
    host.queue_serial(&frame_bytes(&Command::Verify {
        size: image.len() as u32,
        crc32: IMAGE_CRC.checksum(image),
    }));
}

/// Decode every framed response captured on the simulated wire.
fn responses(wire: &[u8]) -> Vec<Vec<u8>> {
    let mut parser = frame::FrameParser::new();
    let mut out = Vec::new();
    for &b in wire {
        if parser.feed(b).expect("well-formed response frame") {
            out.push(parser.take_payload().to_vec());
        }
    }
    out
}

/// Install `image` as the active image in `bank`.
fn install_active(banks: &mut Banks, bank: Bank, image: &[u8]) {
    banks.erase_bank(bank).unwrap();
    let mut at = 0;
    while at < image.len() {
        let mut word = [0xFFu8; 8];
        let n = (image.len() - at).min(8);
        word[..n].copy_from_slice(&image[at..at + n]);
        banks.program_aligned(bank, at as u32, &word).unwrap();
        at += 8;
    }
    let crc32 = IMAGE_CRC.checksum(image);
    banks
        .commit_metadata(&BankMetadata {
            version: 1,
            size: image.len() as u32,
            crc32,
            active: bank,
        })
        .unwrap();
}

#[test]
fn happy_path_update_then_boot() {
    let mut host = SimHost::new();
    let mut banks = Banks::new(SimFlash::new(), Layout::default()).unwrap();
    install_active(&mut banks, Bank::A, &sample_image(1));

    let image = sample_image(2);
    queue_update(&mut host, &image);

    let outcome = Bootloader::new(&mut host, &mut banks, Config::default()).run_session();
    assert_eq!(outcome, Outcome::Updated);

    let replies = responses(host.serial_out());
    assert_eq!(replies.len(), 4);
    assert_eq!(replies[0][0], 0x81);
    assert_eq!(&replies[0][3..5], b"OK");
    assert_eq!(replies[1], b"\x82OK");
    assert_eq!(replies[2], b"\x83OK");
    assert_eq!(replies[3][..3], *b"\x84OK");
    let written = u16::from_be_bytes([replies[3][3], replies[3][4]]);
    assert_eq!(written as usize, image.len());

    // "reboot": metadata now selects bank B and the new image runs
    let (bank, meta) = banks.active_bank().unwrap();
    assert_eq!(bank, Bank::B);
    assert_eq!(meta.version, 2);
    assert_eq!(meta.size as usize, image.len());

    let mut loaded = vec![0u8; meta.size as usize];
    banks.read_bank(bank, 0, &mut loaded).unwrap();
    let mut hv = Hypervisor::new(SimHost::new());
    hv.load_image(&loaded).unwrap();
    hv.execute_program().unwrap();
    assert_eq!(hv.engine().stack().peek(), Some(30));
}

#[test]
fn corrupted_data_frame_leaves_previous_bank_active() {
    let mut host = SimHost::new();
    let mut banks = Banks::new(SimFlash::new(), Layout::default()).unwrap();
    let old = sample_image(1);
    install_active(&mut banks, Bank::A, &old);

    let image = sample_image(2);
    host.queue_serial(&frame_bytes(&Command::Handshake { version: 1 }));
    host.queue_serial(&frame_bytes(&Command::PrepareFlash {
        size: image.len() as u32,
    }));
    let mut data = frame_bytes(&Command::Data { chunk: &image });
    let crc_at = data.len() - 3;
    data[crc_at] ^= 0x01; // flip one CRC bit
    host.queue_serial(&data);

    let outcome = Bootloader::new(&mut host, &mut banks, Config::default()).run_session();
    assert_eq!(outcome, Outcome::JumpApplication);

    let replies = responses(host.serial_out());
    // handshake ok, prepare ok, then the CRC error report
    assert_eq!(replies[0][0], 0x81);
    assert_eq!(replies[1][0], 0x82);
    assert_eq!(replies[2], vec![0xFF, 0x04]);

    let (bank, meta) = banks.active_bank().unwrap();
    assert_eq!(bank, Bank::A);
    assert_eq!(meta.version, 1);
    let mut loaded = vec![0u8; meta.size as usize];
    banks.read_bank(bank, 0, &mut loaded).unwrap();
    assert_eq!(loaded, old);
}

#[test]
fn verify_crc_mismatch_aborts_without_switching() {
    let mut host = SimHost::new();
    let mut banks = Banks::new(SimFlash::new(), Layout::default()).unwrap();
    install_active(&mut banks, Bank::A, &sample_image(1));

    let image = sample_image(2);
    host.queue_serial(&frame_bytes(&Command::Handshake { version: 1 }));
    host.queue_serial(&frame_bytes(&Command::PrepareFlash {
        size: image.len() as u32,
    }));
    host.queue_serial(&frame_bytes(&Command::Data { chunk: &image }));
    host.queue_serial(&frame_bytes(&Command::Verify {
        size: image.len() as u32,
        crc32: !IMAGE_CRC.checksum(&image), // wrong on purpose
    }));

    let outcome = Bootloader::new(&mut host, &mut banks, Config::default()).run_session();
    assert_eq!(outcome, Outcome::JumpApplication);

    let replies = responses(host.serial_out());
    assert_eq!(replies.last().unwrap(), &vec![0xFF, 0x08]); // ImageInvalid

    let (bank, _) = banks.active_bank().unwrap();
    assert_eq!(bank, Bank::A);
}

#[test]
fn handshake_is_idempotent_in_ready() {
    let mut host = SimHost::new();
    let mut banks = Banks::new(SimFlash::new(), Layout::default()).unwrap();
    host.queue_serial(&frame_bytes(&Command::Handshake { version: 1 }));
    host.queue_serial(&frame_bytes(&Command::Handshake { version: 1 }));

    let config = Config {
        session_timeout_ms: 3_000,
        ..Config::default()
    };
    let outcome = Bootloader::new(&mut host, &mut banks, config).run_session();
    assert_eq!(outcome, Outcome::JumpApplication);

    let replies = responses(host.serial_out());
    assert!(replies.len() >= 2);
    assert_eq!(replies[0], replies[1]);
    assert_eq!(replies[0][0], 0x81);
}

#[test]
fn session_timeout_hits_the_30s_boundary() {
    let mut host = SimHost::new();
    let mut banks = Banks::new(SimFlash::new(), Layout::default()).unwrap();
    // complete the handshake so only the session deadline applies
    host.queue_serial(&frame_bytes(&Command::Handshake { version: 1 }));

    let started = host.now_ms();
    let outcome = Bootloader::new(&mut host, &mut banks, Config::default()).run_session();
    assert_eq!(outcome, Outcome::JumpApplication);

    let elapsed = host.now_ms().wrapping_sub(started);
    assert!(
        (30_000..30_200).contains(&elapsed),
        "session ended after {} ms",
        elapsed
    );
    // the timeout itself is reported
    let replies = responses(host.serial_out());
    assert_eq!(replies.last().unwrap(), &vec![0xFF, 0x05]);
}

#[test]
fn session_timeout_survives_tick_counter_wraparound() {
    let mut host = SimHost::new();
    // park the clock just short of the 2^32 ms wrap so every deadline in
    // the session straddles it
    host.advance_ms(u32::MAX - 1_000);
    let mut banks = Banks::new(SimFlash::new(), Layout::default()).unwrap();
    host.queue_serial(&frame_bytes(&Command::Handshake { version: 1 }));

    let started = host.now_ms();
    let outcome = Bootloader::new(&mut host, &mut banks, Config::default()).run_session();
    assert_eq!(outcome, Outcome::JumpApplication);

    let elapsed = host.now_ms().wrapping_sub(started);
    assert!(
        (30_000..30_200).contains(&elapsed),
        "session ended after {} ms",
        elapsed
    );
}

#[test]
fn full_boot_with_serial_trigger() {
    let mut host = SimHost::new();
    let mut banks = Banks::new(SimFlash::new(), Layout::default()).unwrap();
    install_active(&mut banks, Bank::A, &sample_image(1));

    host.queue_serial(&SERIAL_TRIGGER);
    let image = sample_image(2);
    queue_update(&mut host, &image);

    let outcome = Bootloader::new(&mut host, &mut banks, Config::default()).run();
    assert_eq!(outcome, Outcome::Updated);
    let (bank, _) = banks.active_bank().unwrap();
    assert_eq!(bank, Bank::B);
}

#[test]
fn bank_activation_is_atomic_under_power_loss() {
    let old = sample_image(1);
    let new = sample_image(2);

    // more cut points than a full update uses, so late values also cover
    // the uninterrupted case
    let mut saw_old = false;
    let mut saw_new = false;
    for cut_after in 0..40u32 {
        let mut host = SimHost::new();
        let mut banks = Banks::new(SimFlash::new(), Layout::default()).unwrap();
        install_active(&mut banks, Bank::A, &old);

        let mut flash = banks.release();
        flash.cut_power_after(cut_after);
        let mut banks = Banks::new(flash, Layout::default()).unwrap();

        queue_update(&mut host, &new);
        let _ = Bootloader::new(&mut host, &mut banks, Config::default()).run_session();

        // "reboot" with power restored
        let mut flash = banks.release();
        flash.restore_power();
        let mut banks = Banks::new(flash, Layout::default()).unwrap();

        let (bank, meta) = banks
            .active_bank()
            .expect("a bootable bank must survive any cut point");
        let mut loaded = vec![0u8; meta.size as usize];
        banks.read_bank(bank, 0, &mut loaded).unwrap();
        match bank {
            Bank::A => {
                assert_eq!(loaded, old, "cut at {}: bank A corrupted", cut_after);
                saw_old = true;
            }
            Bank::B => {
                assert_eq!(loaded, new, "cut at {}: bank B partial", cut_after);
                saw_new = true;
            }
        }
    }
    assert!(saw_old, "no cut point preserved the old bank");
    assert!(saw_new, "no cut point completed the update");
}
