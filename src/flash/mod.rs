//! Dual-bank bytecode flash with an atomically switched metadata page.
//!
//! Two equally sized banks hold complete guest images; a dedicated metadata
//! page records which bank is active along with the image size and CRC-32.
//! The metadata page is erased and programmed only after the candidate bank
//! is fully written and verified, so power loss at any earlier point leaves
//! the previous bank observable. An optional trigger page lets the
//! application request a bootloader session across a reset.

use crc::{Crc, CRC_32_ISO_HDLC};
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::image::ImageHeader;

/// CRC-32 used for images, metadata-referenced banks, and the trigger page.
pub const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const METADATA_MAGIC: u32 = 0x434F_4D50;
pub const METADATA_BYTES: usize = 20;

pub const TRIGGER_MAGIC: u32 = 0x5452_4947;
/// Trigger-page code requesting a bootloader session on next reset.
pub const TRIGGER_ENTER: u32 = 0xB007_10AD;
pub const TRIGGER_BYTES: usize = 12;

/// Flash writes happen in aligned words of this many bytes.
pub const PROGRAM_ALIGN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bank {
    A,
    B,
}

impl Bank {
    pub fn other(self) -> Bank {
        match self {
            Bank::A => Bank::B,
            Bank::B => Bank::A,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            Bank::A => 0,
            Bank::B => 1,
        }
    }

    pub fn from_index(index: u32) -> Option<Bank> {
        match index {
            0 => Some(Bank::A),
            1 => Some(Bank::B),
            _ => None,
        }
    }
}

/// Static flash map, as offsets from the device base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Layout {
    pub bank_a: u32,
    pub bank_b: u32,
    pub bank_size: u32,
    pub metadata: u32,
    pub trigger: Option<u32>,
}

impl Default for Layout {
    /// 64 KB bytecode region: two 30 KB banks, a metadata page, and a
    /// trigger page.
    fn default() -> Self {
        Self {
            bank_a: 0x0000,
            bank_b: 0x7800,
            bank_size: 0x7800,
            metadata: 0xF000,
            trigger: Some(0xF800),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Access outside the static layout.
    OutOfRange,
    NotAligned,
    /// The underlying flash operation failed.
    Operation,
}

/// Persisted bank-selection record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BankMetadata {
    pub version: u32,
    /// Bytes of bytecode in the active bank.
    pub size: u32,
    pub crc32: u32,
    pub active: Bank,
}

impl BankMetadata {
    pub fn encode(&self) -> [u8; METADATA_BYTES] {
        let mut out = [0u8; METADATA_BYTES];
        out[0..4].copy_from_slice(&METADATA_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        out[16..20].copy_from_slice(&self.active.index().to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < METADATA_BYTES {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        if word(0) != METADATA_MAGIC {
            return None;
        }
        Some(Self {
            version: word(4),
            size: word(8),
            crc32: word(12),
            active: Bank::from_index(word(16))?,
        })
    }
}

/// Validated access to the dual-bank region of a NOR flash device.
pub struct BankManager<F> {
    flash: F,
    layout: Layout,
}

impl<F: ReadNorFlash + NorFlash> BankManager<F> {
    pub fn new(flash: F, layout: Layout) -> Result<Self, FlashError> {
        let capacity = flash.capacity() as u32;
        let erase = F::ERASE_SIZE as u32;
        let in_range = |base: u32, len: u32| {
            base.checked_add(len).map(|end| end <= capacity).unwrap_or(false)
        };

        if !in_range(layout.bank_a, layout.bank_size)
            || !in_range(layout.bank_b, layout.bank_size)
            || !in_range(layout.metadata, erase)
        {
            return Err(FlashError::OutOfRange);
        }
        if layout.bank_a % erase != 0
            || layout.bank_b % erase != 0
            || layout.bank_size % erase != 0
            || layout.metadata % erase != 0
        {
            return Err(FlashError::NotAligned);
        }
        if let Some(trigger) = layout.trigger {
            if !in_range(trigger, erase) {
                return Err(FlashError::OutOfRange);
            }
            if trigger % erase != 0 {
                return Err(FlashError::NotAligned);
            }
        }
        Ok(Self { flash, layout })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn bank_size(&self) -> u32 {
        self.layout.bank_size
    }

    pub fn base_of(&self, bank: Bank) -> u32 {
        match bank {
            Bank::A => self.layout.bank_a,
            Bank::B => self.layout.bank_b,
        }
    }

    pub fn erase_bank(&mut self, bank: Bank) -> Result<(), FlashError> {
        let base = self.base_of(bank);
        debug!("erasing bank {}", bank.index());
        self.flash
            .erase(base, base + self.layout.bank_size)
            .map_err(|_| FlashError::Operation)
    }

    /// Program one or more 8-byte words at an aligned offset inside `bank`.
    pub fn program_aligned(&mut self, bank: Bank, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        if offset % PROGRAM_ALIGN as u32 != 0 || bytes.len() % PROGRAM_ALIGN != 0 {
            return Err(FlashError::NotAligned);
        }
        let end = offset
            .checked_add(bytes.len() as u32)
            .ok_or(FlashError::OutOfRange)?;
        if end > self.layout.bank_size {
            return Err(FlashError::OutOfRange);
        }
        self.flash
            .write(self.base_of(bank) + offset, bytes)
            .map_err(|_| FlashError::Operation)
    }

    /// Read from `bank` at `offset`.
    pub fn read_bank(&mut self, bank: Bank, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let end = offset
            .checked_add(buf.len() as u32)
            .ok_or(FlashError::OutOfRange)?;
        if end > self.layout.bank_size {
            return Err(FlashError::OutOfRange);
        }
        self.flash
            .read(self.base_of(bank) + offset, buf)
            .map_err(|_| FlashError::Operation)
    }

    /// CRC-32 over the first `size` bytes of `bank`.
    pub fn bank_crc32(&mut self, bank: Bank, size: u32) -> Result<u32, FlashError> {
        if size > self.layout.bank_size {
            return Err(FlashError::OutOfRange);
        }
        let base = self.base_of(bank);
        let mut digest = IMAGE_CRC.digest();
        let mut chunk = [0u8; 64];
        let mut at = 0u32;
        while at < size {
            let n = (size - at).min(chunk.len() as u32) as usize;
            self.flash
                .read(base + at, &mut chunk[..n])
                .map_err(|_| FlashError::Operation)?;
            digest.update(&chunk[..n]);
            at += n as u32;
        }
        Ok(digest.finalize())
    }

    pub fn verify_crc32(&mut self, bank: Bank, size: u32, expected: u32) -> Result<bool, FlashError> {
        Ok(self.bank_crc32(bank, size)? == expected)
    }

    pub fn load_metadata(&mut self) -> Option<BankMetadata> {
        let mut raw = [0u8; METADATA_BYTES];
        self.flash.read(self.layout.metadata, &mut raw).ok()?;
        let meta = BankMetadata::decode(&raw)?;
        if meta.size > self.layout.bank_size {
            return None;
        }
        Some(meta)
    }

    /// Erase and program the metadata page. This is the single point where
    /// an update becomes observable.
    pub fn commit_metadata(&mut self, meta: &BankMetadata) -> Result<(), FlashError> {
        let page = self.layout.metadata;
        self.flash
            .erase(page, page + F::ERASE_SIZE as u32)
            .map_err(|_| FlashError::Operation)?;

        let encoded = meta.encode();
        let mut padded = [0xFFu8; 32];
        padded[..METADATA_BYTES].copy_from_slice(&encoded);
        let write_len = METADATA_BYTES.next_multiple_of(F::WRITE_SIZE.max(1)).min(padded.len());
        self.flash
            .write(page, &padded[..write_len])
            .map_err(|_| FlashError::Operation)?;
        info!(
            "metadata committed: bank {} v{} {} bytes",
            meta.active.index(),
            meta.version,
            meta.size
        );
        Ok(())
    }

    /// The bank the hypervisor should boot, with its metadata.
    ///
    /// Valid metadata whose bank passes CRC wins; otherwise both banks are
    /// probed structurally and the higher image version is preferred.
    pub fn active_bank(&mut self) -> Option<(Bank, BankMetadata)> {
        if let Some(meta) = self.load_metadata() {
            match self.verify_crc32(meta.active, meta.size, meta.crc32) {
                Ok(true) => return Some((meta.active, meta)),
                _ => warn!("metadata bank {} failed CRC", meta.active.index()),
            }
        }
        self.recover()
    }

    /// Probe both banks for a structurally valid image.
    pub fn recover(&mut self) -> Option<(Bank, BankMetadata)> {
        let a = self.probe_bank(Bank::A);
        let b = self.probe_bank(Bank::B);
        let (bank, version, size) = match (a, b) {
            (Some((va, sa)), Some((vb, sb))) => {
                if vb > va {
                    (Bank::B, vb, sb)
                } else {
                    (Bank::A, va, sa)
                }
            }
            (Some((va, sa)), None) => (Bank::A, va, sa),
            (None, Some((vb, sb))) => (Bank::B, vb, sb),
            (None, None) => return None,
        };
        let crc32 = self.bank_crc32(bank, size).ok()?;
        info!("recovered bank {} v{}", bank.index(), version as u32);
        Some((
            bank,
            BankMetadata {
                version: version as u32,
                size,
                crc32,
                active: bank,
            },
        ))
    }

    /// Structural image check: header, counts, and a string-table walk, all
    /// bounded by the bank size. Returns (version, image byte length).
    pub(crate) fn probe_bank(&mut self, bank: Bank) -> Option<(u16, u32)> {
        let mut head = [0u8; crate::image::HEADER_BYTES];
        self.read_bank(bank, 0, &mut head).ok()?;
        let header = ImageHeader::parse(&head).ok()?;

        let code_len = header.instr_count.checked_mul(4)?;
        let mut at = (crate::image::HEADER_BYTES as u32).checked_add(code_len)?;
        if at > self.layout.bank_size {
            return None;
        }
        for _ in 0..header.string_count {
            let mut prefix = [0u8; 2];
            self.read_bank(bank, at, &mut prefix).ok()?;
            let len = u16::from_le_bytes(prefix) as u32;
            if len > crate::image::MAX_STRING_BYTES as u32 {
                return None;
            }
            at = at.checked_add(2 + len)?;
            if at > self.layout.bank_size {
                return None;
            }
        }
        Some((header.version, at))
    }

    /// True when the trigger page requests a bootloader session.
    pub fn read_trigger(&mut self) -> bool {
        let Some(page) = self.layout.trigger else {
            return false;
        };
        let mut raw = [0u8; TRIGGER_BYTES];
        if self.flash.read(page, &mut raw).is_err() {
            return false;
        }
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        word(0) == TRIGGER_MAGIC
            && word(4) == TRIGGER_ENTER
            && word(8) == IMAGE_CRC.checksum(&raw[0..8])
    }

    /// Arm the trigger page (application side, before a reset).
    pub fn write_trigger(&mut self) -> Result<(), FlashError> {
        let page = self.layout.trigger.ok_or(FlashError::OutOfRange)?;
        self.flash
            .erase(page, page + F::ERASE_SIZE as u32)
            .map_err(|_| FlashError::Operation)?;
        let mut raw = [0xFFu8; 16];
        raw[0..4].copy_from_slice(&TRIGGER_MAGIC.to_le_bytes());
        raw[4..8].copy_from_slice(&TRIGGER_ENTER.to_le_bytes());
        let crc = IMAGE_CRC.checksum(&raw[0..8]);
        raw[8..12].copy_from_slice(&crc.to_le_bytes());
        let write_len = TRIGGER_BYTES.next_multiple_of(F::WRITE_SIZE.max(1)).min(raw.len());
        self.flash
            .write(page, &raw[..write_len])
            .map_err(|_| FlashError::Operation)
    }

    /// Disarm the trigger page.
    pub fn clear_trigger(&mut self) -> Result<(), FlashError> {
        let page = self.layout.trigger.ok_or(FlashError::OutOfRange)?;
        self.flash
            .erase(page, page + F::ERASE_SIZE as u32)
            .map_err(|_| FlashError::Operation)
    }

    pub fn release(self) -> F {
        self.flash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::write_image;
    use crate::instruction::{Instruction, Op};
    use crate::sim::SimFlash;

    const FLASH_BYTES: usize = 0x1_0000;

    fn manager() -> BankManager<SimFlash<FLASH_BYTES>> {
        BankManager::new(SimFlash::new(), Layout::default()).unwrap()
    }

    fn sample_image(version: u16, buf: &mut [u8]) -> usize {
        let instrs = [
            Instruction::new(Op::Push, 10),
            Instruction::new(Op::Push, 20),
            Instruction::plain(Op::Add),
            Instruction::plain(Op::Halt),
        ];
        write_image(version, &instrs, &["done"], buf).unwrap()
    }

    fn program_image(mgr: &mut BankManager<SimFlash<FLASH_BYTES>>, bank: Bank, image: &[u8]) {
        mgr.erase_bank(bank).unwrap();
        let mut at = 0;
        while at < image.len() {
            let mut word = [0xFFu8; 8];
            let n = (image.len() - at).min(8);
            word[..n].copy_from_slice(&image[at..at + n]);
            mgr.program_aligned(bank, at as u32, &word).unwrap();
            at += 8;
        }
    }

    #[test]
    fn metadata_round_trip() {
        let meta = BankMetadata {
            version: 7,
            size: 1234,
            crc32: 0xDEAD_BEEF,
            active: Bank::B,
        };
        assert_eq!(BankMetadata::decode(&meta.encode()), Some(meta));

        let mut bad = meta.encode();
        bad[0] ^= 1;
        assert_eq!(BankMetadata::decode(&bad), None);
    }

    #[test]
    fn layout_validation() {
        // metadata page not erase-aligned
        let layout = Layout {
            metadata: 0xF004,
            ..Layout::default()
        };
        assert!(matches!(
            BankManager::<SimFlash<FLASH_BYTES>>::new(SimFlash::new(), layout),
            Err(FlashError::NotAligned)
        ));

        // bank extends past the device
        let layout = Layout {
            bank_b: 0xF800,
            ..Layout::default()
        };
        assert!(matches!(
            BankManager::<SimFlash<FLASH_BYTES>>::new(SimFlash::new(), layout),
            Err(FlashError::OutOfRange)
        ));
    }

    #[test]
    fn program_alignment_is_enforced() {
        let mut mgr = manager();
        mgr.erase_bank(Bank::A).unwrap();
        assert_eq!(
            mgr.program_aligned(Bank::A, 4, &[0u8; 8]),
            Err(FlashError::NotAligned)
        );
        assert_eq!(
            mgr.program_aligned(Bank::A, 0, &[0u8; 4]),
            Err(FlashError::NotAligned)
        );
        let end = mgr.bank_size();
        assert_eq!(
            mgr.program_aligned(Bank::A, end, &[0u8; 8]),
            Err(FlashError::OutOfRange)
        );
    }

    #[test]
    fn commit_then_active_bank() {
        let mut mgr = manager();
        let mut buf = [0u8; 128];
        let len = sample_image(2, &mut buf);
        program_image(&mut mgr, Bank::B, &buf[..len]);

        let crc32 = mgr.bank_crc32(Bank::B, len as u32).unwrap();
        mgr.commit_metadata(&BankMetadata {
            version: 2,
            size: len as u32,
            crc32,
            active: Bank::B,
        })
        .unwrap();

        let (bank, meta) = mgr.active_bank().unwrap();
        assert_eq!(bank, Bank::B);
        assert_eq!(meta.size, len as u32);
        assert_eq!(meta.crc32, crc32);
    }

    #[test]
    fn corrupt_metadata_recovers_by_probing() {
        let mut mgr = manager();
        let mut buf = [0u8; 128];
        let len = sample_image(3, &mut buf);
        program_image(&mut mgr, Bank::A, &buf[..len]);

        // no metadata at all
        let (bank, meta) = mgr.active_bank().unwrap();
        assert_eq!(bank, Bank::A);
        assert_eq!(meta.version, 3);
        assert_eq!(meta.size as usize, len);
    }

    #[test]
    fn recovery_prefers_higher_version() {
        let mut mgr = manager();
        let mut buf = [0u8; 128];
        let len_a = sample_image(1, &mut buf);
        program_image(&mut mgr, Bank::A, &buf[..len_a]);
        let len_b = sample_image(5, &mut buf);
        program_image(&mut mgr, Bank::B, &buf[..len_b]);

        let (bank, meta) = mgr.recover().unwrap();
        assert_eq!(bank, Bank::B);
        assert_eq!(meta.version, 5);
    }

    #[test]
    fn erased_banks_probe_as_absent() {
        let mut mgr = manager();
        mgr.erase_bank(Bank::A).unwrap();
        mgr.erase_bank(Bank::B).unwrap();
        assert!(mgr.active_bank().is_none());
    }

    #[test]
    fn trigger_page_round_trip() {
        let mut mgr = manager();
        assert!(!mgr.read_trigger());
        mgr.write_trigger().unwrap();
        assert!(mgr.read_trigger());
        mgr.clear_trigger().unwrap();
        assert!(!mgr.read_trigger());
    }
}
