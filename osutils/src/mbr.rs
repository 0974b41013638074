//! Writes MBR partition tables, including chained extended boot records, straight into a disk
//! image.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::Path,
};

use log::{debug, info, trace, warn};

pub const SECTOR_SIZE: u64 = 512;

// Classic CHS geometry limits, also the saturating value for larger LBAs.
const HEADS_PER_CYLINDER: u64 = 254;
const SECTORS_PER_TRACK: u64 = 63;
const MAX_CYLINDERS: u64 = 1023;

const DISK_ID_OFFSET: u64 = 440;
const PARTITION_TABLE_OFFSET: u64 = 446;
const PARTITION_ENTRY_SIZE: u64 = 16;
const SIGNATURE_OFFSET: u64 = 510;
const SIGNATURE: u16 = 0xAA55;

const BOOT_FLAG: u8 = 0x80;
const PRIMARY_SLOTS: u32 = 4;

pub const PARTITION_TYPE_EXTENDED_CHS: u8 = 0x05;
pub const PARTITION_TYPE_EXTENDED_LBA: u8 = 0x0F;

#[derive(Debug, thiserror::Error)]
pub enum MbrError {
    #[error("Failed to access partition table: {0}")]
    Io(#[from] io::Error),

    #[error("Disk size {0} is not a multiple of {SECTOR_SIZE} bytes")]
    InvalidDiskSize(u64),

    #[error("Alignment {0} is not a non-zero multiple of {SECTOR_SIZE} bytes")]
    InvalidAlignment(u64),

    #[error("All primary partitions must be given first")]
    PrimaryAfterExtended,

    #[error("No free slot in the MBR for partition {0}")]
    NoFreeSlot(u32),

    #[error("Partition ending at block {end} does not fit on a disk of {blocks} blocks")]
    NoSpace { end: u64, blocks: u64 },

    #[error("Block {0} cannot be addressed in an MBR")]
    AddressOutOfRange(u64),
}

/// Converts a logical block address to (cylinder, head, sector), saturating at the largest
/// geometry CHS can express.
pub fn lba_to_chs(lba: u64) -> (u64, u64, u64) {
    if lba > HEADS_PER_CYLINDER * SECTORS_PER_TRACK * MAX_CYLINDERS {
        return (MAX_CYLINDERS, HEADS_PER_CYLINDER, SECTORS_PER_TRACK);
    }

    let cylinder = lba / (HEADS_PER_CYLINDER * SECTORS_PER_TRACK);
    let head = (lba / SECTORS_PER_TRACK) % HEADS_PER_CYLINDER;
    let sector = lba % SECTORS_PER_TRACK + 1;
    (cylinder, head, sector)
}

/// Packs a CHS triple into its on-disk form: head, sector with the two high cylinder bits on
/// top, then the low eight cylinder bits.
pub fn encode_chs((cylinder, head, sector): (u64, u64, u64)) -> [u8; 3] {
    [
        head as u8,
        ((sector & 0x3F) | ((cylinder >> 2) & 0xC0)) as u8,
        (cylinder & 0xFF) as u8,
    ]
}

/// An MBR partition table being written to an image file.
///
/// Primary partitions go into the four MBR slots. The first non-primary partition claims the
/// next free slot for an extended partition spanning the rest of the disk; each logical
/// partition then gets its own EBR and the previous EBR is rewritten to link to it.
#[derive(Debug)]
pub struct Mbr {
    file: File,
    disk_size: u64,
    disk_blocks: u64,
    alignment_blocks: u64,

    /// Start of the extended partition, once there is one.
    extended_start: Option<u64>,
    next_free: u64,
    /// Last EBR written, 0 while there is none.
    last_ebr: u64,
    partition_number: u32,
    closed: bool,
}

impl Mbr {
    /// Opens the image for writing and stamps a random disk id and the boot signature.
    pub fn open(path: impl AsRef<Path>, disk_size: u64, alignment: u64) -> Result<Self, MbrError> {
        if disk_size % SECTOR_SIZE != 0 {
            return Err(MbrError::InvalidDiskSize(disk_size));
        }
        if alignment == 0 || alignment % SECTOR_SIZE != 0 {
            return Err(MbrError::InvalidAlignment(alignment));
        }

        info!(
            "Writing MBR to '{}' ({disk_size} bytes, alignment {alignment})",
            path.as_ref().display()
        );
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let mut mbr = Mbr {
            file,
            disk_size,
            disk_blocks: disk_size / SECTOR_SIZE,
            alignment_blocks: alignment / SECTOR_SIZE,
            extended_start: None,
            next_free: 0,
            last_ebr: 0,
            partition_number: 0,
            closed: false,
        };

        let disk_id: u32 = rand::random();
        mbr.file
            .write_all_at(&disk_id.to_le_bytes(), DISK_ID_OFFSET)?;
        mbr.write_signature(0)?;
        mbr.next_free = mbr.align(1);
        Ok(mbr)
    }

    /// Rounds a block number up to the next multiple of the alignment.
    pub fn align(&self, block: u64) -> u64 {
        block.div_ceil(self.alignment_blocks) * self.alignment_blocks
    }

    /// Bytes left after the last partition, keeping one alignment unit for the next EBR.
    pub fn free(&self) -> u64 {
        self.disk_size
            .saturating_sub((self.next_free + self.align(1)) * SECTOR_SIZE)
    }

    /// Adds the next partition and returns its number (1-4 for primaries, 5 onwards for logical
    /// partitions).
    pub fn add_partition(
        &mut self,
        primary: bool,
        boot: bool,
        size: u64,
        partition_type: u8,
    ) -> Result<u32, MbrError> {
        debug!(
            "Adding partition primary [{primary}] boot [{boot}] size [{size}] type [{partition_type:#x}]"
        );

        if primary {
            if self.extended_start.is_some() {
                return Err(MbrError::PrimaryAfterExtended);
            }
            return self.add_primary(boot, size, partition_type);
        }

        if self.extended_start.is_none() {
            if self.partition_number >= PRIMARY_SLOTS {
                return Err(MbrError::NoFreeSlot(self.partition_number + 1));
            }
            let start = self.next_free;
            self.write_entry(
                false,
                0,
                self.partition_number,
                PARTITION_TYPE_EXTENDED_LBA,
                start,
                self.disk_blocks.saturating_sub(start),
            )?;
            self.extended_start = Some(start);
            self.partition_number = PRIMARY_SLOTS;
        }

        self.add_logical(boot, size, partition_type)
    }

    /// Flushes and syncs the table to disk.
    pub fn close(mut self) -> Result<(), MbrError> {
        self.closed = true;
        self.file.sync_all()?;
        Ok(())
    }

    fn add_primary(&mut self, boot: bool, size: u64, partition_type: u8) -> Result<u32, MbrError> {
        if self.partition_number >= PRIMARY_SLOTS {
            return Err(MbrError::NoFreeSlot(self.partition_number + 1));
        }

        let (start, length, end) = self.partition_lbas(self.next_free, size)?;
        self.write_entry(boot, 0, self.partition_number, partition_type, start, length)?;

        self.next_free = end;
        self.partition_number += 1;
        trace!("Next free block [{}]", self.next_free);
        Ok(self.partition_number)
    }

    fn add_logical(&mut self, boot: bool, size: u64, partition_type: u8) -> Result<u32, MbrError> {
        let extended_start = self.extended_start.unwrap_or(self.next_free);
        let ebr = self.next_free;
        let (_, length, end) = self.partition_lbas(ebr + 1, size)?;

        if self.last_ebr != 0 {
            self.write_entry(
                false,
                self.last_ebr,
                1,
                PARTITION_TYPE_EXTENDED_CHS,
                ebr - extended_start,
                end - ebr,
            )?;
        }

        // The logical partition starts one alignment unit after its EBR.
        self.write_entry(boot, ebr, 0, partition_type, self.align(1), length)?;
        self.write_signature(ebr)?;

        self.next_free = end;
        self.last_ebr = ebr;
        self.partition_number += 1;
        trace!("EBR at block [{ebr}], next free block [{}]", self.next_free);
        Ok(self.partition_number)
    }

    /// Returns the aligned start, the length and the aligned end, all in blocks.
    fn partition_lbas(&self, start: u64, size: u64) -> Result<(u64, u64, u64), MbrError> {
        let start = self.align(start);
        let length = size / SECTOR_SIZE;
        let end = self.align(start + length);
        if end > self.disk_blocks {
            return Err(MbrError::NoSpace {
                end,
                blocks: self.disk_blocks,
            });
        }
        trace!("Partition start [{start}] length [{length}] end [{end}]");
        Ok((start, length, end))
    }

    fn write_entry(
        &self,
        boot: bool,
        block: u64,
        entry: u32,
        partition_type: u8,
        lba_start: u64,
        lba_length: u64,
    ) -> Result<(), MbrError> {
        debug!(
            "Writing partition entry block [{block}] entry [{entry}] start [{lba_start}] length [{lba_length}]"
        );
        let start = u32::try_from(lba_start).map_err(|_| MbrError::AddressOutOfRange(lba_start))?;
        let length =
            u32::try_from(lba_length).map_err(|_| MbrError::AddressOutOfRange(lba_length))?;

        let mut raw = [0u8; PARTITION_ENTRY_SIZE as usize];
        raw[0] = if boot { BOOT_FLAG } else { 0 };
        raw[1..4].copy_from_slice(&encode_chs(lba_to_chs(lba_start)));
        raw[4] = partition_type;
        raw[5..8].copy_from_slice(&encode_chs(lba_to_chs(lba_start + lba_length)));
        raw[8..12].copy_from_slice(&start.to_le_bytes());
        raw[12..16].copy_from_slice(&length.to_le_bytes());

        let offset =
            block * SECTOR_SIZE + PARTITION_TABLE_OFFSET + PARTITION_ENTRY_SIZE * u64::from(entry);
        self.file.write_all_at(&raw, offset)?;
        Ok(())
    }

    fn write_signature(&self, block: u64) -> Result<(), MbrError> {
        self.file
            .write_all_at(&SIGNATURE.to_le_bytes(), block * SECTOR_SIZE + SIGNATURE_OFFSET)?;
        Ok(())
    }
}

impl Drop for Mbr {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.file.sync_all() {
                warn!("Failed to sync partition table: {e}");
            }
        }
    }
}
