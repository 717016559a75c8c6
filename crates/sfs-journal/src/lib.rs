#![forbid(unsafe_code)]
//! Journal region management.
//!
//! The journal is a reserved slot array of 256-byte transaction records in
//! the 64 blocks between the inode table and the data region. A
//! begin/commit/abort API writes records and `uncommitted_transactions`
//! scans them back, but the recovery path never replays the journal — it is
//! structural scaffolding for a future write-ahead-logged design. The only
//! hard requirement is that its bytes never alias the inode table or the
//! data area.

use sfs_alloc::FsGeometry;
use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{JournalOp, JournalRecord, JOURNAL_RECORD_BLOCKS};
use sfs_types::{BlockNumber, InodeNumber, TransactionId, BLOCK_SIZE, JOURNAL_RECORDS_PER_BLOCK,
    JOURNAL_RECORD_SIZE};
use tracing::{debug, trace};

/// Handle over the journal region of one image.
#[derive(Debug, Clone)]
pub struct Journal {
    start: u32,
    blocks: u32,
    next_transaction_id: u32,
}

impl Journal {
    /// Open the journal, scanning existing records for the highest
    /// transaction id so new transactions continue the sequence.
    pub fn open(dev: &dyn BlockDevice, geo: &FsGeometry) -> Result<Self> {
        let mut journal = Self {
            start: geo.journal_start,
            blocks: geo.journal_blocks,
            next_transaction_id: 1,
        };

        for index in 0..journal.max_records() {
            if let Some(record) = journal.read_record(dev, index)? {
                if record.transaction_id.0 >= journal.next_transaction_id {
                    journal.next_transaction_id = record.transaction_id.0 + 1;
                }
            }
        }

        debug!(
            target: "sfs::journal",
            event = "opened",
            next_transaction_id = journal.next_transaction_id
        );
        Ok(journal)
    }

    /// Total record slots in the region.
    #[must_use]
    pub fn max_records(&self) -> u32 {
        self.blocks * JOURNAL_RECORDS_PER_BLOCK as u32
    }

    /// Zero the whole region and restart the transaction sequence.
    pub fn clear(&mut self, dev: &dyn BlockDevice) -> Result<()> {
        let zeros = vec![0_u8; BLOCK_SIZE as usize];
        for i in 0..self.blocks {
            dev.write_block(BlockNumber(self.start + i), &zeros)?;
        }
        self.next_transaction_id = 1;
        debug!(target: "sfs::journal", event = "cleared");
        Ok(())
    }

    /// Start a transaction record in the first free slot.
    pub fn begin_transaction(
        &mut self,
        dev: &dyn BlockDevice,
        op: JournalOp,
        inode: InodeNumber,
        parent: InodeNumber,
        filename: &str,
        now: i64,
    ) -> Result<TransactionId> {
        let slot = self.find_free_slot(dev)?.ok_or(SfsError::NoSpace)?;

        let id = TransactionId(self.next_transaction_id);
        self.next_transaction_id += 1;

        let record = JournalRecord {
            transaction_id: id,
            op,
            committed: false,
            timestamp: now,
            inode,
            parent_inode: parent,
            blocks: Vec::new(),
            filename: filename.to_owned(),
        };
        self.write_record(dev, slot, &record)?;
        trace!(target: "sfs::journal", event = "begin", transaction = id.0, op = op.to_raw());
        Ok(id)
    }

    /// Append a block number to a pending transaction record.
    pub fn add_block_to_transaction(
        &self,
        dev: &dyn BlockDevice,
        id: TransactionId,
        block: BlockNumber,
    ) -> Result<()> {
        let (slot, mut record) = self.find_transaction(dev, id)?;
        if record.blocks.len() >= JOURNAL_RECORD_BLOCKS {
            return Err(SfsError::InvalidArgument(format!(
                "transaction {id} already carries {JOURNAL_RECORD_BLOCKS} blocks"
            )));
        }
        record.blocks.push(block);
        self.write_record(dev, slot, &record)
    }

    /// Mark a transaction committed.
    pub fn commit_transaction(&self, dev: &dyn BlockDevice, id: TransactionId) -> Result<()> {
        let (slot, mut record) = self.find_transaction(dev, id)?;
        record.committed = true;
        self.write_record(dev, slot, &record)?;
        trace!(target: "sfs::journal", event = "commit", transaction = id.0);
        Ok(())
    }

    /// Abort a transaction by zeroing its slot.
    pub fn abort_transaction(&self, dev: &dyn BlockDevice, id: TransactionId) -> Result<()> {
        let (slot, _) = self.find_transaction(dev, id)?;
        self.zero_record(dev, slot)?;
        trace!(target: "sfs::journal", event = "abort", transaction = id.0);
        Ok(())
    }

    /// Collect every live record with `committed == false`.
    pub fn uncommitted_transactions(&self, dev: &dyn BlockDevice) -> Result<Vec<JournalRecord>> {
        let mut pending = Vec::new();
        for index in 0..self.max_records() {
            if let Some(record) = self.read_record(dev, index)? {
                if !record.committed {
                    pending.push(record);
                }
            }
        }
        Ok(pending)
    }

    // ── Slot I/O ────────────────────────────────────────────────────────────

    fn slot_location(&self, index: u32) -> (BlockNumber, usize) {
        let block = self.start + index / JOURNAL_RECORDS_PER_BLOCK as u32;
        let offset = (index as usize % JOURNAL_RECORDS_PER_BLOCK) * JOURNAL_RECORD_SIZE;
        (BlockNumber(block), offset)
    }

    fn read_record(&self, dev: &dyn BlockDevice, index: u32) -> Result<Option<JournalRecord>> {
        let (block, offset) = self.slot_location(index);
        let data = dev.read_block(block)?;
        JournalRecord::parse(&data[offset..offset + JOURNAL_RECORD_SIZE])
            .map_err(|e| SfsError::Corrupted(format!("journal slot {index}: {e}")))
    }

    fn write_record(
        &self,
        dev: &dyn BlockDevice,
        index: u32,
        record: &JournalRecord,
    ) -> Result<()> {
        let (block, offset) = self.slot_location(index);
        let mut data = dev.read_block(block)?;
        data[offset..offset + JOURNAL_RECORD_SIZE].copy_from_slice(&record.serialize());
        dev.write_block(block, &data)
    }

    fn zero_record(&self, dev: &dyn BlockDevice, index: u32) -> Result<()> {
        let (block, offset) = self.slot_location(index);
        let mut data = dev.read_block(block)?;
        data[offset..offset + JOURNAL_RECORD_SIZE].fill(0);
        dev.write_block(block, &data)
    }

    fn find_free_slot(&self, dev: &dyn BlockDevice) -> Result<Option<u32>> {
        for index in 0..self.max_records() {
            if self.read_record(dev, index)?.is_none() {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn find_transaction(
        &self,
        dev: &dyn BlockDevice,
        id: TransactionId,
    ) -> Result<(u32, JournalRecord)> {
        for index in 0..self.max_records() {
            if let Some(record) = self.read_record(dev, index)? {
                if record.transaction_id == id {
                    return Ok((index, record));
                }
            }
        }
        Err(SfsError::NotFound(format!("transaction {id}")))
    }
}
