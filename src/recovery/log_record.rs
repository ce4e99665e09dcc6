use bytes::{Buf, BufMut, BytesMut};

use crate::common::value::{decode_row, decode_string, encode_row, encode_string, Row};
use crate::common::{
    current_timestamp, Lsn, PageId, Timestamp, TxnId, INVALID_LSN, MAX_LOG_RECORD_SIZE,
};
use crate::error::{DbError, Result};

/// Log record kinds. The discriminants are the on-disk kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LogRecordKind {
    Insert = 1,
    MarkDelete = 2,
    ApplyDelete = 3,
    RollbackDelete = 4,
    Update = 5,
    Begin = 6,
    Commit = 7,
    Abort = 8,
    CheckpointBegin = 9,
    CheckpointEnd = 10,
    Clr = 11,
    CreateTable = 12,
    DropTable = 13,
    CreateDb = 14,
    DropDb = 15,
    SwitchDb = 16,
}

impl LogRecordKind {
    pub fn from_i32(value: i32) -> Result<Self> {
        Ok(match value {
            1 => Self::Insert,
            2 => Self::MarkDelete,
            3 => Self::ApplyDelete,
            4 => Self::RollbackDelete,
            5 => Self::Update,
            6 => Self::Begin,
            7 => Self::Commit,
            8 => Self::Abort,
            9 => Self::CheckpointBegin,
            10 => Self::CheckpointEnd,
            11 => Self::Clr,
            12 => Self::CreateTable,
            13 => Self::DropTable,
            14 => Self::CreateDb,
            15 => Self::DropDb,
            16 => Self::SwitchDb,
            other => return Err(DbError::UnknownKind(other)),
        })
    }

    /// True for the kinds that mutate table data.
    pub fn is_data_mutation(self) -> bool {
        matches!(
            self,
            Self::Insert
                | Self::MarkDelete
                | Self::ApplyDelete
                | Self::RollbackDelete
                | Self::Update
                | Self::Clr
        )
    }

    pub fn is_delete(self) -> bool {
        matches!(
            self,
            Self::MarkDelete | Self::ApplyDelete | Self::RollbackDelete
        )
    }
}

/// One entry of the Active Transaction Table carried by CHECKPOINT_END.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTxnEntry {
    pub txn_id: TxnId,
    pub last_lsn: Lsn,
    pub first_lsn: Lsn,
}

/// One entry of the Dirty Page Table carried by CHECKPOINT_END.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyPageEntry {
    pub page_id: PageId,
    pub recovery_lsn: Lsn,
}

/// A write-ahead log record.
///
/// Wire layout (little-endian):
/// `[size:i32][lsn:i32][prev_lsn:i32][undo_next_lsn:i32][txn_id:i32]`
/// `[timestamp:u64][kind:i32][db_name][body][crc:u32]`
/// where `size` covers the whole record including the size field and the
/// trailing crc, and strings are `[len:u32][bytes]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub size: i32,
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub undo_next_lsn: Lsn,
    pub txn_id: TxnId,
    pub timestamp: Timestamp,
    pub kind: LogRecordKind,
    pub db_name: String,
    pub table_name: String,
    /// Undo image: the old row for UPDATE and the DELETE variants.
    pub old_value: Option<Row>,
    /// Redo image: the new row for INSERT/UPDATE, the compensation row for CLR.
    pub new_value: Option<Row>,
    pub active_txns: Vec<ActiveTxnEntry>,
    pub dirty_pages: Vec<DirtyPageEntry>,
}

impl LogRecord {
    fn base(txn_id: TxnId, kind: LogRecordKind) -> Self {
        Self {
            size: 0,
            lsn: INVALID_LSN,
            prev_lsn: INVALID_LSN,
            undo_next_lsn: INVALID_LSN,
            txn_id,
            timestamp: current_timestamp(),
            kind,
            db_name: String::new(),
            table_name: String::new(),
            old_value: None,
            new_value: None,
            active_txns: Vec::new(),
            dirty_pages: Vec::new(),
        }
    }

    /// BEGIN / COMMIT / ABORT.
    pub fn lifecycle(txn_id: TxnId, kind: LogRecordKind) -> Self {
        Self::base(txn_id, kind)
    }

    pub fn insert(txn_id: TxnId, table: &str, new_row: Row) -> Self {
        let mut rec = Self::base(txn_id, LogRecordKind::Insert);
        rec.table_name = table.to_string();
        rec.new_value = Some(new_row);
        rec
    }

    pub fn update(txn_id: TxnId, table: &str, old_row: Row, new_row: Row) -> Self {
        let mut rec = Self::base(txn_id, LogRecordKind::Update);
        rec.table_name = table.to_string();
        rec.old_value = Some(old_row);
        rec.new_value = Some(new_row);
        rec
    }

    pub fn delete(kind: LogRecordKind, txn_id: TxnId, table: &str, old_row: Row) -> Self {
        debug_assert!(kind.is_delete());
        let mut rec = Self::base(txn_id, kind);
        rec.table_name = table.to_string();
        rec.old_value = Some(old_row);
        rec
    }

    /// Compensation record for one undo step.
    pub fn clr(txn_id: TxnId, table: &str, compensation: Row, undo_next_lsn: Lsn) -> Self {
        let mut rec = Self::base(txn_id, LogRecordKind::Clr);
        rec.table_name = table.to_string();
        rec.new_value = Some(compensation);
        rec.undo_next_lsn = undo_next_lsn;
        rec
    }

    /// CREATE_TABLE / DROP_TABLE.
    pub fn ddl_table(kind: LogRecordKind, txn_id: TxnId, table: &str) -> Self {
        let mut rec = Self::base(txn_id, kind);
        rec.table_name = table.to_string();
        rec
    }

    /// CREATE_DB / DROP_DB / SWITCH_DB; the database name rides the header.
    pub fn ddl_db(kind: LogRecordKind, db: &str) -> Self {
        let mut rec = Self::base(0, kind);
        rec.db_name = db.to_string();
        rec
    }

    pub fn checkpoint_begin() -> Self {
        Self::base(0, LogRecordKind::CheckpointBegin)
    }

    pub fn checkpoint_end(active_txns: Vec<ActiveTxnEntry>, dirty_pages: Vec<DirtyPageEntry>) -> Self {
        let mut rec = Self::base(0, LogRecordKind::CheckpointEnd);
        rec.active_txns = active_txns;
        rec.dirty_pages = dirty_pages;
        rec
    }

    pub fn has_table(&self) -> bool {
        !self.table_name.is_empty()
    }

    /// Serialize to the wire layout, patching the size and appending the crc.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i32_le(0); // size, patched below
        buf.put_i32_le(self.lsn);
        buf.put_i32_le(self.prev_lsn);
        buf.put_i32_le(self.undo_next_lsn);
        buf.put_i32_le(self.txn_id);
        buf.put_u64_le(self.timestamp);
        buf.put_i32_le(self.kind as i32);
        encode_string(&mut buf, &self.db_name);

        match self.kind {
            LogRecordKind::Insert => {
                encode_string(&mut buf, &self.table_name);
                encode_row(&mut buf, self.new_value.as_deref().unwrap_or(&[]));
            }
            LogRecordKind::Update => {
                encode_string(&mut buf, &self.table_name);
                encode_row(&mut buf, self.old_value.as_deref().unwrap_or(&[]));
                encode_row(&mut buf, self.new_value.as_deref().unwrap_or(&[]));
            }
            LogRecordKind::MarkDelete
            | LogRecordKind::ApplyDelete
            | LogRecordKind::RollbackDelete => {
                encode_string(&mut buf, &self.table_name);
                encode_row(&mut buf, self.old_value.as_deref().unwrap_or(&[]));
            }
            LogRecordKind::Clr => {
                encode_string(&mut buf, &self.table_name);
                encode_row(&mut buf, self.new_value.as_deref().unwrap_or(&[]));
            }
            LogRecordKind::CreateTable | LogRecordKind::DropTable => {
                encode_string(&mut buf, &self.table_name);
            }
            LogRecordKind::CheckpointEnd => {
                buf.put_u32_le(self.active_txns.len() as u32);
                for entry in &self.active_txns {
                    buf.put_i32_le(entry.txn_id);
                    buf.put_i32_le(entry.last_lsn);
                    buf.put_i32_le(entry.first_lsn);
                }
                buf.put_u32_le(self.dirty_pages.len() as u32);
                for entry in &self.dirty_pages {
                    buf.put_i32_le(entry.page_id);
                    buf.put_i32_le(entry.recovery_lsn);
                }
            }
            // Lifecycle, checkpoint begin and database DDL are header-only.
            _ => {}
        }

        let size = (buf.len() + 4) as i32;
        buf[0..4].copy_from_slice(&size.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.to_vec()
    }

    /// Decode one record from the front of `input`. Returns the record and
    /// its total encoded size.
    pub fn decode(input: &[u8]) -> Result<(Self, usize)> {
        if input.len() < 4 {
            return Err(DbError::ShortRead("log record size prefix".to_string()));
        }
        let size = i32::from_le_bytes(input[..4].try_into().unwrap());
        if size < 36 || size as usize > MAX_LOG_RECORD_SIZE {
            return Err(DbError::Serialization(format!(
                "implausible log record size {}",
                size
            )));
        }
        let size = size as usize;
        if input.len() < size {
            return Err(DbError::ShortRead(format!(
                "log record of {} bytes, {} available",
                size,
                input.len()
            )));
        }

        let stored_crc = u32::from_le_bytes(input[size - 4..size].try_into().unwrap());
        let computed_crc = crc32fast::hash(&input[..size - 4]);
        if stored_crc != computed_crc {
            return Err(DbError::ChecksumMismatch(
                "log record crc does not match".to_string(),
            ));
        }

        let mut buf = &input[4..size - 4];
        let lsn = buf.get_i32_le();
        let prev_lsn = buf.get_i32_le();
        let undo_next_lsn = buf.get_i32_le();
        let txn_id = buf.get_i32_le();
        let timestamp = buf.get_u64_le();
        let kind = LogRecordKind::from_i32(buf.get_i32_le())?;
        let db_name = decode_string(&mut buf)?;

        let mut record = Self {
            size: size as i32,
            lsn,
            prev_lsn,
            undo_next_lsn,
            txn_id,
            timestamp,
            kind,
            db_name,
            table_name: String::new(),
            old_value: None,
            new_value: None,
            active_txns: Vec::new(),
            dirty_pages: Vec::new(),
        };

        match kind {
            LogRecordKind::Insert => {
                record.table_name = decode_string(&mut buf)?;
                record.new_value = Some(decode_row(&mut buf)?);
            }
            LogRecordKind::Update => {
                record.table_name = decode_string(&mut buf)?;
                record.old_value = Some(decode_row(&mut buf)?);
                record.new_value = Some(decode_row(&mut buf)?);
            }
            LogRecordKind::MarkDelete
            | LogRecordKind::ApplyDelete
            | LogRecordKind::RollbackDelete => {
                record.table_name = decode_string(&mut buf)?;
                record.old_value = Some(decode_row(&mut buf)?);
            }
            LogRecordKind::Clr => {
                record.table_name = decode_string(&mut buf)?;
                record.new_value = Some(decode_row(&mut buf)?);
            }
            LogRecordKind::CreateTable | LogRecordKind::DropTable => {
                record.table_name = decode_string(&mut buf)?;
            }
            LogRecordKind::CheckpointEnd => {
                if buf.remaining() < 4 {
                    return Err(DbError::ShortRead("checkpoint ATT length".to_string()));
                }
                let att_len = buf.get_u32_le() as usize;
                for _ in 0..att_len {
                    if buf.remaining() < 12 {
                        return Err(DbError::ShortRead("checkpoint ATT entry".to_string()));
                    }
                    record.active_txns.push(ActiveTxnEntry {
                        txn_id: buf.get_i32_le(),
                        last_lsn: buf.get_i32_le(),
                        first_lsn: buf.get_i32_le(),
                    });
                }
                if buf.remaining() < 4 {
                    return Err(DbError::ShortRead("checkpoint DPT length".to_string()));
                }
                let dpt_len = buf.get_u32_le() as usize;
                for _ in 0..dpt_len {
                    if buf.remaining() < 8 {
                        return Err(DbError::ShortRead("checkpoint DPT entry".to_string()));
                    }
                    record.dirty_pages.push(DirtyPageEntry {
                        page_id: buf.get_i32_le(),
                        recovery_lsn: buf.get_i32_le(),
                    });
                }
            }
            _ => {}
        }

        Ok((record, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::value::Value;

    fn sample_row() -> Row {
        vec![Value::Int(1), Value::Text("a".to_string())]
    }

    #[test]
    fn test_insert_record_round_trip() {
        let mut rec = LogRecord::insert(3, "t", sample_row());
        rec.lsn = 10;
        rec.prev_lsn = 9;
        rec.db_name = "franco".to_string();

        let bytes = rec.encode();
        let (decoded, consumed) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.lsn, 10);
        assert_eq!(decoded.prev_lsn, 9);
        assert_eq!(decoded.txn_id, 3);
        assert_eq!(decoded.kind, LogRecordKind::Insert);
        assert_eq!(decoded.db_name, "franco");
        assert_eq!(decoded.table_name, "t");
        assert_eq!(decoded.new_value, Some(sample_row()));
        assert_eq!(decoded.timestamp, rec.timestamp);
    }

    #[test]
    fn test_update_record_carries_both_images() {
        let old = sample_row();
        let new = vec![Value::Int(1), Value::Text("b".to_string())];
        let mut rec = LogRecord::update(7, "t", old.clone(), new.clone());
        rec.lsn = 40;

        let bytes = rec.encode();
        let (decoded, _) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.old_value, Some(old));
        assert_eq!(decoded.new_value, Some(new));
    }

    #[test]
    fn test_checkpoint_end_round_trip() {
        let att = vec![ActiveTxnEntry {
            txn_id: 2,
            last_lsn: 17,
            first_lsn: 11,
        }];
        let dpt = vec![DirtyPageEntry {
            page_id: 4,
            recovery_lsn: 12,
        }];
        let mut rec = LogRecord::checkpoint_end(att.clone(), dpt.clone());
        rec.lsn = 18;

        let bytes = rec.encode();
        let (decoded, _) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, LogRecordKind::CheckpointEnd);
        assert_eq!(decoded.active_txns, att);
        assert_eq!(decoded.dirty_pages, dpt);
    }

    #[test]
    fn test_corrupted_crc_is_detected() {
        let rec = LogRecord::lifecycle(1, LogRecordKind::Begin);
        let mut bytes = rec.encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            LogRecord::decode(&bytes),
            Err(DbError::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let rec = LogRecord::lifecycle(1, LogRecordKind::Begin);
        let mut bytes = rec.encode();
        // Kind lives after size + 4 i32s + u64 = 4 + 16 + 8 = byte 28.
        bytes[28..32].copy_from_slice(&99i32.to_le_bytes());
        // Re-seal the crc so only the kind is wrong.
        let len = bytes.len();
        let crc = crc32fast::hash(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            LogRecord::decode(&bytes),
            Err(DbError::UnknownKind(99))
        ));
    }

    #[test]
    fn test_truncated_record_is_a_short_read() {
        let rec = LogRecord::insert(1, "t", sample_row());
        let bytes = rec.encode();
        assert!(matches!(
            LogRecord::decode(&bytes[..bytes.len() - 6]),
            Err(DbError::ShortRead(_))
        ));
    }
}
