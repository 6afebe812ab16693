//! WAL durability and recovery integration tests.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use graphd::{GraphdError, OpType, Wal};
use tempfile::tempdir;

#[test]
fn basic_append_and_replay() {
    let dir = tempdir().unwrap();
    {
        let wal = Wal::open(dir.path()).unwrap();
        assert_eq!(wal.append(OpType::CreateNode, b"node1").unwrap(), 1);
        assert_eq!(wal.append(OpType::CreateEdge, b"edge1").unwrap(), 2);
        assert_eq!(wal.append(OpType::CreateNode, b"node2").unwrap(), 3);
        wal.close().unwrap();
    }

    let wal = Wal::open(dir.path()).unwrap();
    let mut records = Vec::new();
    wal.replay(|record| {
        records.push((record.lsn, record.op_type, record.payload));
        Ok(())
    })
    .unwrap();

    assert_eq!(
        records,
        vec![
            (1, OpType::CreateNode, b"node1".to_vec()),
            (2, OpType::CreateEdge, b"edge1".to_vec()),
            (3, OpType::CreateNode, b"node2".to_vec()),
        ]
    );
    assert_eq!(wal.current_lsn(), 3);
}

#[test]
fn lsns_are_strictly_serial_with_no_gaps() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path()).unwrap();

    let mut previous = 0;
    for i in 0..100u32 {
        let lsn = wal
            .append(OpType::CreateNode, format!("n{i}").as_bytes())
            .unwrap();
        assert_eq!(lsn, previous + 1);
        previous = lsn;
    }
}

#[test]
fn durable_records_survive_reopen_without_close() {
    let dir = tempdir().unwrap();
    let payload = b"must survive".to_vec();
    {
        // Dropped without close, as after a process kill; append has already
        // fsynced.
        let wal = Wal::open(dir.path()).unwrap();
        wal.append(OpType::UpdateNode, &payload).unwrap();
    }

    let wal = Wal::open(dir.path()).unwrap();
    let mut recovered = Vec::new();
    wal.replay(|record| {
        recovered.push(record);
        Ok(())
    })
    .unwrap();

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].lsn, 1);
    assert_eq!(recovered[0].op_type, OpType::UpdateNode);
    assert_eq!(recovered[0].payload, payload);
    assert_eq!(recovered[0].checksum, crc32_of(&payload));
}

#[test]
fn corruption_recovery_keeps_valid_prefix() {
    let dir = tempdir().unwrap();
    let path = {
        let wal = Wal::open(dir.path()).unwrap();
        wal.append(OpType::CreateNode, b"node1").unwrap();
        wal.append(OpType::CreateEdge, b"edge1").unwrap();
        wal.append(OpType::CreateNode, b"node2").unwrap();
        wal.close().unwrap();
        wal.path()
    };

    let len = std::fs::metadata(&path).unwrap().len();
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(len - 10)).unwrap();
    file.write_all(&[0u8; 10]).unwrap();
    drop(file);

    let wal = Wal::open(dir.path()).unwrap();
    let mut records = Vec::new();
    wal.replay(|record| {
        records.push(record.lsn);
        Ok(())
    })
    .unwrap();

    assert_eq!(records, vec![1, 2]);
    assert_eq!(wal.current_lsn(), 2);
}

#[test]
fn corruption_mid_file_truncates_from_there() {
    let dir = tempdir().unwrap();
    let path = {
        let wal = Wal::open(dir.path()).unwrap();
        for i in 0..5u32 {
            wal.append(OpType::CreateNode, format!("n{i}").as_bytes())
                .unwrap();
        }
        wal.close().unwrap();
        wal.path()
    };

    // Flip a payload byte in the middle of the file; everything from that
    // record on is discarded.
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    let frame = 13 + 2 + 12; // prefix + "nX" + suffix
    file.seek(SeekFrom::Start((frame * 2 + 14) as u64)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    drop(file);

    let wal = Wal::open(dir.path()).unwrap();
    assert_eq!(wal.current_lsn(), 2);
}

#[test]
fn truncate_then_replay_is_empty() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path()).unwrap();
    wal.append(OpType::CreateNode, b"n1").unwrap();
    wal.append(OpType::CreateEdge, b"e1").unwrap();

    wal.truncate().unwrap();
    assert_eq!(wal.current_lsn(), 0);

    let mut count = 0;
    wal.replay(|_| {
        count += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(count, 0);

    // Idempotent: truncating an already-empty log is still empty.
    wal.truncate().unwrap();
    assert_eq!(wal.current_lsn(), 0);
}

#[test]
fn failed_append_reports_error_and_preserves_sequence() {
    let dir = tempdir().unwrap();
    let wal = Wal::open_with(
        dir.path(),
        graphd::WalOptions {
            max_payload_len: 16,
        },
    )
    .unwrap();

    wal.append(OpType::CreateNode, b"fits").unwrap();
    let err = wal
        .append(OpType::CreateNode, b"this payload is larger than sixteen bytes")
        .unwrap_err();
    assert!(matches!(err, GraphdError::Storage(_)));

    assert_eq!(wal.current_lsn(), 1);
    assert_eq!(wal.append(OpType::CreateNode, b"next").unwrap(), 2);
}

fn crc32_of(data: &[u8]) -> u32 {
    // Record::new computes CRC32/IEEE over the stored payload.
    graphd::Record::new(0, OpType::CreateNode, data.to_vec(), 0).checksum
}
