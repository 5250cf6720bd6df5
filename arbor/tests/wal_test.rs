use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use arbor::log_op::LogOperation;
use arbor::wal::{LogBody, WalManager, FIRST_LSN};
use arbor::{PageId, NO_LSN};
use tempfile::tempdir;

fn allocation(number: u32) -> LogBody {
    LogBody::Update(LogOperation::AllocatePage {
        page: PageId::new(0, number),
        unit: 3,
    })
}

#[test]
fn test_append_flush_and_read_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.wal");
    let wal = WalManager::open(&path, 256).unwrap();
    assert_eq!(wal.next_lsn(), FIRST_LSN);

    let mut lsns = Vec::new();
    let mut prev = NO_LSN;
    for i in 0..40 {
        prev = wal.append(7, prev, NO_LSN, &allocation(i)).unwrap();
        lsns.push(prev);
    }
    let commit = wal.append(7, prev, NO_LSN, &LogBody::Commit { deferred: vec![(PageId::new(0, 2), 3)] }).unwrap();

    // Records still in the buffer and records already written out read the same.
    let record = wal.read_record(lsns[39]).unwrap();
    assert_eq!(record.body, allocation(39));
    assert_eq!(record.prev_lsn, lsns[38]);
    assert!(wal.flushed_lsn() <= commit);

    wal.flush(commit).unwrap();
    assert!(wal.flushed_lsn() > commit);
    drop(wal);

    let wal = WalManager::open(&path, 256).unwrap();
    let records: Vec<_> = wal.records(FIRST_LSN).map(Result::unwrap).collect();
    assert_eq!(records.len(), 41);
    assert!(records.iter().take(40).all(|r| r.tx_id == 7 && r.is_redoable()));
    assert_eq!(records[0].lsn, FIRST_LSN);
    assert_eq!(records[12].body, allocation(12));
    assert_eq!(
        records[40].body,
        LogBody::Commit {
            deferred: vec![(PageId::new(0, 2), 3)]
        }
    );
    assert_eq!(wal.next_lsn(), records[40].end_lsn());
}

#[test]
fn test_torn_tail_is_cut_on_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("torn.wal");
    let (second, end) = {
        let wal = WalManager::open(&path, 1024).unwrap();
        let first = wal.append(1, NO_LSN, NO_LSN, &allocation(1)).unwrap();
        let second = wal.append(1, first, NO_LSN, &allocation(2)).unwrap();
        wal.flush_all().unwrap();
        (second, wal.next_lsn())
    };

    // Half of the second record made it to disk.
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(second + (end - second) / 2).unwrap();
    drop(file);

    let wal = WalManager::open(&path, 1024).unwrap();
    assert_eq!(wal.next_lsn(), second);
    assert_eq!(wal.records(FIRST_LSN).count(), 1);
    assert!(wal.read_record(second).is_err());

    // New records continue where the valid prefix ended.
    let lsn = wal.append(2, NO_LSN, NO_LSN, &LogBody::Abort).unwrap();
    assert_eq!(lsn, second);
}

#[test]
fn test_corrupt_record_ends_the_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.wal");
    let (second, third) = {
        let wal = WalManager::open(&path, 1024).unwrap();
        wal.append(1, NO_LSN, NO_LSN, &allocation(1)).unwrap();
        let second = wal.append(1, NO_LSN, NO_LSN, &allocation(2)).unwrap();
        let third = wal.append(1, second, NO_LSN, &allocation(3)).unwrap();
        wal.flush_all().unwrap();
        (second, third)
    };

    // Flip the last payload byte of the second record.
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(third - 1)).unwrap();
    file.write_all(&[0xAA]).unwrap();
    drop(file);

    let wal = WalManager::open(&path, 1024).unwrap();
    assert_eq!(wal.next_lsn(), second);
    assert_eq!(wal.records(FIRST_LSN).count(), 1);
}

#[test]
fn test_foreign_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("foreign.wal");
    std::fs::write(&path, b"NOTAWALFILE").unwrap();
    assert!(WalManager::open(&path, 1024).is_err());
}
