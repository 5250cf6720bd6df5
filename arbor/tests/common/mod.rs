#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use arbor::field::encode_int;
use arbor::{BlinkIndex, Field, Store, StoreConfig, Tx};

pub fn config(dir: &Path) -> StoreConfig {
    StoreConfig::default()
        .with_data_dir(dir)
        .with_buffer_pool_size(256)
        .with_lock_timeout(Duration::from_millis(500))
}

pub fn open_store(dir: &Path) -> Store {
    Store::open(config(dir)).unwrap()
}

pub fn int_index(store: &Store, tx: &Tx, unique: bool) -> BlinkIndex {
    store
        .create_index(tx, "ints", Field::Int, Field::Bytes, unique)
        .unwrap()
}

pub fn key(i: i32) -> [u8; 4] {
    encode_int(i)
}

pub fn value(i: i32) -> Vec<u8> {
    format!("value-{i:06}").into_bytes()
}

/// Every key of the index in scan order, decoded.
pub fn keys(index: &BlinkIndex, tx: &Tx) -> Vec<i32> {
    index
        .scan(tx, None)
        .map(|entry| arbor::field::decode_int(&entry.unwrap().0).unwrap())
        .collect()
}
