//! RocksDB-backed board store.
//!
//! Column families:
//! - `boards` — full board records (list/card tree), bincode + LZ4
//! - `meta`   — board metadata (name, owner, version counter, timestamps)
//!
//! A save writes both families in one `WriteBatch`, which is the atomic
//! transactional boundary the mutation processor relies on: either the new
//! board state and its advanced version land together, or neither does.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

use plank_core::{Board, BoardMeta};

/// Column family names.
const CF_BOARDS: &str = "boards";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_BOARDS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("plank_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Board not found
    NotFound(Uuid),
    /// Board id already taken
    AlreadyExists(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Board not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "Board already exists: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

fn encode_meta(meta: &BoardMeta) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(meta, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode_meta(bytes: &[u8]) -> Result<BoardMeta, StoreError> {
    let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(meta)
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed board store.
///
/// Shared across the server via `Arc`; RocksDB handles concurrent reads and
/// writes internally, and per-board write ordering is enforced above this
/// layer by the mutation processor's board locks.
pub struct BoardStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl BoardStore {
    /// Open the board store at the configured path, creating the database
    /// and column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(&config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Column-family options: point-lookup workload, LZ4 at the table level.
    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Serialize and LZ4-compress a board record.
    fn encode_board(board: &Board) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(board, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_board(compressed: &[u8]) -> Result<Board, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (board, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(board)
    }

    /// Create a new board. Fails if the id is already taken.
    pub fn create_board(&self, board: &Board) -> Result<BoardMeta, StoreError> {
        if self.board_exists(board.id)? {
            return Err(StoreError::AlreadyExists(board.id));
        }

        let now = now_epoch_secs();
        let meta = BoardMeta {
            id: board.id,
            name: board.name.clone(),
            owner_id: board.owner_id,
            version: board.version,
            created_at: now,
            updated_at: now,
        };
        self.write_board(board, &meta)?;
        log::info!("created board {} ({})", board.id, board.name);
        Ok(meta)
    }

    /// Persist a board's current state and version.
    ///
    /// One `WriteBatch` covers both column families: the record and its
    /// version counter advance together or not at all.
    pub fn save_board(&self, board: &Board) -> Result<BoardMeta, StoreError> {
        let created_at = match self.load_meta(board.id) {
            Ok(meta) => meta.created_at,
            Err(StoreError::NotFound(_)) => return Err(StoreError::NotFound(board.id)),
            Err(e) => return Err(e),
        };

        let meta = BoardMeta {
            id: board.id,
            name: board.name.clone(),
            owner_id: board.owner_id,
            version: board.version,
            created_at,
            updated_at: now_epoch_secs(),
        };
        self.write_board(board, &meta)?;
        Ok(meta)
    }

    fn write_board(&self, board: &Board, meta: &BoardMeta) -> Result<(), StoreError> {
        let cf_boards = self.cf(CF_BOARDS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();
        let key = board.id.as_bytes().to_vec();
        batch.put_cf(&cf_boards, &key, Self::encode_board(board)?);
        batch.put_cf(&cf_meta, &key, encode_meta(meta)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    /// Load a full board record.
    pub fn load_board(&self, board_id: Uuid) -> Result<Board, StoreError> {
        let cf = self.cf(CF_BOARDS)?;
        match self.db.get_cf(&cf, board_id.as_bytes())? {
            Some(compressed) => Self::decode_board(&compressed),
            None => Err(StoreError::NotFound(board_id)),
        }
    }

    /// Load a board's metadata without decoding the list/card tree.
    pub fn load_meta(&self, board_id: Uuid) -> Result<BoardMeta, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, board_id.as_bytes())? {
            Some(bytes) => decode_meta(&bytes),
            None => Err(StoreError::NotFound(board_id)),
        }
    }

    pub fn board_exists(&self, board_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, board_id.as_bytes())?.is_some())
    }

    /// Delete a board and its metadata atomically.
    pub fn delete_board(&self, board_id: Uuid) -> Result<(), StoreError> {
        if !self.board_exists(board_id)? {
            return Err(StoreError::NotFound(board_id));
        }
        let cf_boards = self.cf(CF_BOARDS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_boards, board_id.as_bytes());
        batch.delete_cf(&cf_meta, board_id.as_bytes());
        self.db.write_opt(batch, &self.write_opts())?;
        log::info!("deleted board {board_id}");
        Ok(())
    }

    /// All boards owned by `owner_id`, most recently updated first.
    pub fn list_boards(&self, owner_id: Uuid) -> Result<Vec<BoardMeta>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut metas = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (_, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let meta = decode_meta(&value)?;
            if meta.owner_id == owner_id {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(metas)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plank_core::{Card, List};

    fn open_store(dir: &tempfile::TempDir) -> BoardStore {
        BoardStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn sample_board() -> Board {
        let mut board = Board::new(Uuid::new_v4(), "Sprint", Uuid::new_v4());
        let mut list = List::new(Uuid::new_v4(), "todo", 0);
        list.cards.push(Card::new(Uuid::new_v4(), "write tests", 0));
        board.lists.push(list);
        board
    }

    #[test]
    fn test_create_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let board = sample_board();

        let meta = store.create_board(&board).unwrap();
        assert_eq!(meta.version, 0);
        assert_eq!(meta.name, "Sprint");

        let loaded = store.load_board(board.id).unwrap();
        assert_eq!(loaded, board);
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let board = sample_board();

        store.create_board(&board).unwrap();
        let err = store.create_board(&board).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == board.id));
    }

    #[test]
    fn test_save_advances_version_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut board = sample_board();
        let created = store.create_board(&board).unwrap().created_at;

        board.version = 1;
        board.lists[0].title = "doing".into();
        let meta = store.save_board(&board).unwrap();

        assert_eq!(meta.version, 1);
        assert_eq!(meta.created_at, created);
        assert_eq!(store.load_board(board.id).unwrap().lists[0].title, "doing");
    }

    #[test]
    fn test_save_unknown_board_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let board = sample_board();
        assert!(matches!(
            store.save_board(&board),
            Err(StoreError::NotFound(id)) if id == board.id
        ));
    }

    #[test]
    fn test_load_missing_board() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let id = Uuid::new_v4();
        assert!(matches!(store.load_board(id), Err(StoreError::NotFound(got)) if got == id));
    }

    #[test]
    fn test_delete_board() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let board = sample_board();
        store.create_board(&board).unwrap();

        store.delete_board(board.id).unwrap();
        assert!(!store.board_exists(board.id).unwrap());
        assert!(matches!(
            store.delete_board(board.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_boards_filters_owner_orders_by_recency() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let owner = Uuid::new_v4();

        let mut first = Board::new(Uuid::new_v4(), "first", owner);
        let second = Board::new(Uuid::new_v4(), "second", owner);
        let foreign = Board::new(Uuid::new_v4(), "other", Uuid::new_v4());

        store.create_board(&first).unwrap();
        store.create_board(&second).unwrap();
        store.create_board(&foreign).unwrap();

        // Touch the first board so it sorts ahead on equal timestamps or later.
        first.version = 1;
        store.save_board(&first).unwrap();

        let listed = store.list_boards(owner).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|m| m.owner_id == owner));
    }

    #[test]
    fn test_version_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let mut board = sample_board();

        {
            let store = BoardStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.create_board(&board).unwrap();
            board.version = 5;
            store.save_board(&board).unwrap();
        }

        let store = BoardStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_meta(board.id).unwrap().version, 5);
        assert_eq!(store.load_board(board.id).unwrap(), board);
    }
}
