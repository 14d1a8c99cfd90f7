// ABOUTME: Change-data-capture table reader and its collaborators
// ABOUTME: Reader loop, tail accumulator, watermark stores, sinker and PostgreSQL writer

pub mod atomic_batch;
pub mod batch;
pub mod key;
pub mod output;
pub mod postgres_writer;
pub mod reader;
pub mod registry;
pub mod routine;
pub mod sinker;
pub mod source;
pub mod table;
pub mod timestamp;
pub mod watermark;

pub use atomic_batch::{merge_tail, AtomicBatch, RowKey, TailChange};
pub use batch::{Batch, Value};
pub use output::{ChangeRange, DecoderOutput, OutputKind};
pub use postgres_writer::PostgresWriter;
pub use reader::{
    ReaderConfig, ReaderExit, ReplicationMode, RoundOutcome, SnapshotTxnPolicy, TableReader,
};
pub use registry::{ReaderInfo, ReaderRegistry, Registration};
pub use routine::{ActiveRoutine, StopSignal};
pub use sinker::{AsyncSinker, SinkError, SinkWriter, Sinker};
pub use source::{
    is_stale_read, ChangeFragment, ChangeHandle, ChangeSource, Hint, SnapshotTxn, StaleRead,
    TxnEngine,
};
pub use table::{TableDef, TableKey};
pub use timestamp::Timestamp;
pub use watermark::{MemoryWatermarkStore, SqliteWatermarkStore, WatermarkRecord, WatermarkStore};
