pub mod core;
pub mod storage;
pub mod schema;
pub mod index;
pub mod writer;

pub use crate::core::config::Config;
pub use crate::core::database::Database;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::stats::{DatabaseMode, DatabaseStats, FileStats};
pub use crate::core::types::{Record, RecordNumber};
pub use crate::index::record_list::RecordList;
pub use crate::schema::schema::FileSpec;
pub use crate::storage::engine::Engine;
pub use crate::storage::file_engine::FileEngine;
pub use crate::storage::memory::MemoryEngine;
pub use crate::storage::segment_size::SegmentSize;

/*
┌──────────────────────────────────── SEGSTORE ARCHITECTURE ───────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────────── CORE ──────────────────────────────┐                        │
│  │ struct Database<E: Engine>                                       │                        │
│  │ • engine: Option<E>          // opened by open_database          │                        │
│  │ • spec: FileSpec             // files and indexed fields         │                        │
│  │ • config: Config             // requested segment size, ...      │                        │
│  │ • state: Closed | Open { size, store, ebms, mode }               │                        │
│  │ • mode:  Normal | Deferred { staging, initial_high }             │                        │
│  └──────────────────────────────────────────────────────────────────┘                        │
│             │ normal: insert/remove             │ deferred: add, merged at update points     │
│             ▼                                   ▼                                            │
│  ┌──────────── INDEX ─────────────┐   ┌──────────── WRITER ───────────────┐                  │
│  │ IndexValueStore                │◄──│ Merger (one transaction per field)│                  │
│  │ • SegmentTableCache (LRU)      │   │ DeferredStagingArea               │                  │
│  │ • SegmentTable per value       │   │ • (file, field) → value → segment │                  │
│  │ RecordList                     │   └───────────────────────────────────┘                  │
│  └────────────────────────────────┘                                                          │
│             │                                                                                │
│             ▼                                                                                │
│  ┌──────────────────────────────── STORAGE ─────────────────────────────────┐                │
│  │ SegmentSize → SegmentCodec (List | Bitmap) → ExistenceBitmap per file    │                │
│  │ KeyLayout:  {file}_{field}_{value}[_segment_{n}]  {file}_ebm[_{n}]       │                │
│  │ trait Engine: MemoryEngine | FileEngine (DataLog + FileLock)             │                │
│  └──────────────────────────────────────────────────────────────────────────┘                │
└──────────────────────────────────────────────────────────────────────────────────────────────┘
*/
