pub mod cdc;

pub use cdc::{
    ChangeEvent, ConsumerHealth, KafkaLogClient, LogClient, MemoryLogClient, RawMessage,
    SyncEngine, SyncEngineConfig, TableRouter,
};
