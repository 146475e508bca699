pub mod alert;
pub mod chain;
pub mod checkpoint;
pub mod processor;
pub mod supervisor;
pub mod types;

pub use alert::{AlertGate, AlertSink, LogAlertSink, WebhookAlertSink};
pub use chain::{Connection, EventSource, RpcEventSource, Subscription};
pub use checkpoint::{CheckpointError, CheckpointStore, DbCheckpointStore};
pub use processor::{
    EventHandler, EventProcessor, ProcessError, RegistryReader, RequestRepository, Settlement,
    TreeOwnership, TreeStateReader,
};
pub use supervisor::{ListenerConfig, ListenerError, ListenerState, ListenerSupervisor};
pub use types::{BlockBatch, ChainEvent, ConnectionSignal, ConnectionState, StreamOptions, TreeEvent};
