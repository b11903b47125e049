//! HTTP client for the control plane's queue, event, and context APIs.

mod control_plane;

pub use control_plane::{ControlPlaneClient, QueueEntry, WorkerEvent};
