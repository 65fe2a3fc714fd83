//! Shared application state for the operator surface.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::health::HealthMonitor;
use crate::port::NozzleLink;
use crate::supervisor::{OperatorCommand, StatusSnapshot};

use super::auth::{Authenticate, SessionStore};

/// Everything the route handlers need, shared behind one `Arc`.
pub struct AppState {
    /// Command channel into the supervisor.
    pub commands: mpsc::Sender<OperatorCommand>,
    /// Latest supervisor snapshot.
    pub status: watch::Receiver<StatusSnapshot>,
    /// Operator-contact watch refresh target.
    pub health: Arc<HealthMonitor>,
    /// Direct port access for the hls/uart diagnostics.
    pub port: Arc<dyn NozzleLink>,
    /// Session tokens and outstanding challenges.
    pub sessions: SessionStore,
    /// Credential verifier (the weak digest scheme, replaceable).
    pub authenticator: Arc<dyn Authenticate>,
    /// Where multipart uploads land.
    pub upload_dir: PathBuf,
}
