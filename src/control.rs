//! Control Plane
//!
//! TigerStyle: Operators turn the fault dials over HTTP while traffic flows.
//!
//! An update is a JSON document with one `u16` field per hook. Applying it
//! overwrites all 14 store entries: a field left out of the document is zero,
//! so every update is a full replace.
//!
//! ```text
//! POST /status  {"pre_write": 5, "post_mkdir": 17}   -> 200, resulting config
//! GET  /status                                        -> 200, current config
//! ```

use crate::fault::{HookId, Operation, Phase};
use crate::store::{FaultStore, SharedFaultStore};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::net::TcpListener;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Default control plane bind address
pub const CONTROL_BIND_ADDRESS_DEFAULT: &str = "0.0.0.0:32768";

/// Route for reading and replacing the fault configuration
pub const STATUS_PATH: &str = "/status";

/// Maximum update body size in bytes
pub const UPDATE_BODY_BYTES_MAX: usize = 64 * 1024;

// =============================================================================
// Update Document
// =============================================================================

/// One fault code per hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultUpdate {
    pub pre_open: u16,
    pub post_open: u16,
    pub pre_read: u16,
    pub post_read: u16,
    pub pre_write: u16,
    pub post_write: u16,
    pub pre_mkdir: u16,
    pub post_mkdir: u16,
    pub pre_rmdir: u16,
    pub post_rmdir: u16,
    pub pre_open_dir: u16,
    pub post_open_dir: u16,
    pub pre_fsync: u16,
    pub post_fsync: u16,
}

impl FaultUpdate {
    /// Code this document carries for `hook`.
    #[must_use]
    pub fn get(&self, hook: HookId) -> u16 {
        let mut copy = *self;
        *copy.slot(hook)
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, hook: HookId, code: u16) -> Self {
        *self.slot(hook) = code;
        self
    }

    /// Overwrite every store entry with this document.
    pub fn apply(&self, store: &FaultStore) {
        for hook in HookId::all() {
            store.set(hook, self.get(hook));
        }
    }

    /// Read the store back into a document.
    #[must_use]
    pub fn from_store(store: &FaultStore) -> Self {
        store
            .snapshot()
            .into_iter()
            .fold(Self::default(), |update, (hook, code)| update.with(hook, code))
    }

    fn slot(&mut self, hook: HookId) -> &mut u16 {
        use Operation::*;
        use Phase::{Post, Pre};

        match (hook.operation, hook.phase) {
            (Open, Pre) => &mut self.pre_open,
            (Open, Post) => &mut self.post_open,
            (Read, Pre) => &mut self.pre_read,
            (Read, Post) => &mut self.post_read,
            (Write, Pre) => &mut self.pre_write,
            (Write, Post) => &mut self.post_write,
            (Mkdir, Pre) => &mut self.pre_mkdir,
            (Mkdir, Post) => &mut self.post_mkdir,
            (Rmdir, Pre) => &mut self.pre_rmdir,
            (Rmdir, Post) => &mut self.post_rmdir,
            (OpenDir, Pre) => &mut self.pre_open_dir,
            (OpenDir, Post) => &mut self.post_open_dir,
            (Fsync, Pre) => &mut self.pre_fsync,
            (Fsync, Post) => &mut self.post_fsync,
        }
    }
}

/// Decode an update body. An empty body is an empty document.
pub fn decode_update(body: &[u8]) -> Result<FaultUpdate, ControlError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(FaultUpdate::default());
    }
    Ok(serde_json::from_slice(body)?)
}

// =============================================================================
// HTTP
// =============================================================================

/// Routes of the control plane.
pub fn router(store: SharedFaultStore) -> Router {
    Router::new()
        .route(STATUS_PATH, get(get_status).post(update_status))
        .with_state(store)
}

/// Serve the control plane on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    store: SharedFaultStore,
    shutdown: F,
) -> Result<(), ControlError>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!(addr = ?listener.local_addr().ok(), "control plane listening");
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// `GET /status`
pub async fn get_status(State(store): State<SharedFaultStore>) -> Json<FaultUpdate> {
    Json(FaultUpdate::from_store(&store))
}

/// `POST /status`
pub async fn update_status(
    State(store): State<SharedFaultStore>,
    body: Bytes,
) -> Result<Json<FaultUpdate>, ControlError> {
    if body.len() > UPDATE_BODY_BYTES_MAX {
        return Err(ControlError::BodyTooLarge {
            len: body.len(),
            max: UPDATE_BODY_BYTES_MAX,
        });
    }

    let update = match decode_update(&body) {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!(error = %e, "rejected fault update");
            return Err(e);
        }
    };

    update.apply(&store);

    let active: Vec<String> = store
        .active()
        .map(|(hook, code)| format!("{hook}={code}"))
        .collect();
    tracing::info!(active = ?active, "fault configuration replaced");

    Ok(Json(FaultUpdate::from_store(&store)))
}

// =============================================================================
// Errors
// =============================================================================

/// Control plane errors
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid update body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("update body too large: {len} > {max}")]
    BodyTooLarge { len: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::Errno;

    #[test]
    fn test_decode_uses_wire_names() {
        let update = decode_update(
            br#"{"pre_open": 5, "post_open_dir": 1, "pre_fsync": 40000}"#,
        )
        .unwrap();

        assert_eq!(update.get(HookId::pre(Operation::Open)), 5);
        assert_eq!(update.get(HookId::post(Operation::OpenDir)), 1);
        assert_eq!(update.get(HookId::pre(Operation::Fsync)), 40000);
        assert_eq!(update.get(HookId::post(Operation::Open)), 0);
    }

    #[test]
    fn test_decode_empty_body() {
        assert_eq!(decode_update(b"").unwrap(), FaultUpdate::default());
        assert_eq!(decode_update(b"  \n").unwrap(), FaultUpdate::default());
        assert_eq!(decode_update(b"{}").unwrap(), FaultUpdate::default());
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(decode_update(b"not json").is_err());
        assert!(decode_update(br#"{"pre_open": 70000}"#).is_err());
        assert!(decode_update(br#"{"pre_open": -1}"#).is_err());
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let update = decode_update(br#"{"pre_unlink": 5, "post_write": 28}"#).unwrap();
        assert_eq!(update, FaultUpdate::default().with(HookId::post(Operation::Write), 28));
    }

    #[test]
    fn test_apply_is_full_replace() {
        let store = FaultStore::new();
        store.set(HookId::pre(Operation::Read), 5);

        FaultUpdate::default()
            .with(HookId::post(Operation::Mkdir), Errno::EEXIST.code())
            .apply(&store);

        assert_eq!(store.get(HookId::pre(Operation::Read)), 0);
        assert_eq!(store.get(HookId::post(Operation::Mkdir)), 17);
    }

    #[test]
    fn test_apply_twice_same_as_once() {
        let update = FaultUpdate {
            pre_write: 5,
            post_open: 32770,
            ..Default::default()
        };
        let once = FaultStore::new();
        update.apply(&once);
        let twice = FaultStore::new();
        update.apply(&twice);
        update.apply(&twice);
        assert_eq!(once.snapshot(), twice.snapshot());
    }

    #[test]
    fn test_every_hook_has_its_own_field() {
        let mut update = FaultUpdate::default();
        for hook in HookId::all() {
            update = update.with(hook, hook.index() as u16 + 100);
        }
        let store = FaultStore::new();
        update.apply(&store);
        for hook in HookId::all() {
            assert_eq!(store.get(hook), hook.index() as u16 + 100, "{hook}");
        }
        assert_eq!(FaultUpdate::from_store(&store), update);
    }

    #[tokio::test]
    async fn test_update_handler_applies() {
        let store = FaultStore::shared();
        let body = Bytes::from_static(br#"{"pre_write": 5}"#);

        let Json(result) = update_status(State(store.clone()), body).await.unwrap();

        assert_eq!(result.pre_write, 5);
        assert_eq!(store.get(HookId::pre(Operation::Write)), 5);
    }

    #[tokio::test]
    async fn test_update_handler_rejects_without_change() {
        let store = FaultStore::shared();
        store.set(HookId::pre(Operation::Write), 5);

        let err = update_status(State(store.clone()), Bytes::from_static(b"{bad"))
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::InvalidBody(_)));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.get(HookId::pre(Operation::Write)), 5);
    }

    #[tokio::test]
    async fn test_update_handler_rejects_oversized_body() {
        let store = FaultStore::shared();
        store.set(HookId::pre(Operation::Open), 13);
        let body = Bytes::from(vec![b' '; UPDATE_BODY_BYTES_MAX + 1]);

        let err = update_status(State(store.clone()), body).await.unwrap_err();

        assert!(matches!(err, ControlError::BodyTooLarge { .. }));
        assert_eq!(err.into_response().status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(store.get(HookId::pre(Operation::Open)), 13);
    }

    #[test]
    fn test_get_handler_reads_store() {
        let store = FaultStore::shared();
        store.set(HookId::post(Operation::Fsync), 1);
        let Json(status) = tokio_test::block_on(get_status(State(store)));
        assert_eq!(status.post_fsync, 1);
    }
}
